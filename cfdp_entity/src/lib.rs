//! CFDP transfer engine: entity registry, per-transaction state machines,
//! the transaction manager and a UDP link for running it as a daemon.

pub mod commands;
pub mod config;
pub mod errors;
pub mod filestore;
pub mod logging;
pub mod manager;
pub mod net;
pub mod ranges;
pub mod registry;
pub mod timer;
pub mod transaction;

pub use errors::EngineError;
pub use filestore::{ConflictPolicy, DirectoryStore, FileMetadata, FileStore, MemoryStore, StoreError};
pub use manager::{ManagerStats, PduSink, TransactionManager};
pub use ranges::RangeSet;
pub use registry::{EntityConfig, EntityRegistry, RegistryError};
pub use transaction::{Outcome, Role, TransactionSummary, TransferReport};
