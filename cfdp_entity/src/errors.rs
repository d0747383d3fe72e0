// thiserror-based error types for the engine's caller-facing contract
use cfdp_protocol::{EncodeError, EntityId, TransactionId};
use thiserror::Error;

use crate::registry::RegistryError;

/// Returned only for contract violations by the caller; protocol faults
/// travel through `TransferReport` instead.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("entity {0} is not configured")]
    UnknownEntity(EntityId),
    #[error("no transaction {0}")]
    UnknownTransaction(TransactionId),
    #[error("cannot transfer to the local entity {0}")]
    SelfTransfer(EntityId),
    #[error("transaction {0} already finished")]
    AlreadyTerminal(TransactionId),
    #[error("encode: {0}")]
    Encode(#[from] EncodeError),
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),
}
