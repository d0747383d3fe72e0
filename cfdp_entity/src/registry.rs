//! Static table of known entities, built once at startup.

use std::collections::HashMap;
use std::time::Duration;

use cfdp_protocol::{ChecksumType, EntityId, MAX_SEGMENT_LEN, TransmissionMode};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("entity {0} not found")]
    NotFound(EntityId),
    #[error("entity {0} registered twice")]
    Duplicate(EntityId),
    #[error("entity {new} cannot be local, {existing} already is")]
    SecondLocal { existing: EntityId, new: EntityId },
    #[error("entity {id}: segment size {size} outside 1..={MAX_SEGMENT_LEN}")]
    InvalidSegmentSize { id: EntityId, size: usize },
    #[error("entity {id}: {field} must be non-zero")]
    ZeroTimeout { id: EntityId, field: &'static str },
    #[error("no local entity registered")]
    NoLocalEntity,
}

/// Per-entity protocol parameters. For a remote entity they govern every
/// transaction exchanged with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityConfig {
    pub entity_id: EntityId,
    pub is_local: bool,
    pub default_class: TransmissionMode,
    pub closure_requested_default: bool,
    pub segment_size: usize,
    pub ack_timeout: Duration,
    pub max_retries: u32,
    pub inactivity_timeout: Duration,
    pub checksum_type: ChecksumType,
    /// Append a CRC trailer to every PDU sent to this entity.
    pub crc: bool,
}

impl EntityConfig {
    pub fn new(entity_id: EntityId, is_local: bool) -> Self {
        Self {
            entity_id,
            is_local,
            default_class: TransmissionMode::Acknowledged,
            closure_requested_default: true,
            segment_size: 1024,
            ack_timeout: Duration::from_secs(2),
            max_retries: 4,
            inactivity_timeout: Duration::from_secs(30),
            checksum_type: ChecksumType::Modular,
            crc: false,
        }
    }

    fn validate(&self) -> Result<(), RegistryError> {
        let id = self.entity_id;
        if self.segment_size == 0 || self.segment_size > MAX_SEGMENT_LEN {
            return Err(RegistryError::InvalidSegmentSize { id, size: self.segment_size });
        }
        if self.ack_timeout.is_zero() {
            return Err(RegistryError::ZeroTimeout { id, field: "ack_timeout" });
        }
        if self.inactivity_timeout.is_zero() {
            return Err(RegistryError::ZeroTimeout { id, field: "inactivity_timeout" });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: HashMap<EntityId, EntityConfig>,
    local: Option<EntityId>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entity: EntityConfig) -> Result<(), RegistryError> {
        entity.validate()?;
        let id = entity.entity_id;
        if self.entities.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        if entity.is_local {
            if let Some(existing) = self.local {
                return Err(RegistryError::SecondLocal { existing, new: id });
            }
            self.local = Some(id);
        }
        self.entities.insert(id, entity);
        Ok(())
    }

    pub fn lookup(&self, id: EntityId) -> Result<&EntityConfig, RegistryError> {
        self.entities.get(&id).ok_or(RegistryError::NotFound(id))
    }

    pub fn local(&self) -> Result<&EntityConfig, RegistryError> {
        self.local
            .and_then(|id| self.entities.get(&id))
            .ok_or(RegistryError::NoLocalEntity)
    }

    pub fn remotes(&self) -> impl Iterator<Item = &EntityConfig> {
        self.entities.values().filter(|e| !e.is_local)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
