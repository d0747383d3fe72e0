//! Per-transaction state machines.
//!
//! Machines are synchronous: every inbound PDU, timer expiry or user command
//! is one call that mutates the transaction and records its side effects
//! (PDUs to send, the completion report) in an [`Effects`] buffer. The
//! manager flushes that buffer to the link afterwards.

pub mod receiver;
pub mod sender;

use std::time::Instant;

use cfdp_protocol::{
    ChecksumType, ConditionCode, DeliveryCode, EntityId, FileStatus, Pdu, PromptKind,
    TransactionId, TransmissionMode,
};
use serde::{Deserialize, Serialize};

use crate::filestore::FileStore;

pub use receiver::{ReceiverState, ReceiverTransaction};
pub use sender::{SenderState, SenderTransaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Complete,
    Incomplete,
    Cancelled,
    Failed,
}

/// Exactly one per transaction, emitted when it reaches a final state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    pub id: TransactionId,
    pub role: Role,
    pub outcome: Outcome,
    pub condition: ConditionCode,
    /// `None` when no Finished PDU was exchanged (class 1 without closure).
    pub delivery: Option<DeliveryCode>,
    pub file_status: Option<FileStatus>,
    pub file_name: String,
    pub file_size: u64,
    pub stored_as: Option<String>,
    pub store_error: Option<String>,
}

/// Fixed at creation from Metadata (receiver) or the start request (sender).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferInfo {
    pub id: TransactionId,
    pub peer: EntityId,
    pub mode: TransmissionMode,
    pub closure_requested: bool,
    pub source_file: String,
    pub destination_file: String,
    pub file_size: u64,
    pub checksum_type: ChecksumType,
}

impl TransferInfo {
    fn report(&self, role: Role, outcome: Outcome, condition: ConditionCode) -> TransferReport {
        let file_name = match role {
            Role::Sender => self.source_file.clone(),
            Role::Receiver => self.destination_file.clone(),
        };
        TransferReport {
            id: self.id,
            role,
            outcome,
            condition,
            delivery: None,
            file_status: None,
            file_name,
            file_size: self.file_size,
            stored_as: None,
            store_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionSummary {
    pub id: TransactionId,
    pub role: Role,
    pub class: u8,
    pub peer: EntityId,
    pub state: String,
    pub file_name: String,
    pub file_size: u64,
    /// Distinct bytes sent or received so far.
    pub progress: u64,
    pub suspended: bool,
    pub terminal: bool,
}

/// Side effects of one event.
pub struct Effects<'a> {
    pub now: Instant,
    store: &'a dyn FileStore,
    pdus: Vec<Pdu>,
    reports: Vec<TransferReport>,
}

impl<'a> Effects<'a> {
    pub fn new(now: Instant, store: &'a dyn FileStore) -> Self {
        Self { now, store, pdus: Vec::new(), reports: Vec::new() }
    }

    pub fn send(&mut self, pdu: Pdu) {
        self.pdus.push(pdu);
    }

    pub fn report(&mut self, report: TransferReport) {
        self.reports.push(report);
    }

    pub fn store(&self) -> &'a dyn FileStore {
        self.store
    }

    pub fn pdus(&self) -> &[Pdu] {
        &self.pdus
    }

    pub fn reports(&self) -> &[TransferReport] {
        &self.reports
    }

    pub fn into_parts(self) -> (Vec<Pdu>, Vec<TransferReport>) {
        (self.pdus, self.reports)
    }
}

#[derive(Debug)]
pub enum Transaction {
    Sender(SenderTransaction),
    Receiver(ReceiverTransaction),
}

impl Transaction {
    pub fn id(&self) -> TransactionId {
        self.info().id
    }

    pub fn info(&self) -> &TransferInfo {
        match self {
            Transaction::Sender(t) => t.info(),
            Transaction::Receiver(t) => t.info(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Transaction::Sender(_) => Role::Sender,
            Transaction::Receiver(_) => Role::Receiver,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            Transaction::Sender(t) => t.is_terminal(),
            Transaction::Receiver(t) => t.is_terminal(),
        }
    }

    /// When the transaction reached its final state; drives eviction.
    pub fn finished_at(&self) -> Option<Instant> {
        match self {
            Transaction::Sender(t) => t.finished_at(),
            Transaction::Receiver(t) => t.finished_at(),
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match self {
            Transaction::Sender(t) => t.next_deadline(),
            Transaction::Receiver(t) => t.next_deadline(),
        }
    }

    pub fn on_pdu(&mut self, pdu: Pdu, fx: &mut Effects<'_>) {
        match self {
            Transaction::Sender(t) => t.on_pdu(pdu, fx),
            Transaction::Receiver(t) => t.on_pdu(pdu, fx),
        }
    }

    pub fn on_timer(&mut self, fx: &mut Effects<'_>) {
        match self {
            Transaction::Sender(t) => t.on_timer(fx),
            Transaction::Receiver(t) => t.on_timer(fx),
        }
    }

    pub fn cancel(&mut self, fx: &mut Effects<'_>) {
        match self {
            Transaction::Sender(t) => t.cancel(fx),
            Transaction::Receiver(t) => t.cancel(fx),
        }
    }

    pub fn suspend(&mut self) {
        match self {
            Transaction::Sender(t) => t.suspend(),
            Transaction::Receiver(t) => t.suspend(),
        }
    }

    pub fn resume(&mut self, fx: &mut Effects<'_>) {
        match self {
            Transaction::Sender(t) => t.resume(fx),
            Transaction::Receiver(t) => t.resume(fx),
        }
    }

    /// Only senders prompt; receivers ignore the request.
    pub fn prompt(&mut self, kind: PromptKind, fx: &mut Effects<'_>) {
        if let Transaction::Sender(t) = self {
            t.prompt(kind, fx);
        }
    }

    pub fn summary(&self) -> TransactionSummary {
        match self {
            Transaction::Sender(t) => t.summary(),
            Transaction::Receiver(t) => t.summary(),
        }
    }
}
