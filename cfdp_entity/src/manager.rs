//! Owns the transaction table and routes every event to one transaction.
//!
//! The manager is the only mutable owner of transaction state. It runs on a
//! single task: inbound PDUs, `tick(now)` and user commands are applied one
//! at a time, and each produces PDUs for the [`PduSink`] plus at most one
//! [`TransferReport`] per finished transaction.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cfdp_protocol::{
    Direction, EncodeError, EntityId, Pdu, PduPayload, PromptKind, TransactionId,
    TransmissionMode,
};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::errors::EngineError;
use crate::filestore::FileStore;
use crate::registry::{EntityRegistry, RegistryError};
use crate::timer::earliest;
use crate::transaction::{
    Effects, ReceiverTransaction, SenderTransaction, Transaction, TransactionSummary,
    TransferInfo, TransferReport,
};

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_FILE_SIZE: u64 = 256 * 1024 * 1024;
const MAX_NAME_LEN: usize = u8::MAX as usize;
/// Evicted transaction ids remembered so late duplicates cannot reopen them.
const EVICTED_MEMORY: usize = 4096;

/// Outbound link. Fire-and-forget; delivery is not guaranteed.
pub trait PduSink {
    fn send(&self, destination: EntityId, pdu: Vec<u8>);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub pdus_sent: u64,
    pub pdus_received: u64,
    pub dropped_malformed: u64,
    pub dropped_misrouted: u64,
    pub dropped_unknown_entity: u64,
    pub dropped_unknown_transaction: u64,
    /// PDUs for transactions that were already evicted.
    pub dropped_stale: u64,
    pub encode_failures: u64,
    pub started: u64,
    pub completed: u64,
    pub evicted: u64,
}

pub struct TransactionManager<S: PduSink, F: FileStore> {
    registry: Arc<EntityRegistry>,
    local: EntityId,
    sink: S,
    store: F,
    transactions: HashMap<TransactionId, Transaction>,
    evicted: VecDeque<TransactionId>,
    evicted_ids: HashSet<TransactionId>,
    next_seq: u32,
    retention: Duration,
    max_file_size: u64,
    reports: UnboundedSender<TransferReport>,
    stats: ManagerStats,
}

impl<S: PduSink, F: FileStore> TransactionManager<S, F> {
    pub fn new(
        registry: Arc<EntityRegistry>,
        sink: S,
        store: F,
        reports: UnboundedSender<TransferReport>,
    ) -> Result<Self, EngineError> {
        let local = registry.local()?.entity_id;
        Ok(Self {
            registry,
            local,
            sink,
            store,
            transactions: HashMap::new(),
            evicted: VecDeque::new(),
            evicted_ids: HashSet::new(),
            next_seq: 1,
            retention: DEFAULT_RETENTION,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            reports,
            stats: ManagerStats::default(),
        })
    }

    /// How long finished transactions stay around to answer duplicates.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Incoming files larger than this are refused with FileSizeError.
    pub fn with_max_file_size(mut self, max: u64) -> Self {
        self.max_file_size = max;
        self
    }

    pub fn local_entity(&self) -> EntityId {
        self.local
    }

    pub fn store(&self) -> &F {
        &self.store
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn stats(&self) -> ManagerStats {
        self.stats
    }

    /// Transactions that have not reached a final state.
    pub fn active_count(&self) -> usize {
        self.transactions.values().filter(|t| !t.is_terminal()).count()
    }

    pub fn get(&self, id: TransactionId) -> Option<&Transaction> {
        self.transactions.get(&id)
    }

    pub fn summary(&self, id: TransactionId) -> Option<TransactionSummary> {
        self.transactions.get(&id).map(Transaction::summary)
    }

    pub fn summaries(&self) -> Vec<TransactionSummary> {
        let mut all: Vec<_> = self.transactions.values().map(Transaction::summary).collect();
        all.sort_by_key(|s| s.id);
        all
    }

    /// Earliest pending timer across all transactions.
    pub fn next_deadline(&self) -> Option<Instant> {
        earliest(self.transactions.values().map(Transaction::next_deadline))
    }

    pub fn start_transfer(
        &mut self,
        peer: EntityId,
        file_name: &str,
        data: Vec<u8>,
        class: Option<TransmissionMode>,
        closure: Option<bool>,
        now: Instant,
    ) -> Result<TransactionId, EngineError> {
        if peer == self.local {
            return Err(EngineError::SelfTransfer(peer));
        }
        let config = match self.registry.lookup(peer) {
            Ok(config) => config.clone(),
            Err(RegistryError::NotFound(id)) => return Err(EngineError::UnknownEntity(id)),
            Err(e) => return Err(e.into()),
        };
        if file_name.len() > MAX_NAME_LEN {
            return Err(EncodeError::NameTooLong(file_name.len()).into());
        }

        let id = self.allocate_id();
        let info = TransferInfo {
            id,
            peer,
            mode: class.unwrap_or(config.default_class),
            closure_requested: closure.unwrap_or(config.closure_requested_default),
            source_file: file_name.to_string(),
            destination_file: file_name.to_string(),
            file_size: data.len() as u64,
            checksum_type: config.checksum_type,
        };

        let mut fx = Effects::new(now, &self.store);
        let txn = SenderTransaction::start(info, config, data, &mut fx);
        let (pdus, reports) = fx.into_parts();
        self.transactions.insert(id, Transaction::Sender(txn));
        self.stats.started += 1;
        self.dispatch(pdus, reports);
        Ok(id)
    }

    /// Next free sequence number. After wrapping past `u32::MAX`, ids still
    /// held in the table are skipped.
    fn allocate_id(&mut self) -> TransactionId {
        loop {
            let id = TransactionId::new(self.local, self.next_seq);
            self.next_seq = self.next_seq.checked_add(1).unwrap_or(1);
            if !self.transactions.contains_key(&id) {
                return id;
            }
            debug!(event = "seq_in_use", txn = %id);
        }
    }

    pub fn cancel_transfer(&mut self, id: TransactionId, now: Instant) -> Result<(), EngineError> {
        self.with_active(id, now, |txn, fx| txn.cancel(fx))
    }

    pub fn suspend(&mut self, id: TransactionId, now: Instant) -> Result<(), EngineError> {
        self.with_active(id, now, |txn, _| txn.suspend())
    }

    pub fn resume(&mut self, id: TransactionId, now: Instant) -> Result<(), EngineError> {
        self.with_active(id, now, |txn, fx| txn.resume(fx))
    }

    /// Sends a Prompt from a class 2 sender.
    pub fn prompt(&mut self, id: TransactionId, kind: PromptKind, now: Instant) -> Result<(), EngineError> {
        self.with_active(id, now, |txn, fx| txn.prompt(kind, fx))
    }

    fn with_active(
        &mut self,
        id: TransactionId,
        now: Instant,
        op: impl FnOnce(&mut Transaction, &mut Effects<'_>),
    ) -> Result<(), EngineError> {
        let txn = self
            .transactions
            .get_mut(&id)
            .ok_or(EngineError::UnknownTransaction(id))?;
        if txn.is_terminal() {
            return Err(EngineError::AlreadyTerminal(id));
        }
        let mut fx = Effects::new(now, &self.store);
        op(txn, &mut fx);
        let (pdus, reports) = fx.into_parts();
        self.dispatch(pdus, reports);
        Ok(())
    }

    /// Entry point for every datagram from the link. Never fails: bad input
    /// is counted, logged and dropped.
    pub fn on_pdu_received(&mut self, bytes: &[u8], now: Instant) {
        let pdu = match Pdu::decode(bytes) {
            Ok(pdu) => pdu,
            Err(e) => {
                self.stats.dropped_malformed += 1;
                warn!(
                    event = "pdu_malformed",
                    error = %e,
                    len = bytes.len(),
                    head = %hex::encode(&bytes[..bytes.len().min(16)]),
                );
                return;
            }
        };
        self.stats.pdus_received += 1;

        let header = &pdu.header;
        let id = header.transaction_id();
        let for_us = header.destination == self.local
            && match header.direction {
                Direction::TowardReceiver => header.source != self.local,
                Direction::TowardSender => header.source == self.local,
            };
        if !for_us {
            self.stats.dropped_misrouted += 1;
            warn!(
                event = "pdu_misrouted",
                txn = %id,
                destination = %header.destination,
                direction = ?header.direction,
                kind = pdu.payload.kind(),
            );
            return;
        }

        if let Some(txn) = self.transactions.get_mut(&id) {
            let mut fx = Effects::new(now, &self.store);
            txn.on_pdu(pdu, &mut fx);
            let (pdus, reports) = fx.into_parts();
            self.dispatch(pdus, reports);
            return;
        }

        if self.evicted_ids.contains(&id) {
            self.stats.dropped_stale += 1;
            debug!(event = "pdu_stale_transaction", txn = %id, kind = pdu.payload.kind());
            return;
        }
        let metadata = match (&pdu.payload, header.direction) {
            (PduPayload::Metadata(m), Direction::TowardReceiver) => m.clone(),
            _ => {
                self.stats.dropped_unknown_transaction += 1;
                debug!(event = "pdu_unknown_transaction", txn = %id, kind = pdu.payload.kind());
                return;
            }
        };
        let config = match self.registry.lookup(header.source) {
            Ok(config) => config.clone(),
            Err(e) => {
                self.stats.dropped_unknown_entity += 1;
                warn!(event = "pdu_unknown_entity", txn = %id, error = %e);
                return;
            }
        };

        let mut fx = Effects::new(now, &self.store);
        let txn = ReceiverTransaction::new(&pdu.header, metadata, config, self.max_file_size, &mut fx);
        let (pdus, reports) = fx.into_parts();
        self.transactions.insert(id, Transaction::Receiver(txn));
        self.dispatch(pdus, reports);
    }

    /// [`Self::on_pdu_received`] for callers on a multi-threaded tokio
    /// runtime. Finishing a transfer writes the file store synchronously, so
    /// the worker's other tasks are handed off first. Panics on a
    /// current-thread runtime.
    pub fn on_pdu_received_blocking(&mut self, bytes: &[u8], now: Instant) {
        tokio::task::block_in_place(|| self.on_pdu_received(bytes, now));
    }

    /// Fires every expired timer, then evicts transactions whose retention
    /// window has passed.
    pub fn tick(&mut self, now: Instant) {
        let mut fx = Effects::new(now, &self.store);
        for txn in self.transactions.values_mut() {
            if txn.next_deadline().is_some_and(|deadline| deadline <= now) {
                txn.on_timer(&mut fx);
            }
        }
        let (pdus, reports) = fx.into_parts();
        self.dispatch(pdus, reports);

        let retention = self.retention;
        let mut gone = Vec::new();
        self.transactions.retain(|id, txn| {
            let keep = txn
                .finished_at()
                .is_none_or(|at| now.saturating_duration_since(at) < retention);
            if !keep {
                debug!(event = "evicted", txn = %id);
                gone.push(*id);
            }
            keep
        });
        self.stats.evicted += gone.len() as u64;
        for id in gone {
            self.remember_evicted(id);
        }
    }

    fn remember_evicted(&mut self, id: TransactionId) {
        if self.evicted_ids.insert(id) {
            self.evicted.push_back(id);
        }
        while self.evicted.len() > EVICTED_MEMORY {
            if let Some(old) = self.evicted.pop_front() {
                self.evicted_ids.remove(&old);
            }
        }
    }

    fn dispatch(&mut self, pdus: Vec<Pdu>, reports: Vec<TransferReport>) {
        for pdu in pdus {
            match pdu.encode() {
                Ok(bytes) => {
                    self.stats.pdus_sent += 1;
                    self.sink.send(pdu.header.destination, bytes);
                }
                Err(e) => {
                    self.stats.encode_failures += 1;
                    warn!(event = "pdu_encode_failed", txn = %pdu.transaction_id(), kind = pdu.payload.kind(), error = %e);
                }
            }
        }
        for report in reports {
            self.stats.completed += 1;
            info!(
                event = "transfer_report",
                txn = %report.id,
                role = ?report.role,
                outcome = ?report.outcome,
                condition = ?report.condition,
                file = %report.file_name,
            );
            if self.reports.send(report).is_err() {
                debug!(event = "report_receiver_gone");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filestore::{ConflictPolicy, DirectoryStore, MemoryStore};
    use crate::registry::EntityConfig;
    use crate::transaction::{Outcome, SenderState};
    use cfdp_protocol::{Ack, ConditionCode, DirectiveCode, TransactionStatus};
    use parking_lot::Mutex;
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    #[derive(Default)]
    struct Capture(Mutex<Vec<(EntityId, Vec<u8>)>>);

    impl PduSink for Capture {
        fn send(&self, destination: EntityId, pdu: Vec<u8>) {
            self.0.lock().push((destination, pdu));
        }
    }

    impl Capture {
        fn take(&self) -> Vec<Pdu> {
            self.0
                .lock()
                .drain(..)
                .map(|(_, bytes)| Pdu::decode(&bytes).expect("decodable"))
                .collect()
        }
    }

    fn registry(local: u32, remote: u32) -> Arc<EntityRegistry> {
        let mut reg = EntityRegistry::new();
        reg.register(EntityConfig::new(EntityId(local), true)).unwrap();
        reg.register(EntityConfig {
            segment_size: 4,
            ack_timeout: Duration::from_secs(1),
            max_retries: 1,
            ..EntityConfig::new(EntityId(remote), false)
        })
        .unwrap();
        Arc::new(reg)
    }

    fn manager() -> (TransactionManager<Capture, MemoryStore>, UnboundedReceiver<TransferReport>) {
        let (tx, rx) = unbounded_channel();
        let mgr = TransactionManager::new(
            registry(1, 2),
            Capture::default(),
            MemoryStore::new(ConflictPolicy::Reject),
            tx,
        )
        .unwrap();
        (mgr, rx)
    }

    #[test]
    fn start_transfer_validates_peer() {
        let (mut mgr, _rx) = manager();
        let now = Instant::now();
        assert!(matches!(
            mgr.start_transfer(EntityId(1), "a", vec![], None, None, now),
            Err(EngineError::SelfTransfer(_))
        ));
        assert!(matches!(
            mgr.start_transfer(EntityId(9), "a", vec![], None, None, now),
            Err(EngineError::UnknownEntity(EntityId(9)))
        ));
        let long = "x".repeat(300);
        assert!(matches!(
            mgr.start_transfer(EntityId(2), &long, vec![], None, None, now),
            Err(EngineError::Encode(EncodeError::NameTooLong(300)))
        ));
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn sequence_numbers_increase_from_one() {
        let (mut mgr, _rx) = manager();
        let now = Instant::now();
        let a = mgr.start_transfer(EntityId(2), "a", vec![1], None, None, now).unwrap();
        let b = mgr.start_transfer(EntityId(2), "b", vec![2], None, None, now).unwrap();
        assert_eq!(a, TransactionId::new(EntityId(1), 1));
        assert_eq!(b, TransactionId::new(EntityId(1), 2));
        assert_eq!(mgr.active_count(), 2);
        assert_eq!(mgr.summaries().len(), 2);
    }

    #[test]
    fn peer_defaults_apply() {
        let (mut mgr, _rx) = manager();
        let id = mgr
            .start_transfer(EntityId(2), "a.bin", b"0123456789".to_vec(), None, None, Instant::now())
            .unwrap();
        let sent = mgr.sink().take();
        // metadata + 3 segments of 4 bytes + eof
        assert_eq!(sent.len(), 5);
        assert!(sent.iter().all(|p| p.header.mode == TransmissionMode::Acknowledged));
        let summary = mgr.summary(id).unwrap();
        assert_eq!(summary.class, 2);
        assert_eq!(summary.progress, 10);
        assert_eq!(summary.state, "WaitEofAck");
    }

    #[test]
    fn drops_garbage_and_strays() {
        let (mut mgr, _rx) = manager();
        let now = Instant::now();
        mgr.on_pdu_received(&[0xFF, 0x00, 0x01], now);

        // ACK for a transaction nobody started
        let stray = Pdu::new(
            TransactionId::new(EntityId(1), 77),
            EntityId(1),
            Direction::TowardSender,
            TransmissionMode::Acknowledged,
            PduPayload::Ack(Ack {
                directive: DirectiveCode::Eof,
                condition: ConditionCode::NoError,
                status: TransactionStatus::Active,
            }),
        );
        mgr.on_pdu_received(&stray.encode().unwrap(), now);

        // addressed to someone else
        let elsewhere = Pdu { header: cfdp_protocol::PduHeader { destination: EntityId(5), ..stray.header.clone() }, ..stray.clone() };
        mgr.on_pdu_received(&elsewhere.encode().unwrap(), now);

        let stats = mgr.stats();
        assert_eq!(stats.dropped_malformed, 1);
        assert_eq!(stats.dropped_unknown_transaction, 1);
        assert_eq!(stats.dropped_misrouted, 1);
        assert_eq!(mgr.active_count(), 0);
        assert!(mgr.sink().take().is_empty());
    }

    #[test]
    fn cancel_reports_once_and_rejects_repeat() {
        let (mut mgr, mut rx) = manager();
        let now = Instant::now();
        let id = mgr.start_transfer(EntityId(2), "a", vec![0; 8], None, None, now).unwrap();
        mgr.sink().take();

        mgr.cancel_transfer(id, now).unwrap();
        let report = rx.try_recv().unwrap();
        assert_eq!(report.outcome, Outcome::Cancelled);
        assert_eq!(report.condition, ConditionCode::CancelRequestReceived);
        assert!(rx.try_recv().is_err());

        assert!(matches!(mgr.cancel_transfer(id, now), Err(EngineError::AlreadyTerminal(_))));
        let unknown = TransactionId::new(EntityId(1), 99);
        assert!(matches!(mgr.cancel_transfer(unknown, now), Err(EngineError::UnknownTransaction(_))));
    }

    #[test]
    fn retry_exhaustion_then_eviction() {
        let (mut mgr, mut rx) = manager();
        let t0 = Instant::now();
        let id = mgr.start_transfer(EntityId(2), "a", vec![0; 8], None, None, t0).unwrap();

        // max_retries = 1: one EOF resend, then failure
        mgr.tick(t0 + Duration::from_secs(1));
        assert!(rx.try_recv().is_err());
        mgr.tick(t0 + Duration::from_secs(2));
        let report = rx.try_recv().unwrap();
        assert_eq!(report.outcome, Outcome::Failed);
        assert_eq!(report.condition, ConditionCode::PositiveAckLimitReached);
        match mgr.get(id) {
            Some(Transaction::Sender(s)) => assert_eq!(s.state(), SenderState::Terminal),
            other => panic!("unexpected {other:?}"),
        }

        // still queryable inside the retention window, gone after it
        mgr.tick(t0 + Duration::from_secs(20));
        assert!(mgr.get(id).is_some());
        mgr.tick(t0 + Duration::from_secs(40));
        assert!(mgr.get(id).is_none());
        assert_eq!(mgr.stats().evicted, 1);
    }

    #[test]
    fn wrapped_sequence_skips_ids_still_held() {
        let (mut mgr, _rx) = manager();
        let now = Instant::now();
        let first = mgr.start_transfer(EntityId(2), "a", vec![0; 8], None, None, now).unwrap();
        assert_eq!(first, TransactionId::new(EntityId(1), 1));

        mgr.next_seq = u32::MAX;
        let last = mgr.start_transfer(EntityId(2), "b", vec![0; 8], None, None, now).unwrap();
        assert_eq!(last, TransactionId::new(EntityId(1), u32::MAX));
        let wrapped = mgr.start_transfer(EntityId(2), "c", vec![0; 8], None, None, now).unwrap();
        assert_eq!(wrapped, TransactionId::new(EntityId(1), 2));

        // the original transaction is untouched
        assert_eq!(mgr.summary(first).unwrap().file_name, "a");
        assert_eq!(mgr.stats().started, 3);
    }

    fn receiving_manager<F: FileStore>(store: F) -> (TransactionManager<Capture, F>, UnboundedReceiver<TransferReport>) {
        let (tx, rx) = unbounded_channel();
        let mgr = TransactionManager::new(registry(2, 1), Capture::default(), store, tx).unwrap();
        (mgr, rx)
    }

    fn raw(sink: &Capture) -> Vec<Vec<u8>> {
        sink.0.lock().drain(..).map(|(_, bytes)| bytes).collect()
    }

    #[test]
    fn metadata_after_eviction_does_not_reopen() {
        let (mut tx_mgr, _tx_rx) = manager();
        let (mut rx_mgr, mut rx) = receiving_manager(MemoryStore::new(ConflictPolicy::Reject));
        let t0 = Instant::now();
        tx_mgr
            .start_transfer(EntityId(2), "a", vec![7; 8], Some(TransmissionMode::Unacknowledged), Some(false), t0)
            .unwrap();
        let sent = raw(tx_mgr.sink());
        for bytes in &sent {
            rx_mgr.on_pdu_received(bytes, t0);
        }
        assert_eq!(rx.try_recv().unwrap().outcome, Outcome::Complete);

        let later = t0 + Duration::from_secs(31);
        rx_mgr.tick(later);
        assert_eq!(rx_mgr.stats().evicted, 1);

        // a stray copy of the Metadata shows up after the retention window
        rx_mgr.on_pdu_received(&sent[0], later);
        assert_eq!(rx_mgr.active_count(), 0);
        assert_eq!(rx_mgr.stats().dropped_stale, 1);
        rx_mgr.tick(later + Duration::from_secs(60));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_receive_writes_store_on_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path(), ConflictPolicy::Reject).unwrap();
        let (mut tx_mgr, _tx_rx) = manager();
        let (mut rx_mgr, mut rx) = receiving_manager(store);
        let now = Instant::now();
        tx_mgr
            .start_transfer(EntityId(2), "a.bin", b"0123456789".to_vec(), Some(TransmissionMode::Unacknowledged), Some(false), now)
            .unwrap();
        for bytes in raw(tx_mgr.sink()) {
            rx_mgr.on_pdu_received_blocking(&bytes, now);
        }
        assert_eq!(rx.try_recv().unwrap().stored_as.as_deref(), Some("a.bin"));
        assert_eq!(std::fs::read(dir.path().join("a.bin")).unwrap(), b"0123456789");
    }

    #[test]
    fn suspend_and_resume_require_live_transaction() {
        let (mut mgr, _rx) = manager();
        let t0 = Instant::now();
        let id = mgr.start_transfer(EntityId(2), "a", vec![0; 8], None, None, t0).unwrap();

        mgr.suspend(id, t0).unwrap();
        assert!(mgr.summary(id).unwrap().suspended);
        assert_eq!(mgr.next_deadline(), None);
        // frozen: no EOF retries while suspended
        mgr.sink().take();
        mgr.tick(t0 + Duration::from_secs(5));
        assert!(mgr.sink().take().is_empty());

        mgr.resume(id, t0 + Duration::from_secs(5)).unwrap();
        assert_eq!(mgr.next_deadline(), Some(t0 + Duration::from_secs(6)));
    }
}
