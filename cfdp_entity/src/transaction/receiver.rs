//! File receiver, class 1 and class 2.
//!
//! Class 1: Start → Receiving → Terminal.
//! Class 2: Start → Receiving → GapWait → Finished. Gaps are chased with
//! NAKs until the range set covers the file or the NAK limit is hit; the
//! Finished PDU is then repeated until the sender ACKs it.

use std::time::Instant;

use cfdp_protocol::{
    Ack, ConditionCode, DeliveryCode, Direction, DirectiveCode, EntityId, Eof, FileData,
    FileStatus, Finished, KeepAlive, MAX_NAK_GAPS, Metadata, Nak, Pdu, PduHeader, PduPayload,
    PromptKind, TransactionStatus, TransmissionMode,
};
use chrono::Utc;
use tracing::{debug, info, warn};

use super::{Effects, Outcome, Role, TransactionSummary, TransferInfo};
use crate::filestore::FileMetadata;
use crate::ranges::RangeSet;
use crate::registry::EntityConfig;
use crate::timer::{Countdown, RetryCounter, earliest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Start,
    Receiving,
    GapWait,
    Finished,
    Terminal,
}

#[derive(Debug)]
pub struct ReceiverTransaction {
    info: TransferInfo,
    local: EntityId,
    peer: EntityConfig,
    buffer: Vec<u8>,
    received: RangeSet,
    state: ReceiverState,
    eof: Option<Eof>,
    nak_timer: Countdown,
    nak_retries: RetryCounter,
    inactivity: Countdown,
    finished: Option<Finished>,
    finished_ack: Countdown,
    finished_retries: RetryCounter,
    suspended: bool,
    finished_at: Option<Instant>,
    reported: bool,
}

impl ReceiverTransaction {
    /// Created from the Metadata PDU that opens the transaction. Files larger
    /// than `max_file_size` are refused straight away.
    pub fn new(
        header: &PduHeader,
        metadata: Metadata,
        peer: EntityConfig,
        max_file_size: u64,
        fx: &mut Effects<'_>,
    ) -> Self {
        let id = header.transaction_id();
        let destination_file = if !metadata.destination_file.is_empty() {
            metadata.destination_file
        } else if !metadata.source_file.is_empty() {
            metadata.source_file.clone()
        } else {
            format!("{}-{}.bin", id.source, id.seq)
        };
        let info = TransferInfo {
            id,
            peer: header.source,
            mode: header.mode,
            closure_requested: metadata.closure_requested,
            source_file: metadata.source_file,
            destination_file,
            file_size: metadata.file_size,
            checksum_type: metadata.checksum_type,
        };
        let mut txn = Self {
            info,
            local: header.destination,
            nak_retries: RetryCounter::new(peer.max_retries),
            finished_retries: RetryCounter::new(peer.max_retries),
            peer,
            buffer: Vec::new(),
            received: RangeSet::new(),
            state: ReceiverState::Start,
            eof: None,
            nak_timer: Countdown::default(),
            inactivity: Countdown::default(),
            finished: None,
            finished_ack: Countdown::default(),
            suspended: false,
            finished_at: None,
            reported: false,
        };
        info!(
            event = "recv_start",
            txn = %txn.info.id,
            peer = %txn.info.peer,
            class = txn.info.mode.class(),
            closure = txn.info.closure_requested,
            file = %txn.info.destination_file,
            bytes = txn.info.file_size,
        );

        txn.state = ReceiverState::Receiving;
        txn.inactivity.arm(fx.now, txn.peer.inactivity_timeout);
        if txn.info.file_size > max_file_size {
            warn!(event = "file_too_large", txn = %txn.info.id, bytes = txn.info.file_size, limit = max_file_size);
            txn.close_incomplete(ConditionCode::FileSizeError, Outcome::Failed, fx);
        }
        txn
    }

    pub fn info(&self) -> &TransferInfo {
        &self.info
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, ReceiverState::Finished | ReceiverState::Terminal)
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.finished_at
    }

    pub fn received(&self) -> &RangeSet {
        &self.received
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        if self.suspended {
            None
        } else if self.is_terminal() {
            self.finished_ack.deadline()
        } else {
            earliest([self.nak_timer.deadline(), self.inactivity.deadline()])
        }
    }

    pub fn on_pdu(&mut self, pdu: Pdu, fx: &mut Effects<'_>) {
        if self.is_terminal() {
            self.on_pdu_after_close(pdu, fx);
            return;
        }
        if !self.suspended {
            self.inactivity.arm(fx.now, self.peer.inactivity_timeout);
        }
        match pdu.payload {
            PduPayload::FileData(fd) => self.on_file_data(fd, fx),
            PduPayload::Eof(eof) => self.on_eof(eof, fx),
            PduPayload::Prompt(p) => self.on_prompt(p.response, fx),
            PduPayload::Metadata(_) => debug!(event = "duplicate_metadata", txn = %self.info.id),
            other => {
                debug!(event = "ignored_pdu", txn = %self.info.id, state = ?self.state, kind = other.kind());
            }
        }
    }

    pub fn on_timer(&mut self, fx: &mut Effects<'_>) {
        if self.suspended {
            return;
        }
        let now = fx.now;
        if self.is_terminal() {
            if self.finished_ack.expired(now) {
                if self.finished_retries.bump() {
                    debug!(event = "finished_retry", txn = %self.info.id, attempt = self.finished_retries.count());
                    self.resend_finished(fx);
                    self.finished_ack.arm(now, self.peer.ack_timeout);
                } else {
                    // already reported; the sender will time out on its own
                    debug!(event = "finished_unacked", txn = %self.info.id);
                    self.finished_ack.disarm();
                }
            }
            return;
        }
        if self.inactivity.expired(now) {
            warn!(event = "inactivity", txn = %self.info.id, state = ?self.state);
            self.abandon(ConditionCode::InactivityDetected, fx);
            return;
        }
        if self.nak_timer.expired(now) {
            let (gaps, _) = self.current_gaps();
            if gaps.is_empty() {
                self.nak_timer.disarm();
            } else if self.nak_retries.bump() {
                info!(event = "nak_retry", txn = %self.info.id, attempt = self.nak_retries.count());
                self.send_naks(fx);
                self.nak_timer.arm(now, self.peer.ack_timeout);
            } else {
                warn!(event = "nak_limit_reached", txn = %self.info.id, gaps = gaps.len());
                self.close_incomplete(ConditionCode::NakLimitReached, Outcome::Failed, fx);
            }
        }
    }

    /// User cancel: Finished(cancel) to the peer when it expects one.
    pub fn cancel(&mut self, fx: &mut Effects<'_>) {
        if self.is_terminal() {
            return;
        }
        info!(event = "cancel", txn = %self.info.id, state = ?self.state);
        self.abandon(ConditionCode::CancelRequestReceived, fx);
    }

    pub fn suspend(&mut self) {
        if self.is_terminal() || self.suspended {
            return;
        }
        self.suspended = true;
        self.nak_timer.disarm();
        self.inactivity.disarm();
        info!(event = "suspend", txn = %self.info.id);
    }

    pub fn resume(&mut self, fx: &mut Effects<'_>) {
        if self.is_terminal() || !self.suspended {
            return;
        }
        self.suspended = false;
        self.inactivity.arm(fx.now, self.peer.inactivity_timeout);
        if self.info.mode == TransmissionMode::Acknowledged && !self.current_gaps().0.is_empty() {
            self.nak_timer.arm(fx.now, self.peer.ack_timeout);
        }
        info!(event = "resume", txn = %self.info.id);
    }

    pub fn summary(&self) -> TransactionSummary {
        TransactionSummary {
            id: self.info.id,
            role: Role::Receiver,
            class: self.info.mode.class(),
            peer: self.info.peer,
            state: format!("{:?}", self.state),
            file_name: self.info.destination_file.clone(),
            file_size: self.info.file_size,
            progress: self.received.total(),
            suspended: self.suspended,
            terminal: self.is_terminal(),
        }
    }

    // ---------------------------------------------------------------------

    fn emit(&self, payload: PduPayload, fx: &mut Effects<'_>) {
        let pdu = Pdu::new(
            self.info.id,
            self.info.peer,
            Direction::TowardSender,
            self.info.mode,
            payload,
        )
        .with_crc(self.peer.crc);
        fx.send(pdu);
    }

    fn acknowledged(&self) -> bool {
        self.info.mode == TransmissionMode::Acknowledged
    }

    /// Class 2 always closes with Finished; class 1 only on request.
    fn sends_finished(&self) -> bool {
        self.acknowledged() || self.info.closure_requested
    }

    fn refresh_nak_timer(&mut self, now: Instant) {
        if !self.suspended {
            self.nak_timer.arm(now, self.peer.ack_timeout);
        }
    }

    fn on_pdu_after_close(&mut self, pdu: Pdu, fx: &mut Effects<'_>) {
        match pdu.payload {
            PduPayload::Ack(ack) if ack.directive == DirectiveCode::Finished => {
                debug!(event = "finished_acked", txn = %self.info.id);
                self.finished_ack.disarm();
            }
            // the sender missed our ACK or our Finished; answer both again
            PduPayload::Eof(eof) if self.acknowledged() => {
                debug!(event = "late_eof", txn = %self.info.id);
                self.ack_eof(eof.condition, fx);
                self.resend_finished(fx);
            }
            PduPayload::Prompt(_) if self.acknowledged() => self.resend_finished(fx),
            other => {
                debug!(event = "late_pdu", txn = %self.info.id, kind = other.kind());
            }
        }
    }

    fn on_file_data(&mut self, fd: FileData, fx: &mut Effects<'_>) {
        let (start, end) = (fd.offset, fd.end());
        if end > self.info.file_size {
            warn!(
                event = "segment_out_of_bounds",
                txn = %self.info.id,
                offset = start,
                len = fd.data.len(),
                file_size = self.info.file_size,
            );
            return;
        }
        if self.received.contains(start, end) {
            debug!(event = "duplicate_segment", txn = %self.info.id, offset = start, len = fd.data.len());
        } else {
            if self.buffer.len() < end as usize {
                self.buffer.resize(end as usize, 0);
            }
            self.buffer[start as usize..end as usize].copy_from_slice(&fd.data);
            if self.received.insert(start, end) > 0 {
                self.nak_retries.reset();
            }
        }

        if !self.acknowledged() {
            return;
        }
        let now = fx.now;
        match self.state {
            ReceiverState::GapWait if self.received.covers(self.info.file_size) => self.finalize(fx),
            ReceiverState::GapWait => self.refresh_nak_timer(now),
            ReceiverState::Receiving => {
                if self.received.gaps(self.received.highest_end()).is_empty() {
                    self.nak_timer.disarm();
                } else {
                    self.refresh_nak_timer(now);
                }
            }
            _ => {}
        }
    }

    fn on_eof(&mut self, eof: Eof, fx: &mut Effects<'_>) {
        if self.acknowledged() {
            self.ack_eof(eof.condition, fx);
        }
        if eof.condition.is_error() {
            info!(event = "cancelled_by_peer", txn = %self.info.id, condition = ?eof.condition);
            let condition = eof.condition;
            let finished = Finished {
                condition,
                delivery: DeliveryCode::Incomplete,
                file_status: FileStatus::DiscardedDeliberately,
                fault_location: eof.fault_location,
            };
            self.buffer.clear();
            self.eof = Some(eof);
            self.close(Outcome::Cancelled, condition, finished, false, None, fx);
            return;
        }
        if self.eof.is_some() {
            debug!(event = "duplicate_eof", txn = %self.info.id);
            // the sender lost our answer; repeat the gap list right away
            if self.state == ReceiverState::GapWait {
                self.send_naks(fx);
                self.refresh_nak_timer(fx.now);
            }
            return;
        }
        if eof.file_size != self.info.file_size {
            warn!(
                event = "file_size_mismatch",
                txn = %self.info.id,
                metadata = self.info.file_size,
                eof = eof.file_size,
            );
            self.eof = Some(eof);
            self.close_incomplete(ConditionCode::FileSizeError, Outcome::Incomplete, fx);
            return;
        }
        self.eof = Some(eof);

        if !self.acknowledged() {
            self.finalize(fx);
            return;
        }
        self.state = ReceiverState::GapWait;
        self.send_naks(fx);
        if self.received.covers(self.info.file_size) {
            self.finalize(fx);
        } else {
            self.refresh_nak_timer(fx.now);
        }
    }

    fn on_prompt(&mut self, kind: PromptKind, fx: &mut Effects<'_>) {
        match kind {
            PromptKind::KeepAlive => {
                let progress = self.received.contiguous_prefix();
                self.emit(PduPayload::KeepAlive(KeepAlive { progress }), fx);
            }
            PromptKind::Nak if self.acknowledged() => {
                if self.current_gaps().0.is_empty() {
                    debug!(event = "prompt_no_gaps", txn = %self.info.id);
                    return;
                }
                self.send_naks(fx);
                self.refresh_nak_timer(fx.now);
            }
            PromptKind::Nak => debug!(event = "prompt_nak_class1", txn = %self.info.id),
        }
    }

    fn ack_eof(&self, condition: ConditionCode, fx: &mut Effects<'_>) {
        self.emit(
            PduPayload::Ack(Ack {
                directive: DirectiveCode::Eof,
                condition,
                status: TransactionStatus::Active,
            }),
            fx,
        );
    }

    fn resend_finished(&self, fx: &mut Effects<'_>) {
        if let Some(finished) = &self.finished {
            self.emit(PduPayload::Finished(finished.clone()), fx);
        }
    }

    /// Missing ranges plus the end scope to advertise. Before EOF only holes
    /// below the highest received byte count; after EOF everything up to the
    /// file size does, followed by the `[file_size, file_size + 1)` sentinel
    /// when the tail never arrived.
    fn current_gaps(&self) -> (Vec<(u64, u64)>, u64) {
        if self.eof.is_none() {
            let highest = self.received.highest_end();
            return (self.received.gaps(highest), highest);
        }
        let size = self.info.file_size;
        let mut gaps = self.received.gaps(size);
        if self.received.highest_end() < size {
            gaps.push((size, size.saturating_add(1)));
        }
        let end_scope = gaps.last().map_or(size, |&(_, end)| end.max(size));
        (gaps, end_scope)
    }

    /// One NAK per `MAX_NAK_GAPS` gaps; an empty list still yields one NAK.
    fn send_naks(&self, fx: &mut Effects<'_>) {
        let (gaps, end_scope) = self.current_gaps();
        if gaps.is_empty() {
            self.emit(PduPayload::Nak(Nak { start_scope: 0, end_scope, gaps }), fx);
            return;
        }
        let chunks = gaps.len().div_ceil(MAX_NAK_GAPS);
        for (i, chunk) in gaps.chunks(MAX_NAK_GAPS).enumerate() {
            let start_scope = if i == 0 { 0 } else { chunk[0].0 };
            let chunk_end = if i + 1 == chunks { end_scope } else { chunk[chunk.len() - 1].1 };
            self.emit(
                PduPayload::Nak(Nak { start_scope, end_scope: chunk_end, gaps: chunk.to_vec() }),
                fx,
            );
        }
        info!(event = "nak_sent", txn = %self.info.id, gaps = gaps.len(), pdus = chunks);
    }

    /// All data is in (class 2) or EOF arrived (class 1): verify, deliver, close.
    fn finalize(&mut self, fx: &mut Effects<'_>) {
        let size = self.info.file_size;
        let prefix = self.received.contiguous_prefix().min(size);
        if prefix < size {
            warn!(event = "gaps_at_eof", txn = %self.info.id, contiguous = prefix, file_size = size);
            self.close_incomplete(ConditionCode::FileSizeError, Outcome::Incomplete, fx);
            return;
        }
        let expected = self.eof.as_ref().map_or(0, |eof| eof.checksum);
        if !self.info.checksum_type.verify(&self.buffer[..size as usize], expected) {
            warn!(
                event = "checksum_failure",
                txn = %self.info.id,
                algorithm = ?self.info.checksum_type,
                expected = expected,
            );
            self.close_incomplete(ConditionCode::FileChecksumFailure, Outcome::Incomplete, fx);
            return;
        }

        let stored = self.deliver(expected, fx);
        let (condition, file_status) = match stored {
            Ok(_) => (ConditionCode::NoError, FileStatus::Retained),
            Err(_) => (ConditionCode::FilestoreRejection, FileStatus::DiscardedFilestoreRejection),
        };
        let finished = Finished {
            condition,
            delivery: DeliveryCode::Complete,
            file_status,
            fault_location: condition.is_error().then_some(self.local),
        };
        let notify = self.sends_finished();
        self.close(Outcome::Complete, condition, finished, notify, Some(stored), fx);
    }

    fn deliver(&mut self, checksum: u32, fx: &mut Effects<'_>) -> Result<String, String> {
        let mut data = std::mem::take(&mut self.buffer);
        data.truncate(self.info.file_size as usize);
        let meta = FileMetadata {
            transaction: self.info.id,
            source_entity: self.info.peer,
            source_file: self.info.source_file.clone(),
            file_size: self.info.file_size,
            checksum_type: self.info.checksum_type,
            checksum,
            received_at: Utc::now(),
        };
        match fx.store().save(&self.info.destination_file, data, &meta) {
            Ok(name) => {
                info!(event = "file_stored", txn = %self.info.id, name = %name, bytes = self.info.file_size);
                Ok(name)
            }
            Err(e) => {
                warn!(event = "store_failed", txn = %self.info.id, file = %self.info.destination_file, error = %e);
                Err(e.to_string())
            }
        }
    }

    fn abandon(&mut self, fault: ConditionCode, fx: &mut Effects<'_>) {
        let finished = Finished {
            condition: ConditionCode::CancelRequestReceived,
            delivery: DeliveryCode::Incomplete,
            file_status: FileStatus::DiscardedDeliberately,
            fault_location: Some(self.local),
        };
        self.buffer.clear();
        let notify = self.sends_finished();
        self.close(Outcome::Cancelled, fault, finished, notify, None, fx);
    }

    fn close_incomplete(&mut self, condition: ConditionCode, outcome: Outcome, fx: &mut Effects<'_>) {
        let finished = Finished {
            condition,
            delivery: DeliveryCode::Incomplete,
            file_status: FileStatus::DiscardedDeliberately,
            fault_location: Some(self.local),
        };
        self.buffer.clear();
        let notify = self.sends_finished();
        self.close(outcome, condition, finished, notify, None, fx);
    }

    /// Final transition. Sends `finished` when `notify`, then the one report.
    fn close(
        &mut self,
        outcome: Outcome,
        condition: ConditionCode,
        finished: Finished,
        notify: bool,
        stored: Option<Result<String, String>>,
        fx: &mut Effects<'_>,
    ) {
        let now = fx.now;
        self.nak_timer.disarm();
        self.inactivity.disarm();
        self.state = if self.acknowledged() {
            ReceiverState::Finished
        } else {
            ReceiverState::Terminal
        };
        self.finished_at = Some(now);
        if notify {
            self.emit(PduPayload::Finished(finished.clone()), fx);
            if self.acknowledged() {
                self.finished = Some(finished.clone());
                self.finished_ack.arm(now, self.peer.ack_timeout);
            }
        }
        if self.reported {
            return;
        }
        self.reported = true;

        let mut report = self.info.report(Role::Receiver, outcome, condition);
        report.delivery = Some(finished.delivery);
        report.file_status = Some(finished.file_status);
        match stored {
            Some(Ok(name)) => report.stored_as = Some(name),
            Some(Err(e)) => report.store_error = Some(e),
            None => {}
        }
        info!(
            event = "recv_done",
            txn = %self.info.id,
            outcome = ?report.outcome,
            condition = ?report.condition,
            received = self.received.total(),
        );
        fx.report(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filestore::{FileStore, MemoryStore, MockFileStore, StoreError};
    use crate::filestore::ConflictPolicy;
    use cfdp_protocol::{ChecksumType, Prompt, TransactionId};
    use std::time::Duration;

    const DATA: &[u8] = b"0123456789";

    fn peer() -> EntityConfig {
        EntityConfig {
            segment_size: 4,
            ack_timeout: Duration::from_secs(1),
            max_retries: 2,
            inactivity_timeout: Duration::from_secs(30),
            ..EntityConfig::new(EntityId(1), false)
        }
    }

    fn inbound(mode: TransmissionMode, payload: PduPayload) -> Pdu {
        Pdu::new(
            TransactionId::new(EntityId(1), 1),
            EntityId(2),
            Direction::TowardReceiver,
            mode,
            payload,
        )
    }

    fn open(
        mode: TransmissionMode,
        closure: bool,
        store: &dyn FileStore,
        now: Instant,
    ) -> ReceiverTransaction {
        let metadata = Metadata {
            closure_requested: closure,
            checksum_type: ChecksumType::Modular,
            file_size: DATA.len() as u64,
            source_file: "a.bin".into(),
            destination_file: "a.bin".into(),
        };
        let pdu = inbound(mode, PduPayload::Metadata(metadata.clone()));
        let mut fx = Effects::new(now, store);
        ReceiverTransaction::new(&pdu.header, metadata, peer(), u64::MAX, &mut fx)
    }

    fn segment(mode: TransmissionMode, offset: u64) -> Pdu {
        let start = offset as usize;
        let end = (start + 4).min(DATA.len());
        inbound(
            mode,
            PduPayload::FileData(FileData {
                offset,
                data: DATA[start..end].to_vec(),
                segment_metadata: Vec::new(),
            }),
        )
    }

    fn eof(mode: TransmissionMode, checksum: u32) -> Pdu {
        inbound(
            mode,
            PduPayload::Eof(Eof {
                condition: ConditionCode::NoError,
                checksum,
                file_size: DATA.len() as u64,
                fault_location: None,
            }),
        )
    }

    fn good_checksum() -> u32 {
        ChecksumType::Modular.compute(DATA)
    }

    fn kinds(pdus: &[Pdu]) -> Vec<&'static str> {
        pdus.iter().map(|p| p.payload.kind()).collect()
    }

    fn finished_of(pdus: &[Pdu]) -> Option<Finished> {
        pdus.iter().find_map(|p| match &p.payload {
            PduPayload::Finished(f) => Some(f.clone()),
            _ => None,
        })
    }

    fn naks_of(pdus: &[Pdu]) -> Vec<Nak> {
        pdus.iter()
            .filter_map(|p| match &p.payload {
                PduPayload::Nak(n) => Some(n.clone()),
                _ => None,
            })
            .collect()
    }

    fn saving_store() -> MockFileStore {
        let mut store = MockFileStore::new();
        store
            .expect_save()
            .withf(|name, data, meta| name == "a.bin" && data.as_slice() == DATA && meta.file_size == 10)
            .times(1)
            .returning(|name: &str, _data: Vec<u8>, _meta: &FileMetadata| Ok(name.to_string()));
        store
    }

    #[test]
    fn class1_complete_without_closure() {
        let store = saving_store();
        let t0 = Instant::now();
        let mode = TransmissionMode::Unacknowledged;
        let mut txn = open(mode, false, &store, t0);

        let mut fx = Effects::new(t0, &store);
        for offset in [0, 4, 8] {
            txn.on_pdu(segment(mode, offset), &mut fx);
        }
        // duplicates are accepted silently
        txn.on_pdu(segment(mode, 4), &mut fx);
        txn.on_pdu(eof(mode, good_checksum()), &mut fx);

        assert!(fx.pdus().is_empty());
        assert_eq!(txn.state(), ReceiverState::Terminal);
        let report = &fx.reports()[0];
        assert_eq!(report.outcome, Outcome::Complete);
        assert_eq!(report.stored_as.as_deref(), Some("a.bin"));
    }

    #[test]
    fn class1_gap_reports_file_size_error() {
        let mut store = MockFileStore::new();
        store.expect_save().times(0);
        let t0 = Instant::now();
        let mode = TransmissionMode::Unacknowledged;
        let mut txn = open(mode, true, &store, t0);

        let mut fx = Effects::new(t0, &store);
        txn.on_pdu(segment(mode, 0), &mut fx);
        txn.on_pdu(segment(mode, 8), &mut fx);
        txn.on_pdu(eof(mode, good_checksum()), &mut fx);

        let finished = finished_of(fx.pdus()).expect("finished");
        assert_eq!(finished.condition, ConditionCode::FileSizeError);
        assert_eq!(finished.delivery, DeliveryCode::Incomplete);
        assert_eq!(fx.reports()[0].outcome, Outcome::Incomplete);
        // class 1 never NAKs
        assert!(naks_of(fx.pdus()).is_empty());
    }

    #[test]
    fn class2_naks_the_dropped_segment() {
        let store = saving_store();
        let t0 = Instant::now();
        let mode = TransmissionMode::Acknowledged;
        let mut txn = open(mode, true, &store, t0);

        let mut fx = Effects::new(t0, &store);
        txn.on_pdu(segment(mode, 0), &mut fx);
        txn.on_pdu(segment(mode, 8), &mut fx);
        assert_eq!(txn.next_deadline(), Some(t0 + Duration::from_secs(1)));
        txn.on_pdu(eof(mode, good_checksum()), &mut fx);

        assert_eq!(kinds(fx.pdus()), ["ack", "nak"]);
        assert_eq!(naks_of(fx.pdus())[0].gaps, vec![(4, 8)]);
        assert_eq!(txn.state(), ReceiverState::GapWait);

        let mut fx = Effects::new(t0, &store);
        txn.on_pdu(segment(mode, 4), &mut fx);
        let finished = finished_of(fx.pdus()).expect("finished");
        assert_eq!(finished.condition, ConditionCode::NoError);
        assert_eq!(finished.delivery, DeliveryCode::Complete);
        assert_eq!(finished.file_status, FileStatus::Retained);
        assert_eq!(txn.state(), ReceiverState::Finished);
        assert_eq!(fx.reports()[0].outcome, Outcome::Complete);
    }

    #[test]
    fn missing_tail_carries_eof_sentinel() {
        let store = MockFileStore::new();
        let t0 = Instant::now();
        let mode = TransmissionMode::Acknowledged;
        let mut txn = open(mode, true, &store, t0);

        let mut fx = Effects::new(t0, &store);
        txn.on_pdu(segment(mode, 0), &mut fx);
        txn.on_pdu(segment(mode, 4), &mut fx);
        txn.on_pdu(eof(mode, good_checksum()), &mut fx);

        let nak = &naks_of(fx.pdus())[0];
        assert_eq!(nak.gaps, vec![(8, 10), (10, 11)]);
        assert!(nak.requests_eof(10));
        assert_eq!(nak.end_scope, 11);
    }

    #[test]
    fn repeated_eof_in_gap_wait_renaks_immediately() {
        let store = MockFileStore::new();
        let t0 = Instant::now();
        let mode = TransmissionMode::Acknowledged;
        let mut txn = open(mode, true, &store, t0);

        let mut fx = Effects::new(t0, &store);
        txn.on_pdu(segment(mode, 0), &mut fx);
        txn.on_pdu(segment(mode, 8), &mut fx);
        txn.on_pdu(eof(mode, good_checksum()), &mut fx);
        assert_eq!(txn.state(), ReceiverState::GapWait);

        let t1 = t0 + Duration::from_millis(500);
        let mut fx = Effects::new(t1, &store);
        txn.on_pdu(eof(mode, good_checksum()), &mut fx);
        assert_eq!(kinds(fx.pdus()), ["ack", "nak"]);
        assert_eq!(naks_of(fx.pdus())[0].gaps, vec![(4, 8)]);
        assert_eq!(txn.next_deadline(), Some(t1 + txn.peer.ack_timeout));
    }

    #[test]
    fn complete_at_eof_sends_empty_nak_then_finished() {
        let store = saving_store();
        let t0 = Instant::now();
        let mode = TransmissionMode::Acknowledged;
        let mut txn = open(mode, true, &store, t0);

        let mut fx = Effects::new(t0, &store);
        for offset in [0, 4, 8] {
            txn.on_pdu(segment(mode, offset), &mut fx);
        }
        txn.on_pdu(eof(mode, good_checksum()), &mut fx);
        assert_eq!(kinds(fx.pdus()), ["ack", "nak", "finished"]);
        assert!(naks_of(fx.pdus())[0].gaps.is_empty());
    }

    #[test]
    fn checksum_mismatch_discards() {
        let mut store = MockFileStore::new();
        store.expect_save().times(0);
        let t0 = Instant::now();
        let mode = TransmissionMode::Acknowledged;
        let mut txn = open(mode, true, &store, t0);

        let mut fx = Effects::new(t0, &store);
        for offset in [0, 4, 8] {
            txn.on_pdu(segment(mode, offset), &mut fx);
        }
        txn.on_pdu(eof(mode, good_checksum() ^ 1), &mut fx);

        let finished = finished_of(fx.pdus()).expect("finished");
        assert_eq!(finished.condition, ConditionCode::FileChecksumFailure);
        assert_eq!(finished.file_status, FileStatus::DiscardedDeliberately);
        assert_eq!(fx.reports()[0].outcome, Outcome::Incomplete);
    }

    #[test]
    fn nak_limit_fails_transaction() {
        let store = MockFileStore::new();
        let t0 = Instant::now();
        let mode = TransmissionMode::Acknowledged;
        let mut txn = open(mode, true, &store, t0);

        let mut fx = Effects::new(t0, &store);
        txn.on_pdu(segment(mode, 0), &mut fx);
        txn.on_pdu(eof(mode, good_checksum()), &mut fx);

        for n in 1..=2u64 {
            let mut fx = Effects::new(t0 + Duration::from_secs(n), &store);
            txn.on_timer(&mut fx);
            assert_eq!(kinds(fx.pdus()), ["nak"]);
        }
        let mut fx = Effects::new(t0 + Duration::from_secs(3), &store);
        txn.on_timer(&mut fx);
        let finished = finished_of(fx.pdus()).expect("finished");
        assert_eq!(finished.condition, ConditionCode::NakLimitReached);
        assert_eq!(fx.reports()[0].outcome, Outcome::Failed);
        assert_eq!(fx.reports()[0].condition, ConditionCode::NakLimitReached);
    }

    #[test]
    fn late_eof_is_answered_without_second_report() {
        let store = saving_store();
        let t0 = Instant::now();
        let mode = TransmissionMode::Acknowledged;
        let mut txn = open(mode, true, &store, t0);

        let mut fx = Effects::new(t0, &store);
        for offset in [0, 4, 8] {
            txn.on_pdu(segment(mode, offset), &mut fx);
        }
        txn.on_pdu(eof(mode, good_checksum()), &mut fx);
        assert_eq!(fx.reports().len(), 1);

        let mut fx = Effects::new(t0, &store);
        txn.on_pdu(eof(mode, good_checksum()), &mut fx);
        assert_eq!(kinds(fx.pdus()), ["ack", "finished"]);
        assert!(fx.reports().is_empty());

        // Finished repeats until the sender ACKs it
        assert_eq!(txn.next_deadline(), Some(t0 + Duration::from_secs(1)));
        let ack = inbound(
            mode,
            PduPayload::Ack(Ack {
                directive: DirectiveCode::Finished,
                condition: ConditionCode::NoError,
                status: TransactionStatus::Terminated,
            }),
        );
        let mut fx = Effects::new(t0, &store);
        txn.on_pdu(ack, &mut fx);
        assert_eq!(txn.next_deadline(), None);
    }

    #[test]
    fn many_gaps_split_across_naks() {
        let store = MockFileStore::new();
        let t0 = Instant::now();
        let mode = TransmissionMode::Acknowledged;
        let size = 400u64;
        let metadata = Metadata {
            closure_requested: true,
            checksum_type: ChecksumType::Null,
            file_size: size,
            source_file: "big.bin".into(),
            destination_file: "big.bin".into(),
        };
        let open_pdu = inbound(mode, PduPayload::Metadata(metadata.clone()));
        let mut fx = Effects::new(t0, &store);
        let mut txn = ReceiverTransaction::new(&open_pdu.header, metadata, peer(), u64::MAX, &mut fx);

        // every other byte: 200 one-byte gaps
        for offset in (1..size).step_by(2) {
            let fd = FileData { offset, data: vec![0], segment_metadata: Vec::new() };
            txn.on_pdu(inbound(mode, PduPayload::FileData(fd)), &mut fx);
        }
        let mut fx = Effects::new(t0, &store);
        let end = Eof { condition: ConditionCode::NoError, checksum: 0, file_size: size, fault_location: None };
        txn.on_pdu(inbound(mode, PduPayload::Eof(end)), &mut fx);

        let naks = naks_of(fx.pdus());
        assert_eq!(naks.len(), 4);
        assert!(naks.iter().all(|n| n.gaps.len() <= MAX_NAK_GAPS));
        assert_eq!(naks.iter().map(|n| n.gaps.len()).sum::<usize>(), 200);
        assert_eq!(naks[0].start_scope, 0);
        assert_eq!(naks[1].start_scope, naks[1].gaps[0].0);
        assert_eq!(naks[3].end_scope, size);
    }

    #[test]
    fn keepalive_prompt_reports_contiguous_progress() {
        let store = MockFileStore::new();
        let t0 = Instant::now();
        let mode = TransmissionMode::Acknowledged;
        let mut txn = open(mode, true, &store, t0);

        let mut fx = Effects::new(t0, &store);
        txn.on_pdu(segment(mode, 0), &mut fx);
        txn.on_pdu(segment(mode, 8), &mut fx);
        let prompt = PduPayload::Prompt(Prompt { response: PromptKind::KeepAlive });
        let mut fx = Effects::new(t0, &store);
        txn.on_pdu(inbound(mode, prompt), &mut fx);
        match &fx.pdus()[0].payload {
            PduPayload::KeepAlive(k) => assert_eq!(k.progress, 4),
            other => panic!("expected keep alive, got {other:?}"),
        }

        let prompt = PduPayload::Prompt(Prompt { response: PromptKind::Nak });
        let mut fx = Effects::new(t0, &store);
        txn.on_pdu(inbound(mode, prompt), &mut fx);
        assert_eq!(naks_of(fx.pdus())[0].gaps, vec![(4, 8)]);
    }

    #[test]
    fn peer_cancel_is_acked_and_reported() {
        let store = MockFileStore::new();
        let t0 = Instant::now();
        let mode = TransmissionMode::Acknowledged;
        let mut txn = open(mode, true, &store, t0);

        let cancel = Eof {
            condition: ConditionCode::CancelRequestReceived,
            checksum: 0,
            file_size: 4,
            fault_location: Some(EntityId(1)),
        };
        let mut fx = Effects::new(t0, &store);
        txn.on_pdu(inbound(mode, PduPayload::Eof(cancel)), &mut fx);
        assert_eq!(kinds(fx.pdus()), ["ack"]);
        assert_eq!(fx.reports()[0].outcome, Outcome::Cancelled);
        assert_eq!(fx.reports()[0].condition, ConditionCode::CancelRequestReceived);
        assert!(txn.is_terminal());
    }

    #[test]
    fn store_failure_still_finishes() {
        let mut store = MockFileStore::new();
        store
            .expect_save()
            .times(1)
            .returning(|name: &str, _data: Vec<u8>, _meta: &FileMetadata| {
                Err(StoreError::AlreadyExists(name.to_string()))
            });
        let t0 = Instant::now();
        let mode = TransmissionMode::Acknowledged;
        let mut txn = open(mode, true, &store, t0);

        let mut fx = Effects::new(t0, &store);
        for offset in [0, 4, 8] {
            txn.on_pdu(segment(mode, offset), &mut fx);
        }
        txn.on_pdu(eof(mode, good_checksum()), &mut fx);

        let finished = finished_of(fx.pdus()).expect("finished");
        assert_eq!(finished.condition, ConditionCode::FilestoreRejection);
        assert_eq!(finished.delivery, DeliveryCode::Complete);
        assert_eq!(finished.file_status, FileStatus::DiscardedFilestoreRejection);
        let report = &fx.reports()[0];
        assert_eq!(report.outcome, Outcome::Complete);
        assert_eq!(report.store_error.as_deref(), Some("a.bin already exists"));
        assert_eq!(txn.state(), ReceiverState::Finished);
    }

    #[test]
    fn oversized_file_is_refused() {
        let store = MemoryStore::new(ConflictPolicy::Reject);
        let t0 = Instant::now();
        let mode = TransmissionMode::Acknowledged;
        let metadata = Metadata {
            closure_requested: true,
            checksum_type: ChecksumType::Modular,
            file_size: 1 << 40,
            source_file: "huge.bin".into(),
            destination_file: String::new(),
        };
        let pdu = inbound(mode, PduPayload::Metadata(metadata.clone()));
        let mut fx = Effects::new(t0, &store);
        let txn = ReceiverTransaction::new(&pdu.header, metadata, peer(), 1 << 20, &mut fx);

        assert!(txn.is_terminal());
        assert_eq!(txn.info().destination_file, "huge.bin");
        assert_eq!(fx.reports()[0].outcome, Outcome::Failed);
        assert_eq!(fx.reports()[0].condition, ConditionCode::FileSizeError);
        assert_eq!(finished_of(fx.pdus()).map(|f| f.condition), Some(ConditionCode::FileSizeError));
    }

    #[test]
    fn inactivity_cancels_receiver_once() {
        let store = MockFileStore::new();
        let t0 = Instant::now();
        let mode = TransmissionMode::Unacknowledged;
        let mut txn = open(mode, false, &store, t0);

        let mut fx = Effects::new(t0 + Duration::from_secs(30), &store);
        txn.on_timer(&mut fx);
        assert_eq!(fx.reports().len(), 1);
        assert_eq!(fx.reports()[0].outcome, Outcome::Cancelled);
        assert_eq!(fx.reports()[0].condition, ConditionCode::InactivityDetected);
        // class 1 without closure has no one to tell
        assert!(fx.pdus().is_empty());

        let mut fx = Effects::new(t0 + Duration::from_secs(90), &store);
        txn.on_timer(&mut fx);
        assert!(fx.reports().is_empty());
    }
}
