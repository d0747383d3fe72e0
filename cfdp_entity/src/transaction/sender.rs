//! File sender, class 1 and class 2.
//!
//! Class 1: Start → Sending → Closing (closure requested) → Finished,
//! or Start → Sending → Terminal.
//! Class 2: Start → Sending → WaitEofAck → WaitFinished → Finished, with
//! Retransmitting entered whenever a NAK queues segments.

use std::collections::VecDeque;
use std::time::Instant;

use cfdp_protocol::{
    Ack, ConditionCode, DeliveryCode, Direction, DirectiveCode, Eof, Finished, FileData,
    Metadata, Nak, Pdu, PduPayload, Prompt, PromptKind, TransactionStatus, TransmissionMode,
};
use tracing::{debug, info, warn};

use super::{Effects, Outcome, Role, TransactionSummary, TransferInfo};
use crate::ranges::RangeSet;
use crate::registry::EntityConfig;
use crate::timer::{Countdown, RetryCounter, earliest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Start,
    Sending,
    Closing,
    WaitEofAck,
    WaitFinished,
    Retransmitting,
    Finished,
    Terminal,
}

#[derive(Debug)]
pub struct SenderTransaction {
    info: TransferInfo,
    peer: EntityConfig,
    data: Vec<u8>,
    checksum: u32,
    state: SenderState,
    sent: RangeSet,
    retransmit: VecDeque<(u64, u64)>,
    resend_eof: bool,
    eof_condition: ConditionCode,
    pending_ack: Option<DirectiveCode>,
    retries: RetryCounter,
    ack_timer: Countdown,
    inactivity: Countdown,
    suspended: bool,
    bytes_sent: u64,
    peer_progress: u64,
    finished_at: Option<Instant>,
    reported: bool,
}

impl SenderTransaction {
    /// Emits Metadata, every FileData segment and EOF, then settles in the
    /// first waiting state for the transfer's class.
    pub fn start(info: TransferInfo, peer: EntityConfig, data: Vec<u8>, fx: &mut Effects<'_>) -> Self {
        let checksum = info.checksum_type.compute(&data);
        let retries = RetryCounter::new(peer.max_retries);
        let mut txn = Self {
            info,
            peer,
            data,
            checksum,
            state: SenderState::Start,
            sent: RangeSet::new(),
            retransmit: VecDeque::new(),
            resend_eof: false,
            eof_condition: ConditionCode::NoError,
            pending_ack: None,
            retries,
            ack_timer: Countdown::default(),
            inactivity: Countdown::default(),
            suspended: false,
            bytes_sent: 0,
            peer_progress: 0,
            finished_at: None,
            reported: false,
        };
        info!(
            event = "send_start",
            txn = %txn.info.id,
            peer = %txn.info.peer,
            class = txn.info.mode.class(),
            closure = txn.info.closure_requested,
            bytes = txn.info.file_size,
            segment_size = txn.peer.segment_size,
        );

        txn.state = SenderState::Sending;
        txn.emit(
            PduPayload::Metadata(Metadata {
                closure_requested: txn.info.closure_requested,
                checksum_type: txn.info.checksum_type,
                file_size: txn.info.file_size,
                source_file: txn.info.source_file.clone(),
                destination_file: txn.info.destination_file.clone(),
            }),
            fx,
        );
        txn.send_range(0, txn.info.file_size, fx);
        txn.send_eof(fx);

        let now = fx.now;
        match (txn.info.mode, txn.info.closure_requested) {
            (TransmissionMode::Acknowledged, _) => {
                txn.state = SenderState::WaitEofAck;
                txn.pending_ack = Some(DirectiveCode::Eof);
                txn.ack_timer.arm(now, txn.peer.ack_timeout);
                txn.inactivity.arm(now, txn.peer.inactivity_timeout);
            }
            (TransmissionMode::Unacknowledged, true) => {
                txn.state = SenderState::Closing;
                txn.inactivity.arm(now, txn.peer.inactivity_timeout);
            }
            (TransmissionMode::Unacknowledged, false) => {
                // nothing comes back; the transfer ends at EOF
                txn.state = SenderState::Terminal;
                let report = txn.info.report(Role::Sender, Outcome::Complete, ConditionCode::NoError);
                txn.finish(report, fx);
            }
        }
        txn
    }

    pub fn info(&self) -> &TransferInfo {
        &self.info
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SenderState::Finished | SenderState::Terminal)
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.finished_at
    }

    pub fn retries(&self) -> u32 {
        self.retries.count()
    }

    /// Bytes put on the link, retransmissions included.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Last progress figure reported by the receiver in a KeepAlive.
    pub fn peer_progress(&self) -> u64 {
        self.peer_progress
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        if self.suspended || self.is_terminal() {
            return None;
        }
        earliest([self.ack_timer.deadline(), self.inactivity.deadline()])
    }

    pub fn on_pdu(&mut self, pdu: Pdu, fx: &mut Effects<'_>) {
        if self.is_terminal() {
            match pdu.payload {
                // the peer missed our ACK; answer again without a second report
                PduPayload::Finished(f) if self.info.mode == TransmissionMode::Acknowledged => {
                    debug!(event = "duplicate_finished", txn = %self.info.id);
                    self.ack_finished(f.condition, fx);
                }
                other => {
                    debug!(event = "late_pdu", txn = %self.info.id, kind = other.kind());
                }
            }
            return;
        }

        if !self.suspended {
            self.inactivity.arm(fx.now, self.peer.inactivity_timeout);
        }
        let acknowledged = self.info.mode == TransmissionMode::Acknowledged;
        match pdu.payload {
            PduPayload::Ack(ack) if ack.directive == DirectiveCode::Eof => self.on_eof_ack(),
            PduPayload::Nak(nak) if acknowledged => self.on_nak(nak, fx),
            PduPayload::Finished(finished) => self.on_finished(finished, fx),
            PduPayload::Prompt(Prompt { response: PromptKind::Nak }) if acknowledged => {
                // nothing is tracked as unacknowledged besides EOF itself
                self.send_eof(fx);
            }
            PduPayload::KeepAlive(k) => self.peer_progress = k.progress,
            other => {
                debug!(event = "ignored_pdu", txn = %self.info.id, state = ?self.state, kind = other.kind());
            }
        }
    }

    pub fn on_timer(&mut self, fx: &mut Effects<'_>) {
        if self.suspended || self.is_terminal() {
            return;
        }
        let now = fx.now;
        if self.inactivity.expired(now) {
            warn!(event = "inactivity", txn = %self.info.id, state = ?self.state);
            self.abandon(ConditionCode::InactivityDetected, fx);
            return;
        }
        if self.ack_timer.expired(now) {
            if self.retries.bump() {
                info!(event = "eof_retry", txn = %self.info.id, attempt = self.retries.count());
                self.send_eof(fx);
                self.ack_timer.arm(now, self.peer.ack_timeout);
            } else {
                warn!(event = "ack_limit_reached", txn = %self.info.id, retries = self.peer.max_retries);
                self.fail(ConditionCode::PositiveAckLimitReached, fx);
            }
        }
    }

    /// User cancel: EOF(cancel) best-effort, then terminal.
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
        self.ack_timer.disarm();
        self.inactivity.disarm();
        info!(event = "suspend", txn = %self.info.id, queued = self.retransmit.len());
    }

    pub fn resume(&mut self, fx: &mut Effects<'_>) {
        if self.is_terminal() || !self.suspended {
            return;
        }
        self.suspended = false;
        let now = fx.now;
        if self.pending_ack.is_some() {
            self.ack_timer.arm(now, self.peer.ack_timeout);
        }
        self.inactivity.arm(now, self.peer.inactivity_timeout);
        info!(event = "resume", txn = %self.info.id, queued = self.retransmit.len());
        self.drain(fx);
    }

    /// Asks the receiver for a NAK or a KeepAlive. Class 2 only.
    pub fn prompt(&mut self, kind: PromptKind, fx: &mut Effects<'_>) {
        if self.is_terminal() || self.info.mode != TransmissionMode::Acknowledged {
            debug!(event = "prompt_skipped", txn = %self.info.id, state = ?self.state);
            return;
        }
        self.emit(PduPayload::Prompt(Prompt { response: kind }), fx);
    }

    pub fn summary(&self) -> TransactionSummary {
        TransactionSummary {
            id: self.info.id,
            role: Role::Sender,
            class: self.info.mode.class(),
            peer: self.info.peer,
            state: format!("{:?}", self.state),
            file_name: self.info.source_file.clone(),
            file_size: self.info.file_size,
            progress: self.sent.total(),
            suspended: self.suspended,
            terminal: self.is_terminal(),
        }
    }

    // ---------------------------------------------------------------------

    fn emit(&self, payload: PduPayload, fx: &mut Effects<'_>) {
        let pdu = Pdu::new(
            self.info.id,
            self.info.peer,
            Direction::TowardReceiver,
            self.info.mode,
            payload,
        )
        .with_crc(self.peer.crc);
        fx.send(pdu);
    }

    /// FileData for `[start, end)` in `segment_size` chunks, ascending.
    fn send_range(&mut self, start: u64, end: u64, fx: &mut Effects<'_>) {
        let segment = self.peer.segment_size as u64;
        let mut offset = start;
        while offset < end {
            let stop = (offset + segment).min(end);
            let data = self.data[offset as usize..stop as usize].to_vec();
            self.emit(
                PduPayload::FileData(FileData { offset, data, segment_metadata: Vec::new() }),
                fx,
            );
            self.bytes_sent += stop - offset;
            self.sent.insert(offset, stop);
            offset = stop;
        }
    }

    fn send_eof(&self, fx: &mut Effects<'_>) {
        let fault_location = self.eof_condition.is_error().then_some(self.info.id.source);
        self.emit(
            PduPayload::Eof(Eof {
                condition: self.eof_condition,
                checksum: self.checksum,
                file_size: self.info.file_size,
                fault_location,
            }),
            fx,
        );
    }

    fn ack_finished(&self, condition: ConditionCode, fx: &mut Effects<'_>) {
        self.emit(
            PduPayload::Ack(Ack {
                directive: DirectiveCode::Finished,
                condition,
                status: TransactionStatus::Terminated,
            }),
            fx,
        );
    }

    fn on_eof_ack(&mut self) {
        if self.pending_ack != Some(DirectiveCode::Eof) {
            debug!(event = "duplicate_eof_ack", txn = %self.info.id);
            return;
        }
        self.pending_ack = None;
        self.ack_timer.disarm();
        self.retries.reset();
        if self.state == SenderState::WaitEofAck {
            self.state = SenderState::WaitFinished;
        }
        debug!(event = "eof_acked", txn = %self.info.id);
    }

    fn on_nak(&mut self, nak: Nak, fx: &mut Effects<'_>) {
        let size = self.info.file_size;
        if nak.requests_eof(size) {
            self.resend_eof = true;
        }
        for &(start, end) in &nak.gaps {
            let end = end.min(size);
            if start < end {
                self.retransmit.push_back((start, end));
            }
        }
        info!(
            event = "nak_received",
            txn = %self.info.id,
            gaps = nak.gaps.len(),
            queued = self.retransmit.len(),
            eof = self.resend_eof,
        );
        if !self.retransmit.is_empty() {
            self.state = SenderState::Retransmitting;
        }
        if !self.suspended {
            self.drain(fx);
        }
    }

    /// Sends every queued gap (and EOF if asked), then returns to waiting.
    fn drain(&mut self, fx: &mut Effects<'_>) {
        while let Some((start, end)) = self.retransmit.pop_front() {
            self.send_range(start, end, fx);
        }
        if self.resend_eof {
            self.resend_eof = false;
            self.send_eof(fx);
        }
        if self.state == SenderState::Retransmitting {
            self.state = if self.pending_ack.is_some() {
                SenderState::WaitEofAck
            } else {
                SenderState::WaitFinished
            };
        }
    }

    fn on_finished(&mut self, finished: Finished, fx: &mut Effects<'_>) {
        if self.info.mode == TransmissionMode::Acknowledged {
            self.ack_finished(finished.condition, fx);
        }
        self.retransmit.clear();
        self.resend_eof = false;
        self.pending_ack = None;
        self.state = SenderState::Finished;

        let outcome = if finished.condition == ConditionCode::CancelRequestReceived {
            Outcome::Cancelled
        } else if finished.delivery == DeliveryCode::Complete {
            Outcome::Complete
        } else {
            Outcome::Incomplete
        };
        info!(
            event = "finished_received",
            txn = %self.info.id,
            condition = ?finished.condition,
            delivery = ?finished.delivery,
            file_status = ?finished.file_status,
        );
        let mut report = self.info.report(Role::Sender, outcome, finished.condition);
        report.delivery = Some(finished.delivery);
        report.file_status = Some(finished.file_status);
        self.finish(report, fx);
    }

    /// Cancellation (user or inactivity). The peer sees CancelRequestReceived;
    /// the local report carries `fault`.
    fn abandon(&mut self, fault: ConditionCode, fx: &mut Effects<'_>) {
        self.eof_condition = ConditionCode::CancelRequestReceived;
        self.send_eof(fx);
        self.state = SenderState::Terminal;
        let report = self.info.report(Role::Sender, Outcome::Cancelled, fault);
        self.finish(report, fx);
    }

    fn fail(&mut self, condition: ConditionCode, fx: &mut Effects<'_>) {
        // tell the receiver to stop waiting; it may never hear it
        self.eof_condition = condition;
        self.send_eof(fx);
        self.state = SenderState::Terminal;
        let report = self.info.report(Role::Sender, Outcome::Failed, condition);
        self.finish(report, fx);
    }

    fn finish(&mut self, report: super::TransferReport, fx: &mut Effects<'_>) {
        self.ack_timer.disarm();
        self.inactivity.disarm();
        self.retransmit.clear();
        self.finished_at = Some(fx.now);
        if self.reported {
            return;
        }
        self.reported = true;
        info!(
            event = "send_done",
            txn = %self.info.id,
            outcome = ?report.outcome,
            condition = ?report.condition,
            bytes_sent = self.bytes_sent,
        );
        fx.report(report);
    }
}
