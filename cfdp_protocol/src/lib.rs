// lib.rs — CFDP-style PDU vocabulary and codec shared by every entity

mod checksum;

pub use checksum::ChecksumType;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================== Common =====================================

pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 15;
pub const CRC_LEN: usize = 4;
pub const MAX_DATA_FIELD_LEN: usize = u16::MAX as usize;
/// Segment-metadata length byte + u64 offset.
pub const FILE_DATA_OVERHEAD: usize = 9;
pub const MAX_SEGMENT_LEN: usize = MAX_DATA_FIELD_LEN - FILE_DATA_OVERHEAD;
/// Gaps per NAK PDU; larger gap lists are split across PDUs.
pub const MAX_NAK_GAPS: usize = 64;

const TLV_FAULT_LOCATION: u8 = 0x06;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionSeq(pub u32);

impl fmt::Display for TransactionSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Originating entity + its sequence number. Globally unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId {
    pub source: EntityId,
    pub seq: TransactionSeq,
}

impl TransactionId {
    pub fn new(source: EntityId, seq: u32) -> Self {
        Self { source, seq: TransactionSeq(seq) }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.seq)
    }
}

// =============================== Enums ======================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PduType {
    Directive,
    FileData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    TowardReceiver,
    TowardSender,
}

/// Serialised as the class number: 1 = unacknowledged, 2 = acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TransmissionMode {
    Unacknowledged,
    Acknowledged,
}

impl TransmissionMode {
    pub fn class(self) -> u8 {
        match self {
            TransmissionMode::Unacknowledged => 1,
            TransmissionMode::Acknowledged => 2,
        }
    }
}

impl TryFrom<u8> for TransmissionMode {
    type Error = String;

    fn try_from(class: u8) -> Result<Self, Self::Error> {
        match class {
            1 => Ok(TransmissionMode::Unacknowledged),
            2 => Ok(TransmissionMode::Acknowledged),
            other => Err(format!("transfer class must be 1 or 2, got {other}")),
        }
    }
}

impl From<TransmissionMode> for u8 {
    fn from(mode: TransmissionMode) -> u8 {
        mode.class()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionCode {
    NoError = 0,
    PositiveAckLimitReached = 1,
    KeepAliveLimitReached = 2,
    InvalidTransmissionMode = 3,
    FilestoreRejection = 4,
    FileChecksumFailure = 5,
    FileSizeError = 6,
    NakLimitReached = 7,
    InactivityDetected = 8,
    InvalidFileStructure = 9,
    CheckLimitReached = 10,
    UnsupportedChecksumType = 11,
    SuspendRequestReceived = 14,
    CancelRequestReceived = 15,
}

impl ConditionCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        use ConditionCode::*;
        Some(match v {
            0 => NoError,
            1 => PositiveAckLimitReached,
            2 => KeepAliveLimitReached,
            3 => InvalidTransmissionMode,
            4 => FilestoreRejection,
            5 => FileChecksumFailure,
            6 => FileSizeError,
            7 => NakLimitReached,
            8 => InactivityDetected,
            9 => InvalidFileStructure,
            10 => CheckLimitReached,
            11 => UnsupportedChecksumType,
            14 => SuspendRequestReceived,
            15 => CancelRequestReceived,
            _ => return None,
        })
    }

    pub fn is_error(self) -> bool {
        self != ConditionCode::NoError
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveCode {
    Eof = 0x04,
    Finished = 0x05,
    Ack = 0x06,
    Metadata = 0x07,
    Nak = 0x08,
    Prompt = 0x09,
    KeepAlive = 0x0C,
}

impl DirectiveCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x04 => DirectiveCode::Eof,
            0x05 => DirectiveCode::Finished,
            0x06 => DirectiveCode::Ack,
            0x07 => DirectiveCode::Metadata,
            0x08 => DirectiveCode::Nak,
            0x09 => DirectiveCode::Prompt,
            0x0C => DirectiveCode::KeepAlive,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryCode {
    Complete = 0,
    Incomplete = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    DiscardedDeliberately = 0,
    DiscardedFilestoreRejection = 1,
    Retained = 2,
    Unreported = 3,
}

impl FileStatus {
    fn from_u8(v: u8) -> Self {
        match v & 0b11 {
            0 => FileStatus::DiscardedDeliberately,
            1 => FileStatus::DiscardedFilestoreRejection,
            2 => FileStatus::Retained,
            _ => FileStatus::Unreported,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Undefined = 0,
    Active = 1,
    Terminated = 2,
    Unrecognized = 3,
}

impl TransactionStatus {
    fn from_u8(v: u8) -> Self {
        match v & 0b11 {
            0 => TransactionStatus::Undefined,
            1 => TransactionStatus::Active,
            2 => TransactionStatus::Terminated,
            _ => TransactionStatus::Unrecognized,
        }
    }
}

/// What a Prompt asks the peer to answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    Nak,
    KeepAlive,
}

// =============================== Errors =====================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed header: {0}")]
    MalformedHeader(String),
    #[error("unknown directive code 0x{0:02x}")]
    UnknownDirectiveCode(u8),
    #[error("truncated payload: need {needed} more bytes, {available} available")]
    TruncatedPayload { needed: usize, available: usize },
    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("file name longer than 255 bytes ({0})")]
    NameTooLong(usize),
    #[error("segment metadata longer than 255 bytes ({0})")]
    SegmentMetadataTooLong(usize),
    #[error("data field of {0} bytes exceeds {MAX_DATA_FIELD_LEN}")]
    PayloadTooLarge(usize),
}

// ============================== Header ======================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PduHeader {
    pub version: u8,
    pub pdu_type: PduType,
    pub direction: Direction,
    pub mode: TransmissionMode,
    pub crc: bool,
    /// Payload length only; the CRC trailer is not counted.
    pub data_field_length: u16,
    pub source: EntityId,
    pub seq: TransactionSeq,
    pub destination: EntityId,
}

impl PduHeader {
    pub fn transaction_id(&self) -> TransactionId {
        TransactionId { source: self.source, seq: self.seq }
    }

    fn write(&self, out: &mut Vec<u8>) {
        let mut b0 = (self.version & 0b111) << 5;
        if self.pdu_type == PduType::FileData {
            b0 |= 1 << 4;
        }
        if self.direction == Direction::TowardSender {
            b0 |= 1 << 3;
        }
        if self.mode == TransmissionMode::Unacknowledged {
            b0 |= 1 << 2;
        }
        if self.crc {
            b0 |= 1 << 1;
        }
        out.push(b0);
        out.extend_from_slice(&self.data_field_length.to_be_bytes());
        out.extend_from_slice(&self.source.0.to_be_bytes());
        out.extend_from_slice(&self.seq.0.to_be_bytes());
        out.extend_from_slice(&self.destination.0.to_be_bytes());
    }

    fn read(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::MalformedHeader(format!(
                "need {HEADER_LEN} header bytes, got {}",
                buf.len()
            )));
        }
        let b0 = buf[0];
        let version = b0 >> 5;
        if version != PROTOCOL_VERSION {
            return Err(DecodeError::MalformedHeader(format!("unsupported version {version}")));
        }
        if b0 & 1 != 0 {
            return Err(DecodeError::MalformedHeader("reserved bit set".into()));
        }
        let be32 = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Ok(PduHeader {
            version,
            pdu_type: if b0 & (1 << 4) != 0 { PduType::FileData } else { PduType::Directive },
            direction: if b0 & (1 << 3) != 0 { Direction::TowardSender } else { Direction::TowardReceiver },
            mode: if b0 & (1 << 2) != 0 {
                TransmissionMode::Unacknowledged
            } else {
                TransmissionMode::Acknowledged
            },
            crc: b0 & (1 << 1) != 0,
            data_field_length: u16::from_be_bytes([buf[1], buf[2]]),
            source: EntityId(be32(3)),
            seq: TransactionSeq(be32(7)),
            destination: EntityId(be32(11)),
        })
    }
}

// ============================== Payloads ====================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub closure_requested: bool,
    pub checksum_type: ChecksumType,
    pub file_size: u64,
    pub source_file: String,
    pub destination_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileData {
    pub offset: u64,
    pub data: Vec<u8>,
    /// Empty when the segment carries no metadata.
    pub segment_metadata: Vec<u8>,
}

impl FileData {
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.data.len() as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eof {
    pub condition: ConditionCode,
    pub checksum: u32,
    pub file_size: u64,
    pub fault_location: Option<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Only `Eof` and `Finished` are ever acknowledged.
    pub directive: DirectiveCode,
    pub condition: ConditionCode,
    pub status: TransactionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nak {
    pub start_scope: u64,
    pub end_scope: u64,
    /// Half-open `[start, end)` byte ranges, ascending.
    pub gaps: Vec<(u64, u64)>,
}

impl Nak {
    /// The end-of-file sentinel is a gap ending one past the file size.
    pub fn requests_eof(&self, file_size: u64) -> bool {
        file_size
            .checked_add(1)
            .is_some_and(|sentinel| self.gaps.iter().any(|&(_, end)| end == sentinel))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finished {
    pub condition: ConditionCode,
    pub delivery: DeliveryCode,
    pub file_status: FileStatus,
    pub fault_location: Option<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub response: PromptKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAlive {
    pub progress: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum PduPayload {
    Metadata(Metadata),
    FileData(FileData),
    Eof(Eof),
    Ack(Ack),
    Nak(Nak),
    Finished(Finished),
    Prompt(Prompt),
    KeepAlive(KeepAlive),
}

impl PduPayload {
    pub fn pdu_type(&self) -> PduType {
        match self {
            PduPayload::FileData(_) => PduType::FileData,
            _ => PduType::Directive,
        }
    }

    pub fn directive(&self) -> Option<DirectiveCode> {
        Some(match self {
            PduPayload::FileData(_) => return None,
            PduPayload::Metadata(_) => DirectiveCode::Metadata,
            PduPayload::Eof(_) => DirectiveCode::Eof,
            PduPayload::Ack(_) => DirectiveCode::Ack,
            PduPayload::Nak(_) => DirectiveCode::Nak,
            PduPayload::Finished(_) => DirectiveCode::Finished,
            PduPayload::Prompt(_) => DirectiveCode::Prompt,
            PduPayload::KeepAlive(_) => DirectiveCode::KeepAlive,
        })
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PduPayload::Metadata(_) => "metadata",
            PduPayload::FileData(_) => "file_data",
            PduPayload::Eof(_) => "eof",
            PduPayload::Ack(_) => "ack",
            PduPayload::Nak(_) => "nak",
            PduPayload::Finished(_) => "finished",
            PduPayload::Prompt(_) => "prompt",
            PduPayload::KeepAlive(_) => "keep_alive",
        }
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        if let Some(code) = self.directive() {
            out.push(code as u8);
        }
        match self {
            PduPayload::Metadata(m) => {
                let flags = (u8::from(m.closure_requested) << 6) | m.checksum_type.code();
                out.push(flags);
                out.extend_from_slice(&m.file_size.to_be_bytes());
                write_lv(out, &m.source_file)?;
                write_lv(out, &m.destination_file)?;
            }
            PduPayload::FileData(fd) => {
                let meta_len = u8::try_from(fd.segment_metadata.len())
                    .map_err(|_| EncodeError::SegmentMetadataTooLong(fd.segment_metadata.len()))?;
                out.push(meta_len);
                out.extend_from_slice(&fd.segment_metadata);
                out.extend_from_slice(&fd.offset.to_be_bytes());
                out.extend_from_slice(&fd.data);
            }
            PduPayload::Eof(e) => {
                out.push((e.condition as u8) << 4);
                out.extend_from_slice(&e.checksum.to_be_bytes());
                out.extend_from_slice(&e.file_size.to_be_bytes());
                write_fault_location(out, e.fault_location);
            }
            PduPayload::Ack(a) => {
                // subtype 1 marks an ACK of Finished
                let subtype = u8::from(a.directive == DirectiveCode::Finished);
                out.push(((a.directive as u8) << 4) | subtype);
                out.push(((a.condition as u8) << 4) | a.status as u8);
            }
            PduPayload::Nak(n) => {
                out.extend_from_slice(&n.start_scope.to_be_bytes());
                out.extend_from_slice(&n.end_scope.to_be_bytes());
                for &(start, end) in &n.gaps {
                    out.extend_from_slice(&start.to_be_bytes());
                    out.extend_from_slice(&end.to_be_bytes());
                }
            }
            PduPayload::Finished(f) => {
                out.push(((f.condition as u8) << 4) | ((f.delivery as u8) << 2) | f.file_status as u8);
                write_fault_location(out, f.fault_location);
            }
            PduPayload::Prompt(p) => {
                out.push(u8::from(p.response == PromptKind::KeepAlive) << 7);
            }
            PduPayload::KeepAlive(k) => {
                out.extend_from_slice(&k.progress.to_be_bytes());
            }
        }
        Ok(())
    }

    fn read(pdu_type: PduType, data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(data);
        if pdu_type == PduType::FileData {
            let meta_len = r.u8()? as usize;
            let segment_metadata = r.bytes(meta_len)?.to_vec();
            let offset = r.u64()?;
            let data = r.rest().to_vec();
            return Ok(PduPayload::FileData(FileData { offset, data, segment_metadata }));
        }

        let code = r.u8()?;
        let directive = DirectiveCode::from_u8(code).ok_or(DecodeError::UnknownDirectiveCode(code))?;
        let payload = match directive {
            DirectiveCode::Metadata => {
                let flags = r.u8()?;
                let checksum_type = ChecksumType::from_code(flags & 0x0F).ok_or(
                    DecodeError::InvalidField { field: "checksum type", value: (flags & 0x0F) as u64 },
                )?;
                PduPayload::Metadata(Metadata {
                    closure_requested: flags & (1 << 6) != 0,
                    checksum_type,
                    file_size: r.u64()?,
                    source_file: r.lv()?,
                    destination_file: r.lv()?,
                })
            }
            DirectiveCode::Eof => {
                let condition = condition(r.u8()? >> 4)?;
                let checksum = r.u32()?;
                let file_size = r.u64()?;
                let fault_location = r.fault_location()?;
                PduPayload::Eof(Eof { condition, checksum, file_size, fault_location })
            }
            DirectiveCode::Ack => {
                let b = r.u8()?;
                let acked = DirectiveCode::from_u8(b >> 4)
                    .filter(|d| matches!(d, DirectiveCode::Eof | DirectiveCode::Finished))
                    .ok_or(DecodeError::InvalidField { field: "acknowledged directive", value: (b >> 4) as u64 })?;
                let b = r.u8()?;
                PduPayload::Ack(Ack {
                    directive: acked,
                    condition: condition(b >> 4)?,
                    status: TransactionStatus::from_u8(b),
                })
            }
            DirectiveCode::Nak => {
                let start_scope = r.u64()?;
                let end_scope = r.u64()?;
                let mut gaps = Vec::with_capacity(r.remaining() / 16);
                while r.remaining() > 0 {
                    let start = r.u64()?;
                    let end = r.u64()?;
                    gaps.push((start, end));
                }
                PduPayload::Nak(Nak { start_scope, end_scope, gaps })
            }
            DirectiveCode::Finished => {
                let b = r.u8()?;
                let condition = condition(b >> 4)?;
                let delivery = if b & (1 << 2) != 0 { DeliveryCode::Incomplete } else { DeliveryCode::Complete };
                let fault_location = r.fault_location()?;
                PduPayload::Finished(Finished {
                    condition,
                    delivery,
                    file_status: FileStatus::from_u8(b),
                    fault_location,
                })
            }
            DirectiveCode::Prompt => {
                let b = r.u8()?;
                let response = if b >> 7 == 1 { PromptKind::KeepAlive } else { PromptKind::Nak };
                PduPayload::Prompt(Prompt { response })
            }
            DirectiveCode::KeepAlive => PduPayload::KeepAlive(KeepAlive { progress: r.u64()? }),
        };

        if r.remaining() != 0 {
            return Err(DecodeError::MalformedHeader(format!(
                "{} trailing bytes after {} payload",
                r.remaining(),
                payload.kind()
            )));
        }
        Ok(payload)
    }
}

fn condition(v: u8) -> Result<ConditionCode, DecodeError> {
    ConditionCode::from_u8(v).ok_or(DecodeError::InvalidField { field: "condition code", value: v as u64 })
}

fn write_lv(out: &mut Vec<u8>, s: &str) -> Result<(), EncodeError> {
    let len = u8::try_from(s.len()).map_err(|_| EncodeError::NameTooLong(s.len()))?;
    out.push(len);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn write_fault_location(out: &mut Vec<u8>, loc: Option<EntityId>) {
    if let Some(id) = loc {
        out.push(TLV_FAULT_LOCATION);
        out.push(4);
        out.extend_from_slice(&id.0.to_be_bytes());
    }
}

/// Bounds-checked cursor over one data field.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::TruncatedPayload { needed: n, available: self.remaining() });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    fn lv(&mut self) -> Result<String, DecodeError> {
        let len = self.u8()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| DecodeError::InvalidField { field: "file name encoding", value: len as u64 })
    }

    fn fault_location(&mut self) -> Result<Option<EntityId>, DecodeError> {
        if self.remaining() == 0 {
            return Ok(None);
        }
        let tlv_type = self.u8()?;
        if tlv_type != TLV_FAULT_LOCATION {
            return Err(DecodeError::InvalidField { field: "TLV type", value: tlv_type as u64 });
        }
        let len = self.u8()?;
        if len != 4 {
            return Err(DecodeError::InvalidField { field: "fault location length", value: len as u64 });
        }
        Ok(Some(EntityId(self.u32()?)))
    }
}

// ================================ PDU =======================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pdu {
    pub header: PduHeader,
    pub payload: PduPayload,
}

impl Pdu {
    /// Builds a PDU for `id`; the data field length is computed from `payload`.
    pub fn new(
        id: TransactionId,
        destination: EntityId,
        direction: Direction,
        mode: TransmissionMode,
        payload: PduPayload,
    ) -> Self {
        let mut body = Vec::new();
        // an unencodable payload is caught again by encode()
        let data_field_length = match payload.write(&mut body) {
            Ok(()) => u16::try_from(body.len()).unwrap_or(u16::MAX),
            Err(_) => 0,
        };
        let header = PduHeader {
            version: PROTOCOL_VERSION,
            pdu_type: payload.pdu_type(),
            direction,
            mode,
            crc: false,
            data_field_length,
            source: id.source,
            seq: id.seq,
            destination,
        };
        Self { header, payload }
    }

    pub fn with_crc(mut self, crc: bool) -> Self {
        self.header.crc = crc;
        self
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.header.transaction_id()
    }

    /// Header fields and the data field length are always recomputed from the payload.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut body = Vec::with_capacity(self.header.data_field_length as usize);
        self.payload.write(&mut body)?;
        if body.len() > MAX_DATA_FIELD_LEN {
            return Err(EncodeError::PayloadTooLarge(body.len()));
        }

        let header = PduHeader {
            pdu_type: self.payload.pdu_type(),
            data_field_length: body.len() as u16,
            ..self.header.clone()
        };
        let mut out = Vec::with_capacity(HEADER_LEN + body.len() + CRC_LEN);
        header.write(&mut out);
        out.extend_from_slice(&body);
        if header.crc {
            let crc = crc32fast::hash(&out);
            out.extend_from_slice(&crc.to_be_bytes());
        }
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let header = PduHeader::read(buf)?;
        let data_len = header.data_field_length as usize;
        let expected = HEADER_LEN + data_len + if header.crc { CRC_LEN } else { 0 };
        if buf.len() != expected {
            return Err(DecodeError::MalformedHeader(format!(
                "declared {expected} bytes, got {}",
                buf.len()
            )));
        }
        if header.crc {
            let split = HEADER_LEN + data_len;
            let got = u32::from_be_bytes([buf[split], buf[split + 1], buf[split + 2], buf[split + 3]]);
            let want = crc32fast::hash(&buf[..split]);
            if got != want {
                return Err(DecodeError::MalformedHeader(format!(
                    "crc mismatch: got {got:08x}, computed {want:08x}"
                )));
            }
        }
        let payload = PduPayload::read(header.pdu_type, &buf[HEADER_LEN..HEADER_LEN + data_len])?;
        Ok(Self { header, payload })
    }

    /// Header only, for routing/logging without touching the data field.
    pub fn peek_header(buf: &[u8]) -> Result<PduHeader, DecodeError> {
        PduHeader::read(buf)
    }
}

// ================================ Tests =====================================
