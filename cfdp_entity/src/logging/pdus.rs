// pdus.csv: one row per PDU crossing the link
use cfdp_protocol::{EntityId, Pdu};
use chrono::Utc;
use tokio::sync::OnceCell;

use super::csv::{LogFile, append, get_file};

static PDUS: OnceCell<LogFile> = OnceCell::const_new();

pub(crate) fn pdu_line(ts: &str, direction: &str, peer: EntityId, bytes: &[u8]) -> String {
    let (txn, kind) = match Pdu::decode(bytes) {
        Ok(pdu) => (pdu.transaction_id().to_string(), pdu.payload.kind()),
        Err(_) => (String::new(), "malformed"),
    };
    format!("{ts},{direction},{peer},{txn},{kind},{}\n", bytes.len())
}

/// `direction` is `tx`, `rx` or `drop` (simulated loss).
pub async fn log_pdu(direction: &str, peer: EntityId, bytes: &[u8]) {
    let Some(file) = get_file(&PDUS, "pdus.csv", "ts,direction,peer,txn,kind,bytes\n").await else {
        return;
    };
    let line = pdu_line(&Utc::now().to_rfc3339(), direction, peer, bytes);
    append(&file, &line).await;
}
