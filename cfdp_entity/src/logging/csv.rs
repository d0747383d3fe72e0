use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, OnceCell};
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
};
use tracing::warn;

use crate::transaction::TransferReport;

pub(crate) type LogFile = Arc<Mutex<BufWriter<tokio::fs::File>>>;

static TRANSFERS: OnceCell<LogFile> = OnceCell::const_new();

pub(crate) async fn get_file(cell: &'static OnceCell<LogFile>, name: &str, header: &str) -> Option<LogFile> {
    let dir = super::dir()?;
    let path = dir.join(name);
    let opened = cell
        .get_or_try_init(|| async {
            fs::create_dir_all(dir).await?;
            let fresh = !fs::try_exists(&path).await.unwrap_or(false);
            let f = OpenOptions::new().create(true).append(true).open(&path).await?;
            let m = Arc::new(Mutex::new(BufWriter::new(f)));
            if fresh {
                let mut g = m.lock().await;
                g.write_all(header.as_bytes()).await?;
                g.flush().await?;
            }
            Ok::<_, std::io::Error>(m)
        })
        .await;
    match opened {
        Ok(file) => Some(file.clone()),
        Err(e) => {
            warn!(event = "csv_open_failed", path = %path.display(), error = %e);
            None
        }
    }
}

pub(crate) async fn append(file: &LogFile, line: &str) {
    let mut f = file.lock().await;
    let _ = f.write_all(line.as_bytes()).await;
    let _ = f.flush().await;
}

/// Quotes a free-text field when it would break the row.
pub(crate) fn field(s: &str) -> String {
    if s.contains([',', '"', '\n']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn opt<T: std::fmt::Debug>(v: Option<T>) -> String {
    v.map(|v| format!("{v:?}")).unwrap_or_default()
}

pub(crate) fn transfer_line(ts: &str, r: &TransferReport) -> String {
    format!(
        "{ts},{},{:?},{:?},{:?},{},{},{},{},{},{}\n",
        r.id,
        r.role,
        r.outcome,
        r.condition,
        opt(r.delivery),
        opt(r.file_status),
        field(&r.file_name),
        r.file_size,
        field(r.stored_as.as_deref().unwrap_or("")),
        field(r.store_error.as_deref().unwrap_or("")),
    )
}

/// transfers.csv: ts,txn,role,outcome,condition,delivery,file_status,file,bytes,stored_as,store_error
pub async fn log_transfer(report: &TransferReport) {
    let Some(file) = get_file(
        &TRANSFERS,
        "transfers.csv",
        "ts,txn,role,outcome,condition,delivery,file_status,file,bytes,stored_as,store_error\n",
    )
    .await
    else {
        return;
    };
    let line = transfer_line(&Utc::now().to_rfc3339(), report);
    append(&file, &line).await;
}
