//! CSV audit logs. Writers open lazily under the directory given to
//! [`init`]; before that every log call is a no-op.

pub mod csv;
pub mod pdus;

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;

static LOG_DIR: OnceCell<PathBuf> = OnceCell::new();

/// Sets the CSV directory. Only the first call has any effect.
pub fn init(dir: impl Into<PathBuf>) {
    let _ = LOG_DIR.set(dir.into());
}

pub(crate) fn dir() -> Option<&'static Path> {
    LOG_DIR.get().map(PathBuf::as_path)
}
