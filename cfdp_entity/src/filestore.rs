//! Where completed files land. The engine only calls `save`/`exists`; the
//! naming and overwrite policy belongs to the adapter.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use cfdp_protocol::{ChecksumType, EntityId, TransactionId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

/// Written next to each stored file as `<name>.meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub transaction: TransactionId,
    pub source_entity: EntityId,
    pub source_file: String,
    pub file_size: u64,
    pub checksum_type: ChecksumType,
    pub checksum: u32,
    pub received_at: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
pub trait FileStore {
    /// Stores `data` under `name` (or a policy-chosen variant of it) and
    /// returns the name actually used.
    fn save(&self, name: &str, data: Vec<u8>, meta: &FileMetadata) -> Result<String, StoreError>;
    fn exists(&self, name: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    Reject,
    /// `name.ext` becomes `name_1.ext`, `name_2.ext`, ...
    Rename,
    Overwrite,
}

const MAX_RENAME_ATTEMPTS: u32 = 1000;

/// Path separators are not allowed to escape the store root.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "unnamed".to_string(),
        _ => cleaned,
    }
}

fn numbered(name: &str, n: u32) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}_{n}{}", &name[..dot], &name[dot..]),
        _ => format!("{name}_{n}"),
    }
}

/// Picks the name to store under, or refuses per `policy`.
fn resolve_name(
    name: &str,
    policy: ConflictPolicy,
    exists: impl Fn(&str) -> bool,
) -> Result<String, StoreError> {
    if !exists(name) {
        return Ok(name.to_string());
    }
    match policy {
        ConflictPolicy::Overwrite => Ok(name.to_string()),
        ConflictPolicy::Reject => Err(StoreError::AlreadyExists(name.to_string())),
        ConflictPolicy::Rename => (1..=MAX_RENAME_ATTEMPTS)
            .map(|n| numbered(name, n))
            .find(|candidate| !exists(candidate))
            .ok_or_else(|| StoreError::AlreadyExists(name.to_string())),
    }
}

/// Files under one directory, each with a JSON metadata sidecar.
#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
    policy: ConflictPolicy,
    // serialises name resolution + write so two saves can't claim one name
    lock: Mutex<()>,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>, policy: ConflictPolicy) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, policy, lock: Mutex::new(()) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Write-to-temp then rename, so readers never observe a partial file.
fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".part");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, content).map_err(|e| {
        error!(event = "store_write_failure", path = %tmp.display(), error = %e);
        e
    })?;
    std::fs::rename(&tmp, path).map_err(|e| {
        error!(event = "store_rename_failure", from = %tmp.display(), to = %path.display(), error = %e);
        let _ = std::fs::remove_file(&tmp);
        e
    })
}

impl FileStore for DirectoryStore {
    fn save(&self, name: &str, data: Vec<u8>, meta: &FileMetadata) -> Result<String, StoreError> {
        let _guard = self.lock.lock();
        let name = resolve_name(&sanitize_name(name), self.policy, |n| self.exists(n))?;
        let path = self.root.join(&name);
        atomic_write(&path, &data)?;

        let sidecar = serde_json::to_vec_pretty(meta).map_err(std::io::Error::other)?;
        atomic_write(&self.root.join(format!("{name}.meta.json")), &sidecar)?;
        debug!(event = "stored", path = %path.display(), bytes = data.len());
        Ok(name)
    }

    fn exists(&self, name: &str) -> bool {
        self.root.join(sanitize_name(name)).exists()
    }
}

/// Keeps files in memory; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    policy: ConflictPolicy,
    files: Mutex<HashMap<String, (Vec<u8>, FileMetadata)>>,
}

impl MemoryStore {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy, files: Mutex::new(HashMap::new()) }
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().get(name).map(|(data, _)| data.clone())
    }

    pub fn metadata(&self, name: &str) -> Option<FileMetadata> {
        self.files.lock().get(name).map(|(_, meta)| meta.clone())
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }
}

impl FileStore for MemoryStore {
    fn save(&self, name: &str, data: Vec<u8>, meta: &FileMetadata) -> Result<String, StoreError> {
        let mut files = self.files.lock();
        let name = resolve_name(&sanitize_name(name), self.policy, |n| files.contains_key(n))?;
        files.insert(name.clone(), (data, meta.clone()));
        Ok(name)
    }

    fn exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(&sanitize_name(name))
    }
}
