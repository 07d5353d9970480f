//! Durable operation storage.
//!
//! Every broadcast change is appended to an operation store independently of
//! pub/sub delivery; the store is the trail the reconciler replays when a
//! client comes back from a dropped connection. Entries are immutable once
//! written and versioning is by operation timestamp (milliseconds), matching
//! the reconciliation contract.

use crate::operation::{Operation, OperationLog};
use crate::resource::ResourceRef;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

/// Errors raised by storage backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// A stored entry could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Append-only operation log per resource.
///
/// Methods take `&self`; implementations use internal locking so a store
/// can be shared behind an `Arc` between sessions, the relay and the HTTP
/// service. An unknown resource behaves as an empty log rather than an
/// error; resource existence is owned by the persistence layer, not this
/// crate.
pub trait OperationStore: Send + Sync {
    /// Append one operation. Returns true when newly recorded, false when
    /// the operation (same actor and counter) was already present.
    fn append(&self, resource: &ResourceRef, op: Operation) -> StoreResult<bool>;

    /// Append a batch, skipping duplicates. Returns how many were newly
    /// recorded.
    fn append_all(&self, resource: &ResourceRef, ops: Vec<Operation>) -> StoreResult<usize> {
        let mut added = 0;
        for op in ops {
            if self.append(resource, op)? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// All operations with timestamp strictly greater than `after`, in the
    /// order they were recorded.
    fn operations_since(&self, resource: &ResourceRef, after: i64) -> StoreResult<Vec<Operation>>;

    /// Highest recorded timestamp for the resource, or 0 when empty.
    fn latest_version(&self, resource: &ResourceRef) -> StoreResult<i64>;
}

/// In-memory store, one [`OperationLog`] per resource.
#[derive(Debug, Default)]
pub struct MemoryOperationStore {
    logs: Mutex<HashMap<String, OperationLog>>,
}

impl MemoryOperationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OperationStore for MemoryOperationStore {
    fn append(&self, resource: &ResourceRef, op: Operation) -> StoreResult<bool> {
        let mut logs = self.logs.lock().unwrap();
        Ok(logs.entry(resource.channel_name()).or_default().append(op))
    }

    fn operations_since(&self, resource: &ResourceRef, after: i64) -> StoreResult<Vec<Operation>> {
        let logs = self.logs.lock().unwrap();
        Ok(logs
            .get(&resource.channel_name())
            .map(|log| log.ops_after(after).into_iter().cloned().collect())
            .unwrap_or_default())
    }

    fn latest_version(&self, resource: &ResourceRef) -> StoreResult<i64> {
        let logs = self.logs.lock().unwrap();
        Ok(logs
            .get(&resource.channel_name())
            .and_then(|log| log.latest_timestamp())
            .unwrap_or(0))
    }
}

/// File-backed store: one JSON-lines file per resource under a base
/// directory, fully loaded at open and appended on every write.
///
/// ```text
/// data/
/// ├── workflow:wf-1.jsonl
/// └── session:s-9.jsonl
/// ```
pub struct FileOperationStore {
    base_path: PathBuf,
    cache: Mutex<HashMap<String, OperationLog>>,
}

impl FileOperationStore {
    /// Open (or create) a store rooted at `base_path`, loading any existing
    /// logs into memory.
    pub fn open(base_path: impl Into<PathBuf>) -> StoreResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;

        let mut cache = HashMap::new();
        for entry in fs::read_dir(&base_path)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            cache.insert(key.to_string(), Self::load_log(&path)?);
        }

        Ok(Self {
            base_path,
            cache: Mutex::new(cache),
        })
    }

    fn load_log(path: &std::path::Path) -> StoreResult<OperationLog> {
        let file = fs::File::open(path)?;
        let reader = BufReader::new(file);

        let mut log = OperationLog::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let op: Operation = serde_json::from_str(&line)?;
            log.append(op);
        }
        Ok(log)
    }

    fn log_path(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{key}.jsonl"))
    }
}

impl OperationStore for FileOperationStore {
    fn append(&self, resource: &ResourceRef, op: Operation) -> StoreResult<bool> {
        let key = resource.channel_name();
        let mut cache = self.cache.lock().unwrap();
        let log = cache.entry(key.clone()).or_default();

        if log.contains(&op.op_ref()) {
            return Ok(false);
        }

        // disk first; the cache only ever holds what the file has
        let line = serde_json::to_string(&op)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(&key))?;
        writeln!(file, "{line}")?;

        log.append(op);
        Ok(true)
    }

    fn operations_since(&self, resource: &ResourceRef, after: i64) -> StoreResult<Vec<Operation>> {
        let cache = self.cache.lock().unwrap();
        Ok(cache
            .get(&resource.channel_name())
            .map(|log| log.ops_after(after).into_iter().cloned().collect())
            .unwrap_or_default())
    }

    fn latest_version(&self, resource: &ResourceRef) -> StoreResult<i64> {
        let cache = self.cache.lock().unwrap();
        Ok(cache
            .get(&resource.channel_name())
            .and_then(|log| log.latest_timestamp())
            .unwrap_or(0))
    }
}
