//! Blob storage for per-symbol intermediates and final results.
//!
//! Key layout (all run-scoped):
//! - `symbol_results/{run_id}/{symbol}.json`
//! - `symbol_discovery_stats/{run_id}.json`
//! - `results/{run_id}.json`

pub mod fs;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use std::fmt::{self, Write as _};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::{BlobBackend, StorageConfig};

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;
pub use sqlite::SqliteBlobStore;

#[derive(Debug)]
pub enum BlobStoreError {
    Io(std::io::Error),
    Sqlite(rusqlite::Error),
    InvalidKey(String),
    Task(String),
}

impl fmt::Display for BlobStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
            Self::InvalidKey(key) => write!(f, "Invalid blob key: {}", key),
            Self::Task(e) => write!(f, "Storage task failed: {}", e),
        }
    }
}

impl std::error::Error for BlobStoreError {}

impl From<std::io::Error> for BlobStoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<rusqlite::Error> for BlobStoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<tokio::task::JoinError> for BlobStoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}

/// Durable key/value blob store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobStoreError>;

    /// `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobStoreError>;

    /// Keys starting with `prefix`, sorted ascending.
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), BlobStoreError>;
}

/// Open the configured backend.
pub fn open_blob_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn BlobStore>> {
    let store: Arc<dyn BlobStore> = match config.backend {
        BlobBackend::Filesystem => Arc::new(FsBlobStore::new(&config.root)),
        BlobBackend::Sqlite => {
            if let Some(parent) = config.sqlite_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Arc::new(SqliteBlobStore::new(&config.sqlite_path)?)
        }
        BlobBackend::Memory => Arc::new(MemoryBlobStore::new()),
    };
    Ok(store)
}

const PUT_ATTEMPTS: u32 = 3;
const PUT_BACKOFF_MS: u64 = 50;

/// `put` with a short retry for transient store failures.
pub async fn put_with_retry(
    store: &dyn BlobStore,
    key: &str,
    bytes: Vec<u8>,
) -> Result<(), BlobStoreError> {
    let mut backoff = PUT_BACKOFF_MS;
    let mut attempt = 1;
    loop {
        match store.put(key, bytes.clone()).await {
            Ok(()) => return Ok(()),
            Err(BlobStoreError::InvalidKey(k)) => return Err(BlobStoreError::InvalidKey(k)),
            Err(e) if attempt < PUT_ATTEMPTS => {
                warn!(key = %key, attempt, "Blob write failed, retrying: {}", e);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                backoff *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ===== Key layout =====

pub const SYMBOL_RESULTS_ROOT: &str = "symbol_results";
pub const DISCOVERY_STATS_ROOT: &str = "symbol_discovery_stats";
pub const RESULTS_ROOT: &str = "results";

/// Encode a key segment: `[A-Za-z0-9_-]` passes through, every other byte
/// becomes `~XX` (upper-case hex). Distinct inputs always yield distinct
/// segments; the empty string encodes as a lone `~`.
pub fn encode_segment(raw: &str) -> String {
    if raw.is_empty() {
        return "~".to_string();
    }
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            encoded.push(byte as char);
        } else {
            let _ = write!(encoded, "~{:02X}", byte);
        }
    }
    encoded
}

pub fn symbol_results_prefix(run_id: &str) -> String {
    format!("{}/{}/", SYMBOL_RESULTS_ROOT, encode_segment(run_id))
}

pub fn symbol_result_key(run_id: &str, symbol: &str) -> String {
    format!("{}{}.json", symbol_results_prefix(run_id), encode_segment(symbol))
}

pub fn discovery_stats_key(run_id: &str) -> String {
    format!("{}/{}.json", DISCOVERY_STATS_ROOT, encode_segment(run_id))
}

pub fn final_result_key(run_id: &str) -> String {
    format!("{}/{}.json", RESULTS_ROOT, encode_segment(run_id))
}

/// Reject keys that could escape the store root.
pub(crate) fn validate_key(key: &str) -> Result<(), BlobStoreError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        Err(BlobStoreError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}
