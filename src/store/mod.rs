//! Embedded store
//!
//! One sled database backs the quota ledger, the job store and the progress log. Each concern
//! owns its own named trees; values are serde_json documents.

use crate::error::StorageError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Open (or create) the sled database at `path`.
pub fn open_db(path: &Path) -> Result<sled::Db, StorageError> {
    std::fs::create_dir_all(path)?;
    sled::open(path).map_err(|e| {
        StorageError::Unavailable(format!(
            "Failed to open sled database at {}: {}",
            path.display(),
            e
        ))
    })
}

/// In-memory database, removed on drop.
pub fn open_temporary() -> Result<sled::Db, StorageError> {
    sled::Config::new()
        .temporary(true)
        .open()
        .map_err(to_storage_io)
}

pub(crate) fn to_storage_io(err: sled::Error) -> StorageError {
    StorageError::Unavailable(err.to_string())
}

pub(crate) fn encode<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(value).map_err(|e| StorageError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn decode<T: DeserializeOwned>(key: &str, raw: &[u8]) -> Result<T, StorageError> {
    serde_json::from_slice(raw).map_err(|e| StorageError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })
}
