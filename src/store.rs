//! Durable storage surface for the offline queue.
//!
//! The queue persists through a [`QueueStore`], a minimal key-value
//! abstraction over serialized records. Two implementations ship with the
//! crate: [`MemoryQueueStore`] for tests and ephemeral sessions, and
//! [`FileQueueStore`] which keeps one JSON file per record under a
//! directory.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

/// Failures from a [`QueueStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Backend-specific failure.
    #[error("store error: {0}")]
    Other(String),
}

/// Durable key-value storage for serialized queue records.
///
/// Keys are queue-entry ids. Implementations must make each mutation durable
/// before returning: the queue relies on that to survive process restarts
/// without losing or reordering entries.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Stores `record` under `key`, replacing any existing record.
    async fn put(&self, key: &str, record: &str) -> Result<(), StoreError>;

    /// Returns the record stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Removes the record stored under `key`. Removing a missing key is not
    /// an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Returns all stored records, in no particular order.
    async fn list_all(&self) -> Result<Vec<String>, StoreError>;
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    records: Mutex<HashMap<String, String>>,
}

impl MemoryQueueStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.records.lock().expect("memory store lock poisoned")
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn put(&self, key: &str, record: &str) -> Result<(), StoreError> {
        self.lock().insert(key.to_owned(), record.to_owned());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock().remove(key);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock().values().cloned().collect())
    }
}

/// One JSON file per record under a directory.
#[derive(Debug, Clone)]
pub struct FileQueueStore {
    dir: PathBuf,
}

impl FileQueueStore {
    /// Opens the store, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn put(&self, key: &str, record: &str) -> Result<(), StoreError> {
        tokio::fs::write(self.path_for(key), record).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(record) => Ok(Some(record)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_all(&self) -> Result<Vec<String>, StoreError> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                records.push(tokio::fs::read_to_string(&path).await?);
            }
        }
        Ok(records)
    }
}
