//! Storage backend contracts
//!
//! The engine talks to five kinds of store, each behind an async trait:
//!
//! - [`KeyValueStore`]: the cache tier holding individually addressed cuboids
//! - [`IndexStore`]: scored sorted sets used for existence and LRU indexes
//! - [`CoordinationStore`]: named locks, counters and notifications
//! - [`ObjectStore`]: the durable tier holding super-cuboids
//! - [`RowStore`]: transactional rows for the spatial index and exceptions
//!
//! Concrete backends for tests and single-process use live in
//! [`crate::backend`]. Production deployments implement these traits over
//! their own key-value, object and relational services.

use crate::backend::{FileSystemObjectStore, MemoryObjectStore};
use crate::error::{Result, SpatialDbError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Resident memory of the cache tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStats {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl MemoryStats {
    /// Used memory as a percentage of the total
    pub fn ratio_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}

/// Cache tier: opaque string keys to blobs
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch many keys; the result is aligned with `keys`
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>>;

    /// Unconditionally set every entry
    async fn set_many(&self, entries: Vec<(String, Bytes)>) -> Result<()>;

    /// Set entries whose key is absent; returns which ones were written
    async fn set_if_absent_many(&self, entries: Vec<(String, Bytes)>) -> Result<Vec<bool>>;

    async fn delete_many(&self, keys: &[String]) -> Result<()>;

    async fn memory_stats(&self) -> Result<MemoryStats>;
}

/// Scored sorted sets
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Add members or update their scores
    async fn add(&self, set: &str, members: &[(String, f64)]) -> Result<()>;

    /// Scores of `members`, `None` where absent
    async fn scores(&self, set: &str, members: &[String]) -> Result<Vec<Option<f64>>>;

    /// Members with `min <= score <= max`, ascending by score
    async fn range_by_score(
        &self,
        set: &str,
        min: f64,
        max: f64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(String, f64)>>;

    async fn remove(&self, set: &str, members: &[String]) -> Result<()>;

    async fn cardinality(&self, set: &str) -> Result<usize>;

    /// Members of `members` that are not in `set`
    async fn difference(&self, set: &str, members: &[String]) -> Result<Vec<String>> {
        let scores = self.scores(set, members).await?;
        Ok(members
            .iter()
            .zip(scores)
            .filter(|(_, s)| s.is_none())
            .map(|(m, _)| m.clone())
            .collect())
    }
}

/// Primitives for cross-process coordination
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Try to take the named mutex for `token`; false if someone holds it
    async fn try_lock(&self, name: &str, token: &str) -> Result<bool>;

    /// Release the named mutex if `token` holds it
    async fn unlock(&self, name: &str, token: &str) -> Result<bool>;

    /// Current value of a counter, zero when unset
    async fn counter(&self, name: &str) -> Result<i64>;

    /// Add `delta` and return the new value
    async fn add_to_counter(&self, name: &str, delta: i64) -> Result<i64>;

    async fn set_counter(&self, name: &str, value: i64) -> Result<()>;

    /// Broadcast `message`; returns the number of receivers
    async fn publish(&self, channel: &str, message: &str) -> Result<usize>;

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>>;
}

/// Storage backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// In-process memory
    Memory,
    /// Local file system
    FileSystem,
    /// AWS S3
    S3,
    /// Azure Blob Storage
    Azure,
    /// Google Cloud Storage
    GCS,
}

impl StorageBackend {
    /// Parse storage backend from URL scheme
    pub fn from_url(url: &str) -> Result<Self> {
        if let Some(scheme_end) = url.find("://") {
            let scheme = &url[..scheme_end];
            match scheme {
                "memory" => Ok(StorageBackend::Memory),
                "file" => Ok(StorageBackend::FileSystem),
                "s3" => Ok(StorageBackend::S3),
                "azure" => Ok(StorageBackend::Azure),
                "gs" => Ok(StorageBackend::GCS),
                _ => Err(SpatialDbError::Configuration(format!(
                    "Unknown scheme: {}",
                    scheme
                ))),
            }
        } else {
            // Assume file system if no scheme
            Ok(StorageBackend::FileSystem)
        }
    }
}

/// Durable tier: blobs addressed by path
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read an object; `None` when it does not exist
    async fn get(&self, path: &str) -> Result<Option<Bytes>>;

    async fn put(&self, path: &str, data: Bytes) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Delete an object; deleting a missing object is not an error
    async fn delete(&self, path: &str) -> Result<()>;

    /// Paths under `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn backend(&self) -> StorageBackend;
}

/// Parse URL and create the matching object store
///
/// Only in-process and filesystem URLs are handled here. Cloud object stores
/// are supplied by implementing [`ObjectStore`] in the embedding application.
pub fn create_object_store(url: &str) -> Result<Arc<dyn ObjectStore>> {
    let backend = StorageBackend::from_url(url)?;

    match backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryObjectStore::new())),
        StorageBackend::FileSystem => {
            let path = url.strip_prefix("file://").unwrap_or(url);
            Ok(Arc::new(FileSystemObjectStore::new(path)))
        }
        StorageBackend::S3 | StorageBackend::Azure | StorageBackend::GCS => {
            Err(SpatialDbError::Configuration(format!(
                "Cloud backend {:?} is not built in; implement the ObjectStore trait for it",
                backend
            )))
        }
    }
}

/// Transactional row storage
#[async_trait]
pub trait RowStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>>;
}

/// One open transaction.
///
/// Row locks taken by [`Transaction::select_for_update`] and
/// [`Transaction::lock_row`] are held until commit or rollback. Writes become
/// visible to other transactions only on commit.
#[async_trait]
pub trait Transaction: Send {
    async fn select(&mut self, table: &str, key: &str) -> Result<Option<Bytes>>;

    /// Lock the row, then read it
    async fn select_for_update(&mut self, table: &str, key: &str) -> Result<Option<Bytes>>;

    /// Lock a row without reading it; the row need not exist
    async fn lock_row(&mut self, table: &str, key: &str) -> Result<()>;

    /// Insert a new row; `AlreadyExists` if present
    async fn insert(&mut self, table: &str, key: &str, value: Bytes) -> Result<()>;

    /// Replace an existing row; `NotFound` if absent
    async fn update(&mut self, table: &str, key: &str, value: Bytes) -> Result<()>;

    async fn delete(&mut self, table: &str, key: &str) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;

    /// Insert or update depending on whether the row was seen
    async fn upsert(&mut self, table: &str, key: &str, value: Bytes, exists: bool) -> Result<()> {
        if exists {
            self.update(table, key, value).await
        } else {
            self.insert(table, key, value).await
        }
    }
}
