//! Read-through, write-back coordination of the cache and durable tiers
//!
//! A get walks a small state machine per key:
//!
//! 1. look the key up in the [`CacheIndex`]; present keys go straight to 5
//! 2. fetch the super-cuboid holding the key from the [`DurableStore`]; when
//!    it does not exist the key is absent everywhere and the caller
//!    synthesizes zeros
//! 3. split the super-cuboid into its constituent cuboids
//! 4. write constituents the index does not know into the cache with
//!    set-if-absent and register them
//! 5. read the blob from the cache tier
//!
//! The index only learns about a key once its blob is in the cache, so a
//! hit whose blob is missing is reported as [`SpatialDbError::CacheIndexInconsistency`].

use crate::cache_index::CacheIndex;
use crate::compression::CompressionSettings;
use crate::cuboid::CuboidData;
use crate::durable::DurableStore;
use crate::error::{Result, SpatialDbError};
use crate::io::KeyValueStore;
use crate::keys::{CuboidKey, SuperCuboidKey};
use crate::lock::ReaderWriterLock;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Blobs returned by [`CacheCoordinator::get_cubes`].
///
/// Ordered by address, then timestamp, following the order of the request.
/// `None` marks a cuboid absent from every tier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CuboidBatch {
    entries: Vec<(u64, u64, Option<Bytes>)>,
}

impl CuboidBatch {
    /// Iterate `(address, timestamp, blob)`; can be called any number of times
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64, Option<&Bytes>)> + '_ {
        self.entries.iter().map(|(a, t, b)| (*a, *t, b.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IntoIterator for CuboidBatch {
    type Item = (u64, u64, Option<Bytes>);
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

pub struct CacheCoordinator {
    store: Arc<dyn KeyValueStore>,
    index: Arc<CacheIndex>,
    durable: Arc<DurableStore>,
    lock: ReaderWriterLock,
    compression: CompressionSettings,
}

impl CacheCoordinator {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        index: Arc<CacheIndex>,
        durable: Arc<DurableStore>,
        lock: ReaderWriterLock,
        compression: CompressionSettings,
    ) -> Self {
        Self {
            store,
            index,
            durable,
            lock,
            compression,
        }
    }

    pub fn cache_index(&self) -> &CacheIndex {
        &self.index
    }

    pub fn durable(&self) -> &DurableStore {
        &self.durable
    }

    pub fn lock(&self) -> &ReaderWriterLock {
        &self.lock
    }

    /// Blob of one cuboid, `None` when no tier has it
    pub async fn get_cube(&self, key: &CuboidKey) -> Result<Option<Bytes>> {
        let mut blobs = self.get_many(std::slice::from_ref(key)).await?;
        Ok(blobs.pop().flatten())
    }

    /// Blobs for every `(address, timestamp)` pair, addresses outermost
    pub async fn get_cubes(
        &self,
        template: &CuboidKey,
        addresses: &[u64],
        timestamps: &[u64],
    ) -> Result<CuboidBatch> {
        let keys: Vec<CuboidKey> = addresses
            .iter()
            .flat_map(|&a| {
                timestamps.iter().map(move |&t| CuboidKey {
                    address: a,
                    timestamp: t,
                    ..template.clone()
                })
            })
            .collect();
        let blobs = self.get_many(&keys).await?;
        Ok(CuboidBatch {
            entries: keys
                .into_iter()
                .zip(blobs)
                .map(|(k, b)| (k.address, k.timestamp, b))
                .collect(),
        })
    }

    /// Blobs aligned with `keys`
    pub async fn get_many(&self, keys: &[CuboidKey]) -> Result<Vec<Option<Bytes>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let guard = self.lock.acquire_read().await?;
        let result = self.read_through(keys).await;
        guard.release().await?;
        result
    }

    async fn read_through(&self, keys: &[CuboidKey]) -> Result<Vec<Option<Bytes>>> {
        let missing: BTreeSet<CuboidKey> = self.index.missing(keys).await?.into_iter().collect();
        let hits: Vec<CuboidKey> = keys
            .iter()
            .filter(|k| !missing.contains(*k))
            .cloned()
            .collect();

        let found = if missing.is_empty() {
            BTreeSet::new()
        } else {
            self.populate(&missing).await?
        };

        // Only keys that are cached now are read back
        let readable: Vec<CuboidKey> = keys
            .iter()
            .filter(|k| !missing.contains(*k) || found.contains(*k))
            .cloned()
            .collect();
        let names: Vec<String> = readable.iter().map(|k| k.to_string()).collect();
        let blobs = self.store.get_many(&names).await?;

        let mut by_key: HashMap<&CuboidKey, Bytes> = HashMap::with_capacity(readable.len());
        for (key, blob) in readable.iter().zip(blobs) {
            match blob {
                Some(b) => {
                    by_key.insert(key, b);
                }
                None => {
                    return Err(SpatialDbError::CacheIndexInconsistency(format!(
                        "{} is indexed but not cached",
                        key
                    )))
                }
            }
        }

        self.index.touch(&hits).await?;
        Ok(keys.iter().map(|k| by_key.get(k).cloned()).collect())
    }

    /// Miss path for `missing`; returns the keys that are now cached
    async fn populate(&self, missing: &BTreeSet<CuboidKey>) -> Result<BTreeSet<CuboidKey>> {
        let super_keys: Vec<SuperCuboidKey> = missing
            .iter()
            .map(|k| self.durable.super_key(k))
            .collect::<Result<BTreeSet<_>>>()?
            .into_iter()
            .collect();
        debug!(
            misses = missing.len(),
            super_cuboids = super_keys.len(),
            "cache miss"
        );

        let fetched = self.durable.get_super_cuboids(&super_keys).await?;

        let mut constituents: Vec<(CuboidKey, CuboidData)> = Vec::new();
        for (super_key, data) in super_keys.iter().zip(fetched) {
            match data {
                Some(data) => constituents.extend(self.durable.decompose(super_key, &data)?),
                None => debug!(path = %super_key.object_path(), "absent from durable tier"),
            }
        }
        if constituents.is_empty() {
            return Ok(BTreeSet::new());
        }

        let keys: Vec<CuboidKey> = constituents.iter().map(|(k, _)| k.clone()).collect();
        let absent: BTreeSet<CuboidKey> = self.index.missing(&keys).await?.into_iter().collect();

        let mut entries = Vec::with_capacity(absent.len());
        for (key, data) in &constituents {
            if absent.contains(key) {
                let blob = data.to_compressed(&self.compression)?;
                entries.push((key.to_string(), Bytes::from(blob)));
            }
        }
        let written = self.store.set_if_absent_many(entries).await?;
        let newly: Vec<CuboidKey> = absent.iter().cloned().collect();
        self.index.register(&newly).await?;
        debug!(
            decomposed = constituents.len(),
            populated = written.iter().filter(|w| **w).count(),
            "populated cache"
        );

        Ok(keys.into_iter().filter(|k| missing.contains(k)).collect())
    }

    /// Write one blob through the cache, or straight to the durable tier
    pub async fn put_cube(&self, key: &CuboidKey, blob: Bytes, direct: bool) -> Result<()> {
        self.put_cubes(vec![(key.clone(), blob)], direct).await
    }

    pub async fn put_cubes(&self, entries: Vec<(CuboidKey, Bytes)>, direct: bool) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        if direct {
            return self.put_direct(entries).await;
        }

        let keys: Vec<CuboidKey> = entries.iter().map(|(k, _)| k.clone()).collect();
        let guard = self.lock.acquire_read().await?;
        let result = async {
            self.index.register(&keys).await?;
            self.store
                .set_many(
                    entries
                        .into_iter()
                        .map(|(k, b)| (k.to_string(), b))
                        .collect(),
                )
                .await?;
            self.index.mark_dirty(&keys).await
        }
        .await;
        guard.release().await?;
        result
    }

    /// Read-modify-write the durable tier, then drop stale cached copies
    async fn put_direct(&self, entries: Vec<(CuboidKey, Bytes)>) -> Result<()> {
        let mut parts = Vec::with_capacity(entries.len());
        for (key, blob) in &entries {
            parts.push((key.clone(), CuboidData::from_compressed(blob)?));
        }
        let written = self.durable.write_cuboids(parts).await?;
        debug!(cuboids = entries.len(), super_cuboids = written, "direct write");

        let keys: Vec<CuboidKey> = entries.into_iter().map(|(k, _)| k).collect();
        self.invalidate(&keys).await
    }

    /// Remove cached copies of `keys`, dirty or not
    pub async fn invalidate(&self, keys: &[CuboidKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let names: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        self.store.delete_many(&names).await?;
        self.index.remove(keys).await
    }

    /// Persist the dirty members of `keys`; returns how many were written
    pub async fn write_back(&self, keys: &[CuboidKey]) -> Result<usize> {
        let dirty_flags = self.index.dirty_among(keys).await?;
        let dirty: Vec<CuboidKey> = keys
            .iter()
            .zip(dirty_flags)
            .filter(|(_, d)| *d)
            .map(|(k, _)| k.clone())
            .collect();
        if dirty.is_empty() {
            return Ok(0);
        }

        let names: Vec<String> = dirty.iter().map(|k| k.to_string()).collect();
        let blobs = self.store.get_many(&names).await?;
        let mut parts = Vec::with_capacity(dirty.len());
        for (key, blob) in dirty.iter().zip(blobs) {
            let blob = blob.ok_or_else(|| {
                SpatialDbError::CacheIndexInconsistency(format!("dirty {} is not cached", key))
            })?;
            parts.push((key.clone(), CuboidData::from_compressed(&blob)?));
        }

        let written = self.durable.write_cuboids(parts).await?;
        self.index.clear_dirty(&dirty).await?;
        debug!(cuboids = dirty.len(), super_cuboids = written, "wrote back");
        Ok(dirty.len())
    }

    /// Persist every dirty cuboid
    pub async fn flush_all(&self, batch_size: usize) -> Result<usize> {
        let batch_size = batch_size.max(1);
        let mut total = 0;
        loop {
            let batch = self.index.dirty_keys(batch_size).await?;
            if batch.is_empty() {
                return Ok(total);
            }
            total += self.write_back(&batch).await?;
        }
    }
}
