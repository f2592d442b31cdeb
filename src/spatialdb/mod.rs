//! SpatialDb - the facade applications talk to
//!
//! Cuboids are read and written through the [`CacheCoordinator`]; the spatial
//! index and exception lists live in the row store and every mutating
//! operation runs inside one row-store transaction. Writers of the same
//! cuboid are serialized by a row lock in the channel's cuboid table.

mod annotate;
mod query;

pub use query::CutoutOptions;

use crate::backend::{MemoryCacheStore, MemoryObjectStore, MemoryRowStore};
use crate::cache_index::CacheIndex;
use crate::config::EngineConfig;
use crate::coordinator::CacheCoordinator;
use crate::cuboid::{Cuboid, CuboidData};
use crate::durable::DurableStore;
use crate::error::{Result, SpatialDbError};
use crate::eviction::EvictionManager;
use crate::exceptions::{ExceptionKey, ExceptionTracker};
use crate::io::{CoordinationStore, IndexStore, KeyValueStore, ObjectStore, RowStore, Transaction};
use crate::keys::{cuboid_table, CuboidKey};
use crate::layout::DatasetLayout;
use crate::lock::ReaderWriterLock;
use crate::morton;
use crate::spatial_index::SpatialIndex;
use crate::types::Channel;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Handles to every store the engine talks to
#[derive(Clone)]
pub struct StorageBackends {
    pub cache: Arc<dyn KeyValueStore>,
    pub index: Arc<dyn IndexStore>,
    pub coordination: Arc<dyn CoordinationStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub rows: Arc<dyn RowStore>,
}

impl StorageBackends {
    /// Single-process backends; one [`MemoryCacheStore`] serves the cache,
    /// index and coordination roles
    pub fn in_memory(total_memory_bytes: u64) -> Self {
        let cache = Arc::new(MemoryCacheStore::new(total_memory_bytes));
        Self {
            cache: cache.clone(),
            index: cache.clone(),
            coordination: cache,
            objects: Arc::new(MemoryObjectStore::new()),
            rows: Arc::new(MemoryRowStore::new()),
        }
    }
}

/// Cuboid writes of one transaction, held back until its row work succeeds
#[derive(Default)]
struct StagedCubes {
    /// Blob of each locked cuboid before the write, `None` when no tier held it
    prior: Vec<(CuboidKey, Option<Bytes>)>,
    writes: Vec<(CuboidKey, Bytes)>,
}

/// Main interface for reading and annotating a multi-resolution dataset
pub struct SpatialDb {
    config: EngineConfig,
    layout: Arc<DatasetLayout>,
    cache: Arc<dyn KeyValueStore>,
    rows: Arc<dyn RowStore>,
    coordinator: Arc<CacheCoordinator>,
    index: SpatialIndex,
    exceptions: ExceptionTracker,
}

impl SpatialDb {
    pub fn new(config: &EngineConfig, layout: DatasetLayout, backends: StorageBackends) -> Result<Self> {
        config.validate()?;
        layout.validate()?;
        let layout = Arc::new(layout);

        let durable = Arc::new(DurableStore::new(
            backends.objects.clone(),
            backends.index.clone(),
            config.durable_index_key.clone(),
            layout.clone(),
            config.compression,
        ));
        let cache_index = Arc::new(CacheIndex::new(
            backends.index.clone(),
            config.cache_index_key.clone(),
            config.dirty_index_key.clone(),
        ));
        let lock = ReaderWriterLock::new(backends.coordination.clone(), config.lock_name.clone());
        let coordinator = Arc::new(CacheCoordinator::new(
            backends.cache.clone(),
            cache_index,
            durable,
            lock,
            config.compression,
        ));

        info!(project = %config.project, layout = %layout.summary(), "opened spatial database");
        Ok(Self {
            config: config.clone(),
            layout,
            cache: backends.cache,
            rows: backends.rows,
            coordinator,
            index: SpatialIndex::new(config.compression),
            exceptions: ExceptionTracker::new(config.compression),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn layout(&self) -> &DatasetLayout {
        &self.layout
    }

    pub fn coordinator(&self) -> &Arc<CacheCoordinator> {
        &self.coordinator
    }

    /// Eviction manager over this instance's cache; call
    /// [`EvictionManager::start`] to run it in the background
    pub fn eviction_manager(&self) -> Arc<EvictionManager> {
        Arc::new(EvictionManager::new(
            self.cache.clone(),
            self.coordinator.clone(),
            self.config.eviction.clone(),
        ))
    }

    /// Write every dirty cached cuboid to the durable tier
    pub async fn flush(&self) -> Result<usize> {
        let written = self
            .coordinator
            .flush_all(self.config.eviction.batch_size)
            .await?;
        info!(cuboids = written, "flushed cache");
        Ok(written)
    }

    /// Load one cuboid; a cuboid no tier holds comes back zero-filled and synthetic
    pub async fn get_cube(
        &self,
        channel: &Channel,
        resolution: u32,
        address: u64,
        timestamp: u64,
    ) -> Result<Cuboid> {
        let key = self.cuboid_key(channel, resolution, address, timestamp);
        let blob = self.coordinator.get_cube(&key).await?;
        self.load_cube(channel, resolution, timestamp, blob.as_deref())
    }

    /// Store one cuboid through the cache
    pub async fn put_cube(
        &self,
        channel: &Channel,
        resolution: u32,
        address: u64,
        timestamp: u64,
        cube: &Cuboid,
    ) -> Result<()> {
        let key = self.cuboid_key(channel, resolution, address, timestamp);
        let blob = Bytes::from(cube.to_compressed(&self.config.compression)?);
        debug!(key = %key, insert = cube.is_synthetic(), "put cuboid");
        self.coordinator.put_cube(&key, blob, false).await
    }

    pub async fn get_exceptions(
        &self,
        channel: &Channel,
        resolution: u32,
        address: u64,
        timestamp: u64,
        entity: u64,
    ) -> Result<Vec<[u32; 3]>> {
        let key = exception_key(channel, resolution, address, timestamp, entity);
        let mut txn = self.rows.begin().await?;
        let result = self.exceptions.get(txn.as_mut(), &key).await;
        finish(txn, result).await
    }

    /// Union `offsets` into an entity's exception list
    pub async fn update_exceptions(
        &self,
        channel: &Channel,
        resolution: u32,
        address: u64,
        timestamp: u64,
        entity: u64,
        offsets: &[[u32; 3]],
    ) -> Result<()> {
        let key = exception_key(channel, resolution, address, timestamp, entity);
        let mut txn = self.rows.begin().await?;
        let result = self.exceptions.update(txn.as_mut(), &key, offsets).await;
        finish(txn, result).await
    }

    pub async fn remove_exceptions(
        &self,
        channel: &Channel,
        resolution: u32,
        address: u64,
        timestamp: u64,
        entity: u64,
        offsets: &[[u32; 3]],
    ) -> Result<()> {
        let key = exception_key(channel, resolution, address, timestamp, entity);
        let mut txn = self.rows.begin().await?;
        let result = self.exceptions.remove(txn.as_mut(), &key, offsets).await;
        finish(txn, result).await
    }

    fn cuboid_key(&self, channel: &Channel, resolution: u32, address: u64, timestamp: u64) -> CuboidKey {
        CuboidKey::new(
            self.config.project.clone(),
            channel.name.clone(),
            resolution,
            address,
            timestamp,
        )
    }

    fn blank_cube(&self, channel: &Channel, resolution: u32, timestamp: u64) -> Result<Cuboid> {
        Cuboid::new(
            channel.kind,
            channel.data_type,
            self.layout.cube_dims(resolution)?,
            [timestamp, timestamp + 1],
        )
    }

    fn load_cube(
        &self,
        channel: &Channel,
        resolution: u32,
        timestamp: u64,
        blob: Option<&[u8]>,
    ) -> Result<Cuboid> {
        let mut cube = self.blank_cube(channel, resolution, timestamp)?;
        match blob {
            Some(blob) => cube.set_data(self.decode(channel, blob)?)?,
            None => cube.zeros(),
        }
        Ok(cube)
    }

    /// Lock the cuboid's row for the rest of `txn`, then load it.
    ///
    /// The blob it held is remembered in `staged` so a failed commit can put it back.
    async fn get_cube_for_update(
        &self,
        txn: &mut dyn Transaction,
        staged: &mut StagedCubes,
        channel: &Channel,
        resolution: u32,
        address: u64,
        timestamp: u64,
    ) -> Result<Cuboid> {
        txn.lock_row(
            &cuboid_table(&channel.name, resolution),
            &format!("{}&{}", address, timestamp),
        )
        .await?;
        let key = self.cuboid_key(channel, resolution, address, timestamp);
        let blob = self.coordinator.get_cube(&key).await?;
        let cube = self.load_cube(channel, resolution, timestamp, blob.as_deref())?;
        staged.prior.push((key, blob));
        Ok(cube)
    }

    /// Queue a modified cuboid; nothing reaches the cache before [`Self::finish_staged`]
    fn stage(
        &self,
        staged: &mut StagedCubes,
        channel: &Channel,
        resolution: u32,
        address: u64,
        timestamp: u64,
        cube: &Cuboid,
    ) -> Result<()> {
        let key = self.cuboid_key(channel, resolution, address, timestamp);
        let blob = Bytes::from(cube.to_compressed(&self.config.compression)?);
        staged.writes.push((key, blob));
        Ok(())
    }

    /// Write the staged cuboids, then commit `txn`.
    ///
    /// Cuboid row locks are still held while the cache is written. On any
    /// failure the transaction is rolled back and cuboids already written are
    /// restored to their prior contents.
    async fn finish_staged<T>(
        &self,
        txn: Box<dyn Transaction>,
        staged: StagedCubes,
        result: Result<T>,
    ) -> Result<T> {
        let value = match result {
            Ok(value) => value,
            Err(e) => return finish(txn, Err(e)).await,
        };
        let written = staged.writes.len();
        if let Err(e) = self.coordinator.put_cubes(staged.writes, false).await {
            self.restore(staged.prior).await;
            return finish(txn, Err(e)).await;
        }
        if let Err(e) = txn.commit().await {
            warn!(error = %e, cuboids = written, "commit failed, restoring cuboids");
            self.restore(staged.prior).await;
            return Err(e);
        }
        debug!(cuboids = written, "committed cuboid writes");
        Ok(value)
    }

    async fn restore(&self, prior: Vec<(CuboidKey, Option<Bytes>)>) {
        let mut present = Vec::new();
        let mut absent = Vec::new();
        for (key, blob) in prior {
            match blob {
                Some(blob) => present.push((key, blob)),
                None => absent.push(key),
            }
        }
        if let Err(e) = self.coordinator.put_cubes(present, false).await {
            warn!(error = %e, "failed to restore cuboids");
        }
        if let Err(e) = self.coordinator.invalidate(&absent).await {
            warn!(error = %e, "failed to drop unwritten cuboids");
        }
    }

    fn decode(&self, channel: &Channel, blob: &[u8]) -> Result<CuboidData> {
        let data = CuboidData::from_compressed(blob)?;
        if data.data_type() != channel.data_type {
            return Err(SpatialDbError::TypeMismatch {
                expected: channel.data_type.to_string(),
                found: data.data_type().to_string(),
            });
        }
        Ok(data)
    }

    /// Global voxel position of a cuboid's corner
    fn cube_origin(&self, address: u64, resolution: u32) -> Result<[u64; 3]> {
        let grid = morton::morton_to_xyz(address)?;
        let d = self.layout.cube_dims(resolution)?;
        Ok([grid[0] * d[0], grid[1] * d[1], grid[2] * d[2]])
    }
}

fn exception_key(
    channel: &Channel,
    resolution: u32,
    address: u64,
    timestamp: u64,
    entity: u64,
) -> ExceptionKey<'_> {
    ExceptionKey {
        channel: &channel.name,
        resolution,
        address,
        timestamp,
        entity,
    }
}

fn require_annotation(channel: &Channel) -> Result<()> {
    if !channel.kind.is_annotation() {
        return Err(SpatialDbError::Unsupported(format!(
            "channel {} is not an annotation channel",
            channel.name
        )));
    }
    Ok(())
}

/// Commit on success, roll back on failure
async fn finish<T>(txn: Box<dyn Transaction>, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            txn.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = txn.rollback().await {
                warn!(error = %rollback, "rollback failed");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::DataType;
    use ndarray::Array4;

    pub(crate) fn create_test_db() -> SpatialDb {
        let layout = DatasetLayout::new([64, 64, 16], [8, 8, 4], 3)
            .unwrap()
            .with_super_cuboid([2, 2, 2]);
        SpatialDb::new(
            &EngineConfig::new("test"),
            layout,
            StorageBackends::in_memory(u64::MAX),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_absent_cube_is_synthetic() {
        let db = create_test_db();
        let chan = Channel::annotation("anno").unwrap();
        let cube = db.get_cube(&chan, 0, 5, 0).await.unwrap();
        assert!(cube.is_synthetic());
        assert!(!cube.is_not_zeros());
        assert_eq!(cube.dims(), [8, 8, 4]);
    }

    #[tokio::test]
    async fn test_put_then_get_cube() {
        let db = create_test_db();
        let chan = Channel::image("em", DataType::U8).unwrap();
        let data = CuboidData::U8(Array4::from_elem((1, 4, 8, 8), 7));
        let cube = Cuboid::from_data(chan.kind, data.clone(), 0).unwrap();
        db.put_cube(&chan, 1, 3, 0, &cube).await.unwrap();

        let back = db.get_cube(&chan, 1, 3, 0).await.unwrap();
        assert!(!back.is_synthetic());
        assert_eq!(back.data(), &data);

        // The same address at another resolution is a different cuboid
        assert!(db.get_cube(&chan, 0, 3, 0).await.unwrap().is_synthetic());
    }

    #[tokio::test]
    async fn test_stored_type_must_match_channel() {
        let db = create_test_db();
        let em = Channel::image("chan", DataType::U8).unwrap();
        let cube = Cuboid::from_data(em.kind, CuboidData::U8(Array4::zeros((1, 4, 8, 8))), 0).unwrap();
        db.put_cube(&em, 0, 0, 0, &cube).await.unwrap();

        let wide = Channel::image("chan", DataType::U16).unwrap();
        assert!(matches!(
            db.get_cube(&wide, 0, 0, 0).await,
            Err(SpatialDbError::TypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_exception_accessors() {
        let db = create_test_db();
        let chan = Channel::annotation("anno").unwrap();
        db.update_exceptions(&chan, 0, 9, 0, 4, &[[1, 2, 3], [0, 0, 1]])
            .await
            .unwrap();
        db.remove_exceptions(&chan, 0, 9, 0, 4, &[[1, 2, 3]])
            .await
            .unwrap();
        assert_eq!(
            db.get_exceptions(&chan, 0, 9, 0, 4).await.unwrap(),
            vec![[0, 0, 1]]
        );
    }

    #[tokio::test]
    async fn test_flush_persists_cache() {
        let db = create_test_db();
        let chan = Channel::image("em", DataType::U8).unwrap();
        let cube = Cuboid::from_data(chan.kind, CuboidData::U8(Array4::from_elem((1, 4, 8, 8), 1)), 0)
            .unwrap();
        db.put_cube(&chan, 0, 0, 0, &cube).await.unwrap();
        db.put_cube(&chan, 0, 1, 0, &cube).await.unwrap();

        assert_eq!(db.flush().await.unwrap(), 2);
        assert_eq!(db.flush().await.unwrap(), 0);
        assert_eq!(db.coordinator().cache_index().dirty_len().await.unwrap(), 0);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let layout = DatasetLayout::new([64, 64, 16], [8, 8, 4], 1).unwrap();
        let config = EngineConfig::new("a&b");
        assert!(SpatialDb::new(&config, layout, StorageBackends::in_memory(1024)).is_err());
    }
}
