//! Entity to cuboid-address index
//!
//! One row per `(entity, timestamp)` in the table of a channel's resolution,
//! holding the sorted addresses of every cuboid that contains the entity.
//! Updates union into the stored set under a row lock, so concurrent
//! annotators of the same entity never lose each other's addresses.

use crate::compression::{unpack, CompressionSettings};
use crate::error::{Result, SpatialDbError};
use crate::io::Transaction;
use crate::keys::index_table;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};

/// Wrap non-connection failures as index-store errors
fn index_error(err: SpatialDbError) -> SpatialDbError {
    match err {
        e @ SpatialDbError::StorageConnection(_) => e,
        SpatialDbError::IndexStore(msg) => SpatialDbError::IndexStore(msg),
        other => SpatialDbError::IndexStore(other.to_string()),
    }
}

fn index_row(entity: u64, timestamp: u64) -> String {
    format!("{}&{}", entity, timestamp)
}

#[derive(Debug, Clone, Default)]
pub struct SpatialIndex {
    compression: CompressionSettings,
}

impl SpatialIndex {
    pub fn new(compression: CompressionSettings) -> Self {
        Self { compression }
    }

    /// Addresses of cuboids holding `entity`; empty when never indexed
    pub async fn get(
        &self,
        txn: &mut dyn Transaction,
        channel: &str,
        entity: u64,
        resolution: u32,
        timestamp: u64,
    ) -> Result<BTreeSet<u64>> {
        let table = index_table(channel, resolution);
        let row = txn
            .select(&table, &index_row(entity, timestamp))
            .await
            .map_err(index_error)?;
        self.decode(row)
    }

    /// Union `delta` (entity to addresses) into the index.
    ///
    /// Rows are locked in ascending entity order.
    pub async fn update(
        &self,
        txn: &mut dyn Transaction,
        channel: &str,
        delta: &BTreeMap<u64, BTreeSet<u64>>,
        resolution: u32,
        timestamp: u64,
    ) -> Result<()> {
        let table = index_table(channel, resolution);
        for (&entity, addresses) in delta {
            if addresses.is_empty() {
                continue;
            }
            let row = index_row(entity, timestamp);
            let current = txn
                .select_for_update(&table, &row)
                .await
                .map_err(index_error)?;
            let exists = current.is_some();
            let mut merged = self.decode(current)?;
            let before = merged.len();
            merged.extend(addresses.iter().copied());
            if exists && merged.len() == before {
                continue;
            }
            let blob = self.encode(&merged)?;
            txn.upsert(&table, &row, blob, exists)
                .await
                .map_err(index_error)?;
        }
        Ok(())
    }

    /// Remove the entity at every listed resolution and timestamp
    pub async fn delete(
        &self,
        txn: &mut dyn Transaction,
        channel: &str,
        entity: u64,
        resolutions: &[u32],
        timestamps: &[u64],
    ) -> Result<()> {
        for &resolution in resolutions {
            let table = index_table(channel, resolution);
            for &timestamp in timestamps {
                txn.delete(&table, &index_row(entity, timestamp))
                    .await
                    .map_err(index_error)?;
            }
        }
        Ok(())
    }

    fn encode(&self, addresses: &BTreeSet<u64>) -> Result<Bytes> {
        let list: Vec<u64> = addresses.iter().copied().collect();
        self.compression
            .pack(&list)
            .map(Bytes::from)
            .map_err(index_error)
    }

    fn decode(&self, row: Option<Bytes>) -> Result<BTreeSet<u64>> {
        match row {
            Some(blob) => {
                let list: Vec<u64> = unpack(&blob).map_err(index_error)?;
                Ok(list.into_iter().collect())
            }
            None => Ok(BTreeSet::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryRowStore;
    use crate::io::RowStore;

    fn delta(entity: u64, addresses: &[u64]) -> BTreeMap<u64, BTreeSet<u64>> {
        BTreeMap::from([(entity, addresses.iter().copied().collect())])
    }

    #[tokio::test]
    async fn test_absent_is_empty() {
        let store = MemoryRowStore::new();
        let index = SpatialIndex::default();
        let mut txn = store.begin().await.unwrap();
        assert!(index.get(txn.as_mut(), "anno", 42, 0, 0).await.unwrap().is_empty());
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_union_merge() {
        let store = MemoryRowStore::new();
        let index = SpatialIndex::default();

        let mut txn = store.begin().await.unwrap();
        index.update(txn.as_mut(), "anno", &delta(42, &[1, 2]), 0, 0).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = store.begin().await.unwrap();
        index.update(txn.as_mut(), "anno", &delta(42, &[2, 3]), 0, 0).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = store.begin().await.unwrap();
        let got = index.get(txn.as_mut(), "anno", 42, 0, 0).await.unwrap();
        assert_eq!(got, BTreeSet::from([1, 2, 3]));
        // Other timestamps and resolutions are separate rows
        assert!(index.get(txn.as_mut(), "anno", 42, 1, 0).await.unwrap().is_empty());
        assert!(index.get(txn.as_mut(), "anno", 42, 0, 1).await.unwrap().is_empty());
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_discards_update() {
        let store = MemoryRowStore::new();
        let index = SpatialIndex::default();

        let mut txn = store.begin().await.unwrap();
        index.update(txn.as_mut(), "anno", &delta(7, &[5]), 0, 0).await.unwrap();
        txn.rollback().await.unwrap();

        let mut txn = store.begin().await.unwrap();
        assert!(index.get(txn.as_mut(), "anno", 7, 0, 0).await.unwrap().is_empty());
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_across_resolutions() {
        let store = MemoryRowStore::new();
        let index = SpatialIndex::default();

        let mut txn = store.begin().await.unwrap();
        for res in 0..3 {
            index.update(txn.as_mut(), "anno", &delta(7, &[res as u64]), res, 0).await.unwrap();
        }
        index.delete(txn.as_mut(), "anno", 7, &[0, 1, 2], &[0]).await.unwrap();
        txn.commit().await.unwrap();

        assert_eq!(store.table_len("anno_idx_res0"), 0);
        assert_eq!(store.table_len("anno_idx_res2"), 0);
    }

    #[tokio::test]
    async fn test_failures_become_index_errors() {
        let store = MemoryRowStore::new();
        let mut txn = store.begin().await.unwrap();
        txn.insert("anno_idx_res0", "9&0", Bytes::from_static(b"garbage"))
            .await
            .unwrap();
        let err = SpatialIndex::default()
            .get(txn.as_mut(), "anno", 9, 0, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, SpatialDbError::IndexStore(_)));

        store.set_offline(true);
        let err = SpatialIndex::default()
            .get(txn.as_mut(), "anno", 9, 0, 0)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
