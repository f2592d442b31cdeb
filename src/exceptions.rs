//! Per-entity exception lists
//!
//! An exception records a voxel where an entity's write could not land
//! because another label already held it. Lists are keyed by
//! `(address, timestamp, entity)` within the channel's resolution table, and
//! hold cuboid-relative `[x, y, z]` offsets, deduplicated and in Morton order.

use crate::compression::{unpack, CompressionSettings};
use crate::error::{Result, SpatialDbError};
use crate::io::Transaction;
use crate::keys::{exception_row, exception_table};
use crate::morton;
use bytes::Bytes;
use std::collections::BTreeSet;

/// Deduplicate and sort in Morton order; offsets beyond the Morton range are rejected
fn normalize(offsets: impl IntoIterator<Item = [u32; 3]>) -> Result<Vec<[u32; 3]>> {
    let unique: BTreeSet<[u32; 3]> = offsets.into_iter().collect();
    let mut keyed = unique
        .into_iter()
        .map(|v| Ok((morton::encode([v[0] as u64, v[1] as u64, v[2] as u64])?, v)))
        .collect::<Result<Vec<(u64, [u32; 3])>>>()?;
    keyed.sort_unstable();
    Ok(keyed.into_iter().map(|(_, v)| v).collect())
}

/// Position of one exception list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionKey<'a> {
    pub channel: &'a str,
    pub resolution: u32,
    pub address: u64,
    pub timestamp: u64,
    pub entity: u64,
}

impl ExceptionKey<'_> {
    fn table(&self) -> String {
        exception_table(self.channel, self.resolution)
    }

    fn row(&self) -> String {
        exception_row(self.address, self.timestamp, self.entity)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExceptionTracker {
    compression: CompressionSettings,
}

impl ExceptionTracker {
    pub fn new(compression: CompressionSettings) -> Self {
        Self { compression }
    }

    pub async fn get(&self, txn: &mut dyn Transaction, key: &ExceptionKey<'_>) -> Result<Vec<[u32; 3]>> {
        let row = txn.select(&key.table(), &key.row()).await?;
        self.decode(row)
    }

    /// Union `offsets` into the list, creating it on first use
    pub async fn update(
        &self,
        txn: &mut dyn Transaction,
        key: &ExceptionKey<'_>,
        offsets: &[[u32; 3]],
    ) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }
        let (table, row) = (key.table(), key.row());
        let current = txn.select_for_update(&table, &row).await?;
        let exists = current.is_some();
        let mut merged = self.decode(current)?;
        merged.extend_from_slice(offsets);
        let blob = self.encode(&normalize(merged)?)?;
        txn.upsert(&table, &row, blob, exists).await
    }

    /// Remove `offsets` from the list; an emptied list is deleted
    pub async fn remove(
        &self,
        txn: &mut dyn Transaction,
        key: &ExceptionKey<'_>,
        offsets: &[[u32; 3]],
    ) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }
        let (table, row) = (key.table(), key.row());
        let Some(current) = txn.select_for_update(&table, &row).await? else {
            return Ok(());
        };
        let removed: BTreeSet<[u32; 3]> = offsets.iter().copied().collect();
        let kept: Vec<[u32; 3]> = self
            .decode(Some(current))?
            .into_iter()
            .filter(|v| !removed.contains(v))
            .collect();
        if kept.is_empty() {
            txn.delete(&table, &row).await
        } else {
            let blob = self.encode(&kept)?;
            txn.update(&table, &row, blob).await
        }
    }

    pub async fn delete(&self, txn: &mut dyn Transaction, key: &ExceptionKey<'_>) -> Result<()> {
        txn.delete(&key.table(), &key.row()).await
    }

    fn encode(&self, offsets: &[[u32; 3]]) -> Result<Bytes> {
        let flat: Vec<u32> = offsets.iter().flat_map(|v| v.iter().copied()).collect();
        Ok(Bytes::from(self.compression.pack(&flat)?))
    }

    fn decode(&self, row: Option<Bytes>) -> Result<Vec<[u32; 3]>> {
        let Some(blob) = row else {
            return Ok(Vec::new());
        };
        let flat: Vec<u32> = unpack(&blob)?;
        if flat.len() % 3 != 0 {
            return Err(SpatialDbError::CorruptPayload(format!(
                "exception list of {} values is not a list of triples",
                flat.len()
            )));
        }
        Ok(flat.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect())
    }
}
