//! Durable tier: super-cuboids in an object store
//!
//! A super-cuboid aggregates `factor[0] x factor[1] x factor[2]` cuboids of one
//! resolution and timestamp into a single object. Splitting it yields exactly
//! that many cuboids, which tile it without gaps or overlap.

use crate::compression::CompressionSettings;
use crate::cuboid::CuboidData;
use crate::error::{Result, SpatialDbError};
use crate::io::{IndexStore, ObjectStore};
use crate::keys::{CuboidKey, SuperCuboidKey};
use crate::layout::DatasetLayout;
use crate::morton;
use crate::types::DataType;
use crate::utils::now_score;
use bytes::Bytes;
use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Split a super-cuboid volume into cuboids of `cube_dims`.
///
/// Returns each cuboid with its grid position relative to the super-cuboid
/// corner, x varying fastest.
pub fn decompose_volume(
    data: &CuboidData,
    cube_dims: [u64; 3],
    factor: [u64; 3],
) -> Result<Vec<([u64; 3], CuboidData)>> {
    let expected = [
        cube_dims[0] * factor[0],
        cube_dims[1] * factor[1],
        cube_dims[2] * factor[2],
    ];
    if data.dims() != expected {
        return Err(SpatialDbError::InvalidDimensions(format!(
            "super-cuboid extent {:?} is not {:?}",
            data.dims(),
            expected
        )));
    }

    let mut parts = Vec::with_capacity((factor[0] * factor[1] * factor[2]) as usize);
    for z in 0..factor[2] {
        for y in 0..factor[1] {
            for x in 0..factor[0] {
                let origin = [x * cube_dims[0], y * cube_dims[1], z * cube_dims[2]];
                parts.push(([x, y, z], data.region(origin, cube_dims)?));
            }
        }
    }
    Ok(parts)
}

/// Paste cuboids into a super-cuboid volume at their relative grid positions
pub fn compose_volume(
    base: &mut CuboidData,
    parts: &[([u64; 3], CuboidData)],
    cube_dims: [u64; 3],
) -> Result<()> {
    for (rel, part) in parts {
        if part.dims() != cube_dims {
            return Err(SpatialDbError::InvalidDimensions(format!(
                "cuboid extent {:?} is not {:?}",
                part.dims(),
                cube_dims
            )));
        }
        let origin = [
            rel[0] * cube_dims[0],
            rel[1] * cube_dims[1],
            rel[2] * cube_dims[2],
        ];
        base.paste(part, origin, 0)?;
    }
    Ok(())
}

pub struct DurableStore {
    objects: Arc<dyn ObjectStore>,
    index: Arc<dyn IndexStore>,
    index_key: String,
    layout: Arc<DatasetLayout>,
    compression: CompressionSettings,
}

impl DurableStore {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        index: Arc<dyn IndexStore>,
        index_key: impl Into<String>,
        layout: Arc<DatasetLayout>,
        compression: CompressionSettings,
    ) -> Self {
        Self {
            objects,
            index,
            index_key: index_key.into(),
            layout,
            compression,
        }
    }

    pub fn layout(&self) -> &DatasetLayout {
        &self.layout
    }

    pub fn super_key(&self, key: &CuboidKey) -> Result<SuperCuboidKey> {
        key.super_key(self.layout.super_cuboid)
    }

    /// Whether the super-cuboid has been written durably
    pub async fn contains(&self, key: &SuperCuboidKey) -> Result<bool> {
        let scores = self
            .index
            .scores(&self.index_key, &[key.object_path()])
            .await?;
        Ok(scores.first().is_some_and(|s| s.is_some()))
    }

    pub async fn get_super_cuboid(&self, key: &SuperCuboidKey) -> Result<Option<CuboidData>> {
        let path = key.object_path();
        match self.objects.get(&path).await? {
            Some(blob) => {
                debug!(path = %path, bytes = blob.len(), "fetched super-cuboid");
                Ok(Some(CuboidData::from_compressed(&blob)?))
            }
            None => Ok(None),
        }
    }

    /// Fetch several super-cuboids concurrently, aligned with `keys`
    pub async fn get_super_cuboids(&self, keys: &[SuperCuboidKey]) -> Result<Vec<Option<CuboidData>>> {
        try_join_all(keys.iter().map(|k| self.get_super_cuboid(k))).await
    }

    pub async fn put_super_cuboid(&self, key: &SuperCuboidKey, data: &CuboidData) -> Result<()> {
        let dims = self.layout.super_dims(key.resolution)?;
        if data.dims() != dims {
            return Err(SpatialDbError::InvalidDimensions(format!(
                "super-cuboid extent {:?} is not {:?}",
                data.dims(),
                dims
            )));
        }
        let path = key.object_path();
        let blob = data.to_compressed(&self.compression)?;
        debug!(path = %path, bytes = blob.len(), "writing super-cuboid");
        self.objects.put(&path, Bytes::from(blob)).await?;
        self.index
            .add(&self.index_key, &[(path, now_score())])
            .await
    }

    pub async fn delete_super_cuboid(&self, key: &SuperCuboidKey) -> Result<()> {
        let path = key.object_path();
        self.objects.delete(&path).await?;
        self.index.remove(&self.index_key, &[path]).await
    }

    /// Split a super-cuboid into its keyed constituents, ascending by address
    pub fn decompose(
        &self,
        key: &SuperCuboidKey,
        data: &CuboidData,
    ) -> Result<Vec<(CuboidKey, CuboidData)>> {
        let factor = self.layout.super_cuboid;
        let cube_dims = self.layout.cube_dims(key.resolution)?;
        let origin = morton::super_origin(key.super_address, factor)?;

        let mut parts = decompose_volume(data, cube_dims, factor)?
            .into_iter()
            .map(|(rel, part)| {
                let address = morton::xyz_to_morton(
                    origin[0] + rel[0],
                    origin[1] + rel[1],
                    origin[2] + rel[2],
                )?;
                Ok((template(key).at(address), part))
            })
            .collect::<Result<Vec<_>>>()?;
        parts.sort_by_key(|(k, _)| k.address);
        Ok(parts)
    }

    /// Paste keyed cuboids into `base`; every key must belong to `key`
    pub fn compose(
        &self,
        key: &SuperCuboidKey,
        base: &mut CuboidData,
        parts: &[(CuboidKey, CuboidData)],
    ) -> Result<()> {
        let factor = self.layout.super_cuboid;
        let cube_dims = self.layout.cube_dims(key.resolution)?;
        let origin = morton::super_origin(key.super_address, factor)?;

        let placed = parts
            .iter()
            .map(|(k, part)| {
                if k.super_key(factor)? != *key {
                    return Err(SpatialDbError::InvalidArgument(format!(
                        "cuboid {} is not part of {}",
                        k, key
                    )));
                }
                let grid = morton::morton_to_xyz(k.address)?;
                let rel = [grid[0] - origin[0], grid[1] - origin[1], grid[2] - origin[2]];
                Ok((rel, part.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        compose_volume(base, &placed, cube_dims)
    }

    /// Empty super-cuboid volume for `key`
    pub fn zeros(&self, key: &SuperCuboidKey, data_type: DataType) -> Result<CuboidData> {
        let d = self.layout.super_dims(key.resolution)?;
        Ok(CuboidData::zeros(
            data_type,
            [1, d[2] as usize, d[1] as usize, d[0] as usize],
        ))
    }

    /// Read-modify-write the super-cuboids holding `parts`.
    ///
    /// Each part replaces its whole cuboid region. Super-cuboids that do not
    /// exist yet start from zeros. Returns the number of super-cuboids written.
    pub async fn write_cuboids(&self, parts: Vec<(CuboidKey, CuboidData)>) -> Result<usize> {
        let mut groups: BTreeMap<SuperCuboidKey, Vec<(CuboidKey, CuboidData)>> = BTreeMap::new();
        for (key, data) in parts {
            groups
                .entry(self.super_key(&key)?)
                .or_default()
                .push((key, data));
        }

        let super_keys: Vec<SuperCuboidKey> = groups.keys().cloned().collect();
        let existing = self.get_super_cuboids(&super_keys).await?;

        let writes = groups
            .into_iter()
            .zip(existing)
            .map(|((super_key, members), current)| {
                let data_type = members[0].1.data_type();
                let mut base = match current {
                    Some(data) => data,
                    None => self.zeros(&super_key, data_type)?,
                };
                self.compose(&super_key, &mut base, &members)?;
                Ok((super_key, base))
            })
            .collect::<Result<Vec<_>>>()?;

        let count = writes.len();
        try_join_all(
            writes
                .iter()
                .map(|(key, data)| self.put_super_cuboid(key, data)),
        )
        .await?;
        Ok(count)
    }
}

/// A cuboid key sharing everything but the address with `key`
fn template(key: &SuperCuboidKey) -> CuboidKey {
    CuboidKey::new(
        key.project.clone(),
        key.channel.clone(),
        key.resolution,
        0,
        key.timestamp,
    )
    .with_neariso(key.neariso)
}
