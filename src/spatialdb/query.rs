//! Read operations: cutouts and per-entity queries

use super::{exception_key, finish, require_annotation, SpatialDb};
use crate::cuboid::{Cuboid, CuboidData};
use crate::error::{Result, SpatialDbError};
use crate::io::Transaction;
use crate::layout::DatasetLayout;
use crate::morton;
use crate::types::{Channel, ConflictPolicy};
use crate::utils::div_ceil;
use std::collections::BTreeSet;
use tracing::debug;

/// Optional parts of a cutout request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CutoutOptions {
    /// Half-open time range; the first timestamp of the dataset when unset
    pub time_range: Option<[u64; 2]>,
    /// Keep only these entity ids, exceptions included
    pub ids: Option<Vec<u64>>,
    /// Read the near-isotropic tier
    pub neariso: bool,
}

impl CutoutOptions {
    pub fn with_time_range(mut self, start: u64, end: u64) -> Self {
        self.time_range = Some([start, end]);
        self
    }

    pub fn with_ids(mut self, ids: Vec<u64>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_neariso(mut self, neariso: bool) -> Self {
        self.neariso = neariso;
        self
    }
}

/// Resampling that maps the fetched resolution onto the requested one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Zoom {
    None,
    /// Data is coarser than requested; replicate voxels
    In(u32),
    /// Data is finer than requested; subsample voxels
    Out(u32),
}

/// Region to fetch for a cutout, in the coordinates of `resolution`
#[derive(Debug, Clone, Copy)]
struct CutoutPlan {
    corner: [u64; 3],
    dim: [u64; 3],
    resolution: u32,
    zoom: Zoom,
}

fn to_u64(offset: [u32; 3]) -> [u64; 3] {
    [offset[0] as u64, offset[1] as u64, offset[2] as u64]
}

impl SpatialDb {
    /// Extract the box `corner .. corner + dim` at `resolution`.
    ///
    /// Annotation channels stored at another resolution are fetched at their
    /// own resolution and resampled in x and y; propagated channels are read
    /// directly at coarser resolutions. Cuboids absent from every tier read
    /// as zeros.
    pub async fn cutout(
        &self,
        channel: &Channel,
        corner: [u64; 3],
        dim: [u64; 3],
        resolution: u32,
        options: &CutoutOptions,
    ) -> Result<Cuboid> {
        let first = self.layout.time_range[0];
        let time_range = options.time_range.unwrap_or([first, first + 1]);
        if time_range[1] <= time_range[0] {
            return Err(SpatialDbError::InvalidDimensions(format!(
                "empty time range {:?}",
                time_range
            )));
        }
        self.layout.check_time(time_range[0])?;
        self.layout.check_time(time_range[1] - 1)?;
        // Validates the request against the image at its own resolution
        self.layout.covering(corner, dim, resolution)?;

        let plan = plan_cutout(&self.layout, channel, corner, dim, resolution)?;
        let range = self.layout.covering(plan.corner, plan.dim, plan.resolution)?;
        let cube_dims = self.layout.cube_dims(plan.resolution)?;
        let addresses = range.addresses()?;
        let timestamps: Vec<u64> = (time_range[0]..time_range[1]).collect();
        let template = self
            .cuboid_key(channel, plan.resolution, 0, time_range[0])
            .with_neariso(options.neariso);
        let batch = self
            .coordinator
            .get_cubes(&template, &addresses, &timestamps)
            .await?;

        let mut out_dims = [
            range.count[0] * cube_dims[0],
            range.count[1] * cube_dims[1],
            range.count[2] * cube_dims[2],
        ];
        if let Zoom::Out(levels) = plan.zoom {
            // Whole zoom blocks only; the padding stays zero
            let factor = 1u64 << levels;
            for d in out_dims.iter_mut().take(2) {
                *d = div_ceil(*d, factor) * factor;
            }
        }
        let mut out = Cuboid::new(channel.kind, channel.data_type, out_dims, time_range)?;
        let ids = options
            .ids
            .as_deref()
            .filter(|_| channel.kind.is_annotation());
        let mut txn = match ids {
            Some(_) if channel.exceptions => Some(self.rows.begin().await?),
            _ => None,
        };

        let result = async {
            for (address, timestamp, blob) in batch {
                let Some(blob) = blob else {
                    continue;
                };
                let mut data = self.decode(channel, &blob)?;
                if let Some(ids) = ids {
                    data.filter_ids(ids)?;
                    if let Some(t) = txn.as_mut() {
                        self.apply_exceptions(
                            t.as_mut(),
                            channel,
                            plan.resolution,
                            address,
                            timestamp,
                            ids,
                            &mut data,
                        )
                        .await?;
                    }
                }
                let grid = morton::morton_to_xyz(address)?;
                let origin = [
                    (grid[0] - range.start[0]) * cube_dims[0],
                    (grid[1] - range.start[1]) * cube_dims[1],
                    (grid[2] - range.start[2]) * cube_dims[2],
                ];
                out.add_data(&data, timestamp, origin)?;
            }
            Ok::<(), SpatialDbError>(())
        }
        .await;
        match txn {
            Some(txn) => finish(txn, result).await?,
            None => result?,
        }

        // Offset of the request inside the assembled volume, in fetched voxels
        let mut origin = [0u64; 3];
        for i in 0..3 {
            origin[i] = plan.corner[i] - range.start[i] * cube_dims[i];
        }
        match plan.zoom {
            Zoom::In(levels) => {
                out.zoom_in(levels)?;
                for i in 0..2 {
                    origin[i] = corner[i] - ((range.start[i] * cube_dims[i]) << levels);
                }
            }
            Zoom::Out(levels) => {
                out.zoom_out(levels)?;
                for o in origin.iter_mut().take(2) {
                    *o >>= levels;
                }
            }
            Zoom::None => {}
        }
        out.trim(origin, dim)?;

        debug!(
            channel = %channel.name,
            ?corner,
            ?dim,
            resolution,
            cuboids = addresses.len(),
            "cutout"
        );
        Ok(out)
    }

    /// Cutout of a single timestamp restricted to `ids`, optionally relabeled to `remap`
    #[allow(clippy::too_many_arguments)]
    pub async fn anno_cutout(
        &self,
        channel: &Channel,
        ids: &[u64],
        timestamp: u64,
        resolution: u32,
        corner: [u64; 3],
        dim: [u64; 3],
        remap: Option<u64>,
    ) -> Result<Cuboid> {
        require_annotation(channel)?;
        let options = CutoutOptions::default()
            .with_time_range(timestamp, timestamp + 1)
            .with_ids(ids.to_vec());
        let mut cube = self
            .cutout(channel, corner, dim, resolution, &options)
            .await?;
        if let Some(id) = remap {
            cube.data_mut().remap(id)?;
        }
        Ok(cube)
    }

    /// Label at one voxel; 0 when unlabeled or never written.
    ///
    /// Channels that are not propagated are read at their own resolution.
    pub async fn get_voxel(
        &self,
        channel: &Channel,
        timestamp: u64,
        resolution: u32,
        voxel: [u64; 3],
    ) -> Result<u64> {
        require_annotation(channel)?;
        self.layout.check_time(timestamp)?;
        let (mut voxel, mut resolution) = (voxel, resolution);
        if !channel.propagated {
            if resolution > channel.resolution {
                let gap = resolution - channel.resolution;
                voxel[0] <<= gap;
                voxel[1] <<= gap;
            } else if resolution < channel.resolution {
                let gap = channel.resolution - resolution;
                voxel[0] >>= gap;
                voxel[1] >>= gap;
            }
            resolution = channel.resolution;
        }

        let (grid, offset) = self.layout.locate(voxel, resolution)?;
        let key = self.cuboid_key(channel, resolution, morton::encode(grid)?, timestamp);
        match self.coordinator.get_cube(&key).await? {
            Some(blob) => self.decode(channel, &blob)?.label_at(0, offset),
            None => Ok(0),
        }
    }

    /// Every voxel of `entity`, exceptions included, at `resolution`, ascending.
    ///
    /// An entity stored at a coarser resolution is expanded to a square of
    /// voxels in x and y per stored voxel.
    pub async fn get_locations(
        &self,
        channel: &Channel,
        entity: u64,
        timestamp: u64,
        resolution: u32,
    ) -> Result<Vec<[u64; 3]>> {
        require_annotation(channel)?;
        self.layout.check_time(timestamp)?;
        let effective = resolution.max(channel.resolution);

        let mut txn = self.rows.begin().await?;
        let result = self
            .locations_in(txn.as_mut(), channel, entity, timestamp, effective)
            .await;
        let mut voxels = finish(txn, result).await?;

        if effective > resolution {
            let factor = 1u64 << (effective - resolution);
            voxels = voxels
                .into_iter()
                .flat_map(|v| {
                    (0..factor).flat_map(move |dy| {
                        (0..factor).map(move |dx| [v[0] * factor + dx, v[1] * factor + dy, v[2]])
                    })
                })
                .collect();
        }
        voxels.sort_unstable();
        voxels.dedup();
        Ok(voxels)
    }

    async fn locations_in(
        &self,
        txn: &mut dyn Transaction,
        channel: &Channel,
        entity: u64,
        timestamp: u64,
        resolution: u32,
    ) -> Result<Vec<[u64; 3]>> {
        let addresses: Vec<u64> = self
            .index
            .get(txn, &channel.name, entity, resolution, timestamp)
            .await?
            .into_iter()
            .collect();
        let template = self.cuboid_key(channel, resolution, 0, timestamp);
        let batch = self
            .coordinator
            .get_cubes(&template, &addresses, &[timestamp])
            .await?;

        let mut voxels = Vec::new();
        for (address, _, blob) in batch {
            let mut local = match blob {
                Some(blob) => self.decode(channel, &blob)?.locations_of(entity)?,
                None => Vec::new(),
            };
            if channel.exceptions {
                let key = exception_key(channel, resolution, address, timestamp, entity);
                local.extend(self.exceptions.get(txn, &key).await?.into_iter().map(to_u64));
            }
            let origin = self.cube_origin(address, resolution)?;
            voxels.extend(
                local
                    .into_iter()
                    .map(|v| [v[0] + origin[0], v[1] + origin[1], v[2] + origin[2]]),
            );
        }
        Ok(voxels)
    }

    /// Tight voxel bounding box `(corner, dim)` of `ids` at `resolution`.
    ///
    /// Only cuboids on the faces of the indexed region are loaded. `None`
    /// when the ids have no voxels.
    pub async fn get_bounding_box(
        &self,
        channel: &Channel,
        ids: &[u64],
        timestamp: u64,
        resolution: u32,
    ) -> Result<Option<([u64; 3], [u64; 3])>> {
        require_annotation(channel)?;
        self.layout.check_time(timestamp)?;
        let effective = resolution.max(channel.resolution);
        let addresses = self
            .indexed_addresses(channel, ids, timestamp, effective)
            .await?;
        let Some((lo_grid, hi_grid)) = grid_extent(&addresses)? else {
            return Ok(None);
        };

        let mut boundary = Vec::new();
        for &address in &addresses {
            let g = morton::morton_to_xyz(address)?;
            if (0..3).any(|i| g[i] == lo_grid[i] || g[i] == hi_grid[i]) {
                boundary.push(address);
            }
        }
        let template = self.cuboid_key(channel, effective, 0, timestamp);
        let batch = self
            .coordinator
            .get_cubes(&template, &boundary, &[timestamp])
            .await?;

        let mut extent: Option<([u64; 3], [u64; 3])> = None;
        for (address, _, blob) in batch {
            let Some(blob) = blob else {
                continue;
            };
            let data = self.decode(channel, &blob)?;
            let origin = self.cube_origin(address, effective)?;
            for &id in ids {
                let Some((lo, hi)) = data.extent_of(id)? else {
                    continue;
                };
                let lo = [lo[0] + origin[0], lo[1] + origin[1], lo[2] + origin[2]];
                let hi = [hi[0] + origin[0], hi[1] + origin[1], hi[2] + origin[2]];
                extent = Some(match extent {
                    None => (lo, hi),
                    Some((a, b)) => (
                        [a[0].min(lo[0]), a[1].min(lo[1]), a[2].min(lo[2])],
                        [b[0].max(hi[0]), b[1].max(hi[1]), b[2].max(hi[2])],
                    ),
                });
            }
        }

        let gap = effective - resolution;
        Ok(extent.map(|(lo, hi)| {
            let dim = [hi[0] - lo[0] + 1, hi[1] - lo[1] + 1, hi[2] - lo[2] + 1];
            (
                [lo[0] << gap, lo[1] << gap, lo[2]],
                [dim[0] << gap, dim[1] << gap, dim[2]],
            )
        }))
    }

    /// Cuboid-aligned bounding box `(corner, dim)` of `ids`, from the index alone
    pub async fn get_bounding_cube(
        &self,
        channel: &Channel,
        ids: &[u64],
        timestamp: u64,
        resolution: u32,
    ) -> Result<Option<([u64; 3], [u64; 3])>> {
        require_annotation(channel)?;
        self.layout.check_time(timestamp)?;
        let effective = resolution.max(channel.resolution);
        let addresses = self
            .indexed_addresses(channel, ids, timestamp, effective)
            .await?;
        let Some((lo, hi)) = grid_extent(&addresses)? else {
            return Ok(None);
        };

        let d = self.layout.cube_dims(effective)?;
        let gap = effective - resolution;
        let scale = [1u64 << gap, 1u64 << gap, 1];
        let mut corner = [0u64; 3];
        let mut dim = [0u64; 3];
        for i in 0..3 {
            corner[i] = lo[i] * d[i] * scale[i];
            dim[i] = (hi[i] - lo[i] + 1) * d[i] * scale[i];
        }
        Ok(Some((corner, dim)))
    }

    /// `(offset, payload)` of every indexed cuboid holding `ids`.
    ///
    /// Payloads keep only `ids` plus their exceptions, optionally relabeled
    /// to `remap`, and are zoomed to `resolution` when stored coarser.
    /// Offsets are global voxel positions at `resolution`.
    pub async fn anno_cube_offsets(
        &self,
        channel: &Channel,
        ids: &[u64],
        timestamp: u64,
        resolution: u32,
        remap: Option<u64>,
    ) -> Result<Vec<([u64; 3], CuboidData)>> {
        require_annotation(channel)?;
        self.layout.check_time(timestamp)?;
        let effective = resolution.max(channel.resolution);
        let gap = effective - resolution;

        let mut txn = self.rows.begin().await?;
        let result = async {
            let txn = txn.as_mut();
            let mut addresses = BTreeSet::new();
            for &id in ids {
                addresses.extend(
                    self.index
                        .get(txn, &channel.name, id, effective, timestamp)
                        .await?,
                );
            }
            let addresses: Vec<u64> = addresses.into_iter().collect();
            let template = self.cuboid_key(channel, effective, 0, timestamp);
            let batch = self
                .coordinator
                .get_cubes(&template, &addresses, &[timestamp])
                .await?;

            let mut cubes = Vec::with_capacity(batch.len());
            for (address, _, blob) in batch {
                let Some(blob) = blob else {
                    continue;
                };
                let mut data = self.decode(channel, &blob)?;
                data.filter_ids(ids)?;
                if channel.exceptions {
                    self.apply_exceptions(
                        txn, channel, effective, address, timestamp, ids, &mut data,
                    )
                    .await?;
                }
                if let Some(id) = remap {
                    data.remap(id)?;
                }
                if gap > 0 {
                    data = data.zoom_in(gap)?;
                }
                let origin = self.cube_origin(address, effective)?;
                cubes.push(([origin[0] << gap, origin[1] << gap, origin[2]], data));
            }
            Ok::<Vec<([u64; 3], CuboidData)>, SpatialDbError>(cubes)
        }
        .await;
        finish(txn, result).await
    }

    /// Union of the index entries of `ids`
    async fn indexed_addresses(
        &self,
        channel: &Channel,
        ids: &[u64],
        timestamp: u64,
        resolution: u32,
    ) -> Result<BTreeSet<u64>> {
        let mut txn = self.rows.begin().await?;
        let result = async {
            let mut addresses = BTreeSet::new();
            for &id in ids {
                addresses.extend(
                    self.index
                        .get(txn.as_mut(), &channel.name, id, resolution, timestamp)
                        .await?,
                );
            }
            Ok::<BTreeSet<u64>, SpatialDbError>(addresses)
        }
        .await;
        finish(txn, result).await
    }

    /// Write each id back onto the voxels where it is an exception
    #[allow(clippy::too_many_arguments)]
    async fn apply_exceptions(
        &self,
        txn: &mut dyn Transaction,
        channel: &Channel,
        resolution: u32,
        address: u64,
        timestamp: u64,
        ids: &[u64],
        data: &mut CuboidData,
    ) -> Result<()> {
        for &id in ids {
            let key = exception_key(channel, resolution, address, timestamp, id);
            let offsets = self.exceptions.get(txn, &key).await?;
            if offsets.is_empty() {
                continue;
            }
            let voxels: Vec<[u64; 3]> = offsets.into_iter().map(to_u64).collect();
            data.annotate(id, [0, 0, 0], &voxels, ConflictPolicy::Overwrite)?;
        }
        Ok(())
    }
}

/// Window to fetch for a cutout at `resolution`.
///
/// A zoom-out window is clipped to the finer image; voxels past its edge read as zero.
fn plan_cutout(
    layout: &DatasetLayout,
    channel: &Channel,
    corner: [u64; 3],
    dim: [u64; 3],
    resolution: u32,
) -> Result<CutoutPlan> {
    let mut plan = CutoutPlan {
        corner,
        dim,
        resolution,
        zoom: Zoom::None,
    };
    if !channel.kind.is_annotation() {
        return Ok(plan);
    }
    if channel.resolution > resolution {
        let gap = channel.resolution - resolution;
        for i in 0..2 {
            let start = corner[i] >> gap;
            let end = (corner[i] + dim[i] - 1) >> gap;
            plan.corner[i] = start;
            plan.dim[i] = end - start + 1;
        }
        plan.resolution = channel.resolution;
        plan.zoom = Zoom::In(gap);
    } else if channel.resolution < resolution && !channel.propagated {
        let gap = resolution - channel.resolution;
        let image = layout.image_size(channel.resolution)?;
        for i in 0..2 {
            plan.corner[i] = corner[i] << gap;
            plan.dim[i] = (dim[i] << gap).min(image[i].saturating_sub(plan.corner[i]));
        }
        plan.resolution = channel.resolution;
        plan.zoom = Zoom::Out(gap);
    }
    Ok(plan)
}

/// Per-axis minimum and maximum grid coordinates of `addresses`
fn grid_extent(addresses: &BTreeSet<u64>) -> Result<Option<([u64; 3], [u64; 3])>> {
    let mut extent: Option<([u64; 3], [u64; 3])> = None;
    for &address in addresses {
        let g = morton::morton_to_xyz(address)?;
        extent = Some(match extent {
            None => (g, g),
            Some((lo, hi)) => (
                [lo[0].min(g[0]), lo[1].min(g[1]), lo[2].min(g[2])],
                [hi[0].max(g[0]), hi[1].max(g[1]), hi[2].max(g[2])],
            ),
        });
    }
    Ok(extent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatialdb::tests::create_test_db;
    use crate::types::DataType;
    use ndarray::{s, Array4};

    fn ramp() -> CuboidData {
        CuboidData::U32(Array4::from_shape_fn((1, 2, 5, 6), |(_, z, y, x)| {
            (z * 100 + y * 10 + x + 1) as u32
        }))
    }

    #[tokio::test]
    async fn test_cutout_round_trip_unaligned() {
        let db = create_test_db();
        let chan = Channel::annotation("anno").unwrap();
        let data = ramp();
        db.annotate_dense(&chan, 0, [5, 6, 1], 0, &data, ConflictPolicy::Overwrite)
            .await
            .unwrap();

        let cube = db
            .cutout(&chan, [5, 6, 1], [6, 5, 2], 0, &CutoutOptions::default())
            .await
            .unwrap();
        assert_eq!(cube.data(), &data);
        assert_eq!(cube.time_start(), 0);

        let edge = db
            .cutout(&chan, [4, 6, 1], [2, 1, 1], 0, &CutoutOptions::default())
            .await
            .unwrap();
        assert_eq!(edge.label_at(0, [0, 0, 0]).unwrap(), 0);
        assert_eq!(edge.label_at(0, [1, 0, 0]).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cutout_of_nothing_is_zeros() {
        let db = create_test_db();
        let chan = Channel::image("em", DataType::U8).unwrap();
        let cube = db
            .cutout(&chan, [10, 10, 2], [20, 3, 5], 0, &CutoutOptions::default())
            .await
            .unwrap();
        assert_eq!(cube.dims(), [20, 3, 5]);
        assert!(!cube.is_not_zeros());

        let err = db
            .cutout(&chan, [60, 0, 0], [8, 1, 1], 0, &CutoutOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SpatialDbError::OutOfBounds(_)));
    }

    #[tokio::test]
    async fn test_cutout_ids_include_exceptions() {
        let db = create_test_db();
        let chan = Channel::annotation("anno").unwrap();
        db.annotate(&chan, 1, 0, 0, &[[0, 0, 0], [1, 0, 0]], ConflictPolicy::Overwrite)
            .await
            .unwrap();
        db.annotate(&chan, 2, 0, 0, &[[1, 0, 0], [2, 0, 0]], ConflictPolicy::Preserve)
            .await
            .unwrap();

        let options = CutoutOptions::default().with_ids(vec![2]);
        let cube = db
            .cutout(&chan, [0, 0, 0], [3, 1, 1], 0, &options)
            .await
            .unwrap();
        assert_eq!(cube.label_at(0, [0, 0, 0]).unwrap(), 0);
        assert_eq!(cube.label_at(0, [1, 0, 0]).unwrap(), 2);
        assert_eq!(cube.label_at(0, [2, 0, 0]).unwrap(), 2);

        let remapped = db
            .anno_cutout(&chan, &[1], 0, 0, [0, 0, 0], [3, 1, 1], Some(50))
            .await
            .unwrap();
        assert_eq!(remapped.label_at(0, [0, 0, 0]).unwrap(), 50);
        assert_eq!(remapped.label_at(0, [1, 0, 0]).unwrap(), 50);
        assert_eq!(remapped.label_at(0, [2, 0, 0]).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cutout_zooms_in_from_channel_resolution() {
        let db = create_test_db();
        let chan = Channel::annotation("anno").unwrap().with_resolution(1);
        db.annotate(&chan, 7, 0, 1, &[[2, 2, 0]], ConflictPolicy::Overwrite)
            .await
            .unwrap();

        let cube = db
            .cutout(&chan, [3, 3, 0], [3, 3, 1], 0, &CutoutOptions::default())
            .await
            .unwrap();
        assert_eq!(cube.dims(), [3, 3, 1]);
        assert_eq!(cube.label_at(0, [0, 0, 0]).unwrap(), 0);
        assert_eq!(cube.label_at(0, [1, 1, 0]).unwrap(), 7);
        assert_eq!(cube.label_at(0, [2, 2, 0]).unwrap(), 7);
    }

    #[tokio::test]
    async fn test_cutout_zooms_out_unpropagated() {
        let db = create_test_db();
        let chan = Channel::annotation("anno").unwrap();
        db.annotate(&chan, 7, 0, 0, &[[4, 4, 0]], ConflictPolicy::Overwrite)
            .await
            .unwrap();
        db.annotate(&chan, 8, 0, 0, &[[5, 5, 0]], ConflictPolicy::Overwrite)
            .await
            .unwrap();

        let cube = db
            .cutout(&chan, [2, 2, 0], [1, 1, 1], 1, &CutoutOptions::default())
            .await
            .unwrap();
        assert_eq!(cube.label_at(0, [0, 0, 0]).unwrap(), 7);

        // A propagated channel is read at the requested resolution as is
        let propagated = chan.clone().with_propagated(true);
        let cube = db
            .cutout(&propagated, [2, 2, 0], [1, 1, 1], 1, &CutoutOptions::default())
            .await
            .unwrap();
        assert_eq!(cube.label_at(0, [0, 0, 0]).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_voxel() {
        let db = create_test_db();
        let chan = Channel::annotation("anno").unwrap();
        db.annotate(&chan, 7, 0, 0, &[[4, 4, 0]], ConflictPolicy::Overwrite)
            .await
            .unwrap();

        assert_eq!(db.get_voxel(&chan, 0, 0, [4, 4, 0]).await.unwrap(), 7);
        assert_eq!(db.get_voxel(&chan, 0, 0, [0, 0, 0]).await.unwrap(), 0);
        assert_eq!(db.get_voxel(&chan, 0, 0, [40, 40, 8]).await.unwrap(), 0);
        // Coarser request scales onto the channel's resolution
        assert_eq!(db.get_voxel(&chan, 0, 1, [2, 2, 0]).await.unwrap(), 7);
        assert!(db.get_voxel(&chan, 0, 0, [64, 0, 0]).await.is_err());
    }

    #[tokio::test]
    async fn test_get_locations_with_exceptions_and_zoom() {
        let db = create_test_db();
        let chan = Channel::annotation("anno").unwrap().with_resolution(1);
        db.annotate(&chan, 1, 0, 1, &[[9, 0, 0]], ConflictPolicy::Overwrite)
            .await
            .unwrap();
        db.annotate(&chan, 7, 0, 1, &[[2, 2, 0], [9, 0, 0]], ConflictPolicy::Preserve)
            .await
            .unwrap();

        assert_eq!(
            db.get_locations(&chan, 7, 0, 1).await.unwrap(),
            vec![[2, 2, 0], [9, 0, 0]]
        );

        let fine = db.get_locations(&chan, 7, 0, 0).await.unwrap();
        assert_eq!(fine.len(), 8);
        assert!(fine.contains(&[4, 4, 0]));
        assert!(fine.contains(&[5, 5, 0]));
        assert!(fine.contains(&[19, 1, 0]));

        assert!(db.get_locations(&chan, 99, 0, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bounding_box_and_cube() {
        let db = create_test_db();
        let chan = Channel::annotation("anno").unwrap();
        db.annotate(&chan, 7, 0, 0, &[[1, 2, 3], [20, 10, 5]], ConflictPolicy::Overwrite)
            .await
            .unwrap();

        let bbox = db.get_bounding_box(&chan, &[7], 0, 0).await.unwrap();
        assert_eq!(bbox, Some(([1, 2, 3], [20, 9, 3])));

        let bcube = db.get_bounding_cube(&chan, &[7], 0, 0).await.unwrap();
        assert_eq!(bcube, Some(([0, 0, 0], [24, 16, 8])));

        assert_eq!(db.get_bounding_box(&chan, &[8], 0, 0).await.unwrap(), None);
        assert_eq!(db.get_bounding_cube(&chan, &[8], 0, 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_anno_cube_offsets() {
        let db = create_test_db();
        let chan = Channel::annotation("anno").unwrap();
        db.annotate(&chan, 7, 0, 0, &[[1, 2, 3], [20, 10, 5]], ConflictPolicy::Overwrite)
            .await
            .unwrap();
        db.annotate(&chan, 8, 0, 0, &[[2, 2, 3]], ConflictPolicy::Overwrite)
            .await
            .unwrap();

        let cubes = db.anno_cube_offsets(&chan, &[7], 0, 0, None).await.unwrap();
        assert_eq!(cubes.len(), 2);
        assert_eq!(cubes[0].0, [0, 0, 0]);
        assert_eq!(cubes[0].1.label_at(0, [1, 2, 3]).unwrap(), 7);
        assert_eq!(cubes[0].1.label_at(0, [2, 2, 3]).unwrap(), 0);
        assert_eq!(cubes[1].0, [16, 8, 4]);

        let remapped = db
            .anno_cube_offsets(&chan, &[7, 8], 0, 0, Some(3))
            .await
            .unwrap();
        assert_eq!(remapped[0].1.label_at(0, [2, 2, 3]).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_anno_cube_offsets_zoom() {
        let db = create_test_db();
        let chan = Channel::annotation("anno").unwrap().with_resolution(1);
        db.annotate(&chan, 7, 0, 1, &[[9, 1, 0]], ConflictPolicy::Overwrite)
            .await
            .unwrap();

        let cubes = db.anno_cube_offsets(&chan, &[7], 0, 0, None).await.unwrap();
        assert_eq!(cubes.len(), 1);
        let (offset, data) = &cubes[0];
        assert_eq!(*offset, [16, 0, 0]);
        assert_eq!(data.dims(), [16, 16, 4]);
        if let CuboidData::U32(a) = data {
            assert!(a.slice(s![0, 0, 2..4, 2..4]).iter().all(|&v| v == 7));
            assert_eq!(a.iter().filter(|&&v| v != 0).count(), 4);
        } else {
            panic!("expected U32 labels");
        }
    }
}
