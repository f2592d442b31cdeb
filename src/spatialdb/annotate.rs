//! Write operations: sparse and dense annotation, shaving, volume writes and
//! entity deletion

use super::{exception_key, require_annotation, SpatialDb, StagedCubes};
use crate::cuboid::CuboidData;
use crate::error::{Result, SpatialDbError};
use crate::io::Transaction;
use crate::layout::CuboidRange;
use crate::morton;
use crate::types::{Channel, ConflictPolicy};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Entity to the cuboid addresses a write touched
type IndexDelta = BTreeMap<u64, BTreeSet<u64>>;

/// A dense write padded out to whole cuboids
struct Padded {
    range: CuboidRange,
    buffer: CuboidData,
    cube_dims: [u64; 3],
}

impl Padded {
    /// Payload of the cuboid at `address`, all timestamps
    fn cuboid_at(&self, address: u64) -> Result<CuboidData> {
        let grid = morton::morton_to_xyz(address)?;
        let d = self.cube_dims;
        let origin = [
            (grid[0] - self.range.start[0]) * d[0],
            (grid[1] - self.range.start[1]) * d[1],
            (grid[2] - self.range.start[2]) * d[2],
        ];
        self.buffer.region(origin, d)
    }
}

fn check_policy(channel: &Channel, policy: ConflictPolicy) -> Result<()> {
    if policy == ConflictPolicy::Exception && !channel.exceptions {
        return Err(SpatialDbError::Unsupported(format!(
            "channel {} does not track exceptions",
            channel.name
        )));
    }
    Ok(())
}

fn check_single_time(data: &CuboidData) -> Result<()> {
    if data.shape()[0] != 1 {
        return Err(SpatialDbError::InvalidDimensions(format!(
            "annotation volumes hold one timestamp, got {}",
            data.shape()[0]
        )));
    }
    Ok(())
}

impl SpatialDb {
    /// Label `voxels` (global, at `resolution`) with `entity`.
    ///
    /// Voxels already holding another label are resolved by `policy`; kept
    /// conflicts become exceptions of `entity` when the channel tracks them.
    pub async fn annotate(
        &self,
        channel: &Channel,
        entity: u64,
        timestamp: u64,
        resolution: u32,
        voxels: &[[u64; 3]],
        policy: ConflictPolicy,
    ) -> Result<()> {
        require_annotation(channel)?;
        check_policy(channel, policy)?;
        self.layout.check_time(timestamp)?;
        let by_cube = self.group_by_cuboid(voxels, resolution)?;
        if by_cube.is_empty() {
            return Ok(());
        }

        let mut txn = self.rows.begin().await?;
        let mut staged = StagedCubes::default();
        let result = self
            .annotate_in(
                txn.as_mut(),
                &mut staged,
                channel,
                entity,
                timestamp,
                resolution,
                &by_cube,
                policy,
            )
            .await;
        self.finish_staged(txn, staged, result).await?;
        debug!(entity, cuboids = by_cube.len(), voxels = voxels.len(), "annotated");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn annotate_in(
        &self,
        txn: &mut dyn Transaction,
        staged: &mut StagedCubes,
        channel: &Channel,
        entity: u64,
        timestamp: u64,
        resolution: u32,
        by_cube: &BTreeMap<u64, Vec<[u64; 3]>>,
        policy: ConflictPolicy,
    ) -> Result<()> {
        let mut delta = IndexDelta::new();
        for (&address, voxels) in by_cube {
            let mut cube = self
                .get_cube_for_update(txn, staged, channel, resolution, address, timestamp)
                .await?;
            let origin = self.cube_origin(address, resolution)?;
            let conflicts = cube.annotate(entity, origin, voxels, policy)?;
            if channel.exceptions && !conflicts.is_empty() {
                let key = exception_key(channel, resolution, address, timestamp, entity);
                self.exceptions.update(txn, &key, &conflicts).await?;
            }
            self.stage(staged, channel, resolution, address, timestamp, &cube)?;
            delta.entry(entity).or_default().insert(address);
        }
        self.index
            .update(txn, &channel.name, &delta, resolution, timestamp)
            .await
    }

    /// Clear `entity` from `voxels`. The spatial index is left as is.
    pub async fn shave(
        &self,
        channel: &Channel,
        entity: u64,
        timestamp: u64,
        resolution: u32,
        voxels: &[[u64; 3]],
    ) -> Result<()> {
        require_annotation(channel)?;
        self.layout.check_time(timestamp)?;
        let by_cube = self.group_by_cuboid(voxels, resolution)?;
        if by_cube.is_empty() {
            return Ok(());
        }

        let mut txn = self.rows.begin().await?;
        let mut staged = StagedCubes::default();
        let result = async {
            let txn = txn.as_mut();
            for (&address, voxels) in &by_cube {
                let mut cube = self
                    .get_cube_for_update(txn, &mut staged, channel, resolution, address, timestamp)
                    .await?;
                let origin = self.cube_origin(address, resolution)?;
                let (missed, _) = cube.shave(entity, origin, voxels)?;
                // A voxel still held by another label may be one of ours as an exception
                if channel.exceptions && !missed.is_empty() {
                    let key = exception_key(channel, resolution, address, timestamp, entity);
                    self.exceptions.remove(txn, &key, &missed).await?;
                }
                self.stage(&mut staged, channel, resolution, address, timestamp, &cube)?;
            }
            Ok::<(), SpatialDbError>(())
        }
        .await;
        self.finish_staged(txn, staged, result).await?;
        debug!(entity, cuboids = by_cube.len(), "shaved");
        Ok(())
    }

    /// Write a dense label volume with its corner at `corner`.
    ///
    /// Every nonzero label of `data` is indexed in each cuboid it lands in.
    pub async fn annotate_dense(
        &self,
        channel: &Channel,
        timestamp: u64,
        corner: [u64; 3],
        resolution: u32,
        data: &CuboidData,
        policy: ConflictPolicy,
    ) -> Result<()> {
        require_annotation(channel)?;
        check_policy(channel, policy)?;
        check_single_time(data)?;
        self.layout.check_time(timestamp)?;
        let padded = self.pad(data, corner, resolution)?;

        let mut txn = self.rows.begin().await?;
        let mut staged = StagedCubes::default();
        let result = self
            .annotate_dense_in(
                txn.as_mut(),
                &mut staged,
                channel,
                timestamp,
                resolution,
                &padded,
                policy,
            )
            .await;
        let touched = self.finish_staged(txn, staged, result).await?;
        debug!(cuboids = touched, ?corner, "dense annotation");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn annotate_dense_in(
        &self,
        txn: &mut dyn Transaction,
        staged: &mut StagedCubes,
        channel: &Channel,
        timestamp: u64,
        resolution: u32,
        padded: &Padded,
        policy: ConflictPolicy,
    ) -> Result<usize> {
        let mut delta = IndexDelta::new();
        let mut touched = 0;
        // Ascending addresses: every writer takes cuboid row locks in the same order
        for address in padded.range.addresses()? {
            let slice = padded.cuboid_at(address)?;
            if !slice.is_not_zeros() {
                continue;
            }
            let mut cube = self
                .get_cube_for_update(txn, staged, channel, resolution, address, timestamp)
                .await?;
            match policy {
                ConflictPolicy::Overwrite => cube.overwrite(&slice)?,
                ConflictPolicy::Preserve => cube.preserve(&slice)?,
                ConflictPolicy::Exception => {
                    for (entity, offsets) in cube.exception(&slice)? {
                        let key = exception_key(channel, resolution, address, timestamp, entity);
                        self.exceptions.update(txn, &key, &offsets).await?;
                    }
                }
            }
            self.stage(staged, channel, resolution, address, timestamp, &cube)?;
            for label in slice.unique_labels()? {
                delta.entry(label).or_default().insert(address);
            }
            touched += 1;
        }
        self.index
            .update(txn, &channel.name, &delta, resolution, timestamp)
            .await?;
        Ok(touched)
    }

    /// Dense annotation of a single entity: every nonzero voxel of `data` becomes `entity`
    #[allow(clippy::too_many_arguments)]
    pub async fn annotate_entity_dense(
        &self,
        channel: &Channel,
        entity: u64,
        timestamp: u64,
        corner: [u64; 3],
        resolution: u32,
        data: &CuboidData,
        policy: ConflictPolicy,
    ) -> Result<()> {
        let relabeled = relabel(data, entity)?;
        self.annotate_dense(channel, timestamp, corner, resolution, &relabeled, policy)
            .await
    }

    /// Clear every voxel where `data` holds the label already stored there.
    ///
    /// Labels of `data` that miss are removed from their exception lists.
    pub async fn shave_dense(
        &self,
        channel: &Channel,
        timestamp: u64,
        corner: [u64; 3],
        resolution: u32,
        data: &CuboidData,
    ) -> Result<()> {
        require_annotation(channel)?;
        check_single_time(data)?;
        self.layout.check_time(timestamp)?;
        let padded = self.pad(data, corner, resolution)?;

        let mut txn = self.rows.begin().await?;
        let mut staged = StagedCubes::default();
        let result = async {
            let txn = txn.as_mut();
            let mut touched = 0usize;
            for address in padded.range.addresses()? {
                let slice = padded.cuboid_at(address)?;
                if !slice.is_not_zeros() {
                    continue;
                }
                let mut cube = self
                    .get_cube_for_update(txn, &mut staged, channel, resolution, address, timestamp)
                    .await?;
                let missed = cube.shave_dense(&slice)?;
                if channel.exceptions {
                    for (entity, offsets) in missed {
                        let key = exception_key(channel, resolution, address, timestamp, entity);
                        self.exceptions.remove(txn, &key, &offsets).await?;
                    }
                }
                self.stage(&mut staged, channel, resolution, address, timestamp, &cube)?;
                touched += 1;
            }
            Ok::<usize, SpatialDbError>(touched)
        }
        .await;
        let touched = self.finish_staged(txn, staged, result).await?;
        debug!(cuboids = touched, ?corner, "dense shave");
        Ok(())
    }

    pub async fn shave_entity_dense(
        &self,
        channel: &Channel,
        entity: u64,
        timestamp: u64,
        corner: [u64; 3],
        resolution: u32,
        data: &CuboidData,
    ) -> Result<()> {
        let relabeled = relabel(data, entity)?;
        self.shave_dense(channel, timestamp, corner, resolution, &relabeled)
            .await
    }

    /// Overwrite an image or time-series volume shaped `(t, z, y, x)`.
    ///
    /// Time index `i` of `data` is written at timestamp `time_range[0] + i`.
    pub async fn write_cuboid(
        &self,
        channel: &Channel,
        corner: [u64; 3],
        resolution: u32,
        data: &CuboidData,
        time_range: [u64; 2],
    ) -> Result<()> {
        if channel.kind.is_annotation() {
            return Err(SpatialDbError::Unsupported(format!(
                "channel {} holds annotations; use annotate_dense",
                channel.name
            )));
        }
        let steps = time_range[1].saturating_sub(time_range[0]);
        if steps == 0 || steps != data.shape()[0] as u64 {
            return Err(SpatialDbError::InvalidDimensions(format!(
                "time range {:?} does not match {} timestamps of data",
                time_range,
                data.shape()[0]
            )));
        }
        self.layout.check_time(time_range[0])?;
        self.layout.check_time(time_range[1] - 1)?;
        let padded = self.pad(data, corner, resolution)?;

        let mut txn = self.rows.begin().await?;
        let mut staged = StagedCubes::default();
        let result = async {
            let txn = txn.as_mut();
            for address in padded.range.addresses()? {
                let volume = padded.cuboid_at(address)?;
                for timestamp in time_range[0]..time_range[1] {
                    let slice = volume.time_slice((timestamp - time_range[0]) as usize)?;
                    let mut cube = self
                        .get_cube_for_update(txn, &mut staged, channel, resolution, address, timestamp)
                        .await?;
                    cube.overwrite(&slice)?;
                    self.stage(&mut staged, channel, resolution, address, timestamp, &cube)?;
                }
            }
            Ok::<(), SpatialDbError>(())
        }
        .await;
        self.finish_staged(txn, staged, result).await?;
        debug!(cuboids = padded.range.len(), ?time_range, "wrote volume");
        Ok(())
    }

    /// Erase `entity` everywhere: its voxels, its exceptions and its index
    /// entries, at every resolution and timestamp of the dataset.
    ///
    /// Returns the number of cuboids rewritten.
    pub async fn delete_anno_data(&self, channel: &Channel, entity: u64) -> Result<usize> {
        require_annotation(channel)?;
        let resolutions: Vec<u32> = self.layout.resolutions().collect();
        let timestamps: Vec<u64> = (self.layout.time_range[0]..self.layout.time_range[1]).collect();

        let mut txn = self.rows.begin().await?;
        let mut staged = StagedCubes::default();
        let result = async {
            let txn = txn.as_mut();
            let mut rewritten = 0usize;
            for &resolution in &resolutions {
                for &timestamp in &timestamps {
                    let addresses = self
                        .index
                        .get(txn, &channel.name, entity, resolution, timestamp)
                        .await?;
                    for address in addresses {
                        let mut cube = self
                            .get_cube_for_update(txn, &mut staged, channel, resolution, address, timestamp)
                            .await?;
                        cube.data_mut().erase_id(entity)?;
                        let key = exception_key(channel, resolution, address, timestamp, entity);
                        self.exceptions.delete(txn, &key).await?;
                        self.stage(&mut staged, channel, resolution, address, timestamp, &cube)?;
                        rewritten += 1;
                    }
                }
            }
            self.index
                .delete(txn, &channel.name, entity, &resolutions, &timestamps)
                .await?;
            Ok::<usize, SpatialDbError>(rewritten)
        }
        .await;
        let rewritten = self.finish_staged(txn, staged, result).await?;
        info!(entity, cuboids = rewritten, "deleted annotation");
        Ok(rewritten)
    }

    fn group_by_cuboid(
        &self,
        voxels: &[[u64; 3]],
        resolution: u32,
    ) -> Result<BTreeMap<u64, Vec<[u64; 3]>>> {
        let mut by_cube: BTreeMap<u64, Vec<[u64; 3]>> = BTreeMap::new();
        for &voxel in voxels {
            let (grid, _) = self.layout.locate(voxel, resolution)?;
            by_cube.entry(morton::encode(grid)?).or_default().push(voxel);
        }
        Ok(by_cube)
    }

    /// Copy `data` into a zero buffer aligned to the cuboids it covers
    fn pad(&self, data: &CuboidData, corner: [u64; 3], resolution: u32) -> Result<Padded> {
        let range = self.layout.covering(corner, data.dims(), resolution)?;
        let d = self.layout.cube_dims(resolution)?;
        let shape = [
            data.shape()[0],
            (range.count[2] * d[2]) as usize,
            (range.count[1] * d[1]) as usize,
            (range.count[0] * d[0]) as usize,
        ];
        let mut buffer = CuboidData::zeros(data.data_type(), shape);
        buffer.paste(
            data,
            [corner[0] % d[0], corner[1] % d[1], corner[2] % d[2]],
            0,
        )?;
        Ok(Padded {
            range,
            buffer,
            cube_dims: d,
        })
    }
}

fn relabel(data: &CuboidData, entity: u64) -> Result<CuboidData> {
    if entity == 0 {
        return Err(SpatialDbError::InvalidArgument(
            "entity id 0 is reserved for unlabeled voxels".into(),
        ));
    }
    let mut relabeled = data.clone();
    relabeled.remap(entity)?;
    Ok(relabeled)
}
