//! Dataset layout - how each resolution is divided into cuboids

use crate::error::{Result, SpatialDbError};
use crate::morton;
use crate::utils::div_ceil;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Geometry of a single resolution level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionLevel {
    /// Voxel extent of one cuboid, `[x, y, z]`
    pub cube_dims: [u64; 3],
    /// Voxel extent of the whole image, `[x, y, z]`
    pub image_size: [u64; 3],
}

impl ResolutionLevel {
    /// Number of cuboids along each axis
    pub fn grid_size(&self) -> [u64; 3] {
        [
            div_ceil(self.image_size[0], self.cube_dims[0]),
            div_ceil(self.image_size[1], self.cube_dims[1]),
            div_ceil(self.image_size[2], self.cube_dims[2]),
        ]
    }

    pub fn voxels_per_cube(&self) -> u64 {
        self.cube_dims.iter().product()
    }
}

/// A box of cuboids on the grid, `start` inclusive, `count` cuboids per axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CuboidRange {
    pub start: [u64; 3],
    pub count: [u64; 3],
}

impl CuboidRange {
    /// Total number of cuboids in the range
    pub fn len(&self) -> usize {
        self.count.iter().product::<u64>() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grid coordinates in z, y, x nesting order
    pub fn coords(&self) -> impl Iterator<Item = [u64; 3]> + '_ {
        let [sx, sy, sz] = self.start;
        let [cx, cy, cz] = self.count;
        (sz..sz + cz).flat_map(move |z| {
            (sy..sy + cy).flat_map(move |y| (sx..sx + cx).map(move |x| [x, y, z]))
        })
    }

    /// Morton addresses of every cuboid in the range, sorted ascending
    pub fn addresses(&self) -> Result<Vec<u64>> {
        let mut addrs = self
            .coords()
            .map(morton::encode)
            .collect::<Result<Vec<_>>>()?;
        addrs.sort_unstable();
        Ok(addrs)
    }
}

/// Layout of a dataset across all of its resolutions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetLayout {
    /// Resolution levels, index 0 is the finest
    pub levels: Vec<ResolutionLevel>,

    /// Number of cuboids per super-cuboid along each axis
    pub super_cuboid: [u64; 3],

    /// Valid timestamps, half open
    pub time_range: [u64; 2],
}

impl DatasetLayout {
    /// Build a pyramid from the base image size.
    ///
    /// Each coarser resolution halves x and y; z is never scaled.
    pub fn new(image_size: [u64; 3], cube_dims: [u64; 3], num_resolutions: u32) -> Result<Self> {
        if num_resolutions == 0 {
            return Err(SpatialDbError::InvalidDimensions(
                "a dataset needs at least one resolution".into(),
            ));
        }
        if cube_dims.iter().any(|&d| d == 0) || image_size.iter().any(|&d| d == 0) {
            return Err(SpatialDbError::InvalidDimensions(
                "cuboid and image dimensions must be positive".into(),
            ));
        }

        let levels = (0..num_resolutions)
            .map(|res| ResolutionLevel {
                cube_dims,
                image_size: [
                    div_ceil(image_size[0], 1 << res).max(1),
                    div_ceil(image_size[1], 1 << res).max(1),
                    image_size[2],
                ],
            })
            .collect();

        Ok(Self {
            levels,
            super_cuboid: [4, 4, 4],
            time_range: [0, 1],
        })
    }

    /// Override the cuboid shape of one resolution
    pub fn with_cube_dims(mut self, resolution: u32, cube_dims: [u64; 3]) -> Result<Self> {
        if cube_dims.iter().any(|&d| d == 0) {
            return Err(SpatialDbError::InvalidDimensions(
                "cuboid dimensions must be positive".into(),
            ));
        }
        let level = self
            .levels
            .get_mut(resolution as usize)
            .ok_or_else(|| SpatialDbError::OutOfBounds(format!("resolution {}", resolution)))?;
        level.cube_dims = cube_dims;
        Ok(self)
    }

    /// Set the super-cuboid factor
    pub fn with_super_cuboid(mut self, factor: [u64; 3]) -> Self {
        self.super_cuboid = factor;
        self
    }

    /// Set the valid time range (half open)
    pub fn with_time_range(mut self, start: u64, end: u64) -> Self {
        self.time_range = [start, end.max(start + 1)];
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.super_cuboid.iter().any(|&f| f == 0) {
            return Err(SpatialDbError::InvalidDimensions(
                "super-cuboid factor must be positive".into(),
            ));
        }
        if self.levels.is_empty() {
            return Err(SpatialDbError::InvalidDimensions(
                "a dataset needs at least one resolution".into(),
            ));
        }
        Ok(())
    }

    pub fn resolutions(&self) -> Range<u32> {
        0..self.levels.len() as u32
    }

    pub fn level(&self, resolution: u32) -> Result<&ResolutionLevel> {
        self.levels.get(resolution as usize).ok_or_else(|| {
            SpatialDbError::OutOfBounds(format!(
                "resolution {} not in {:?}",
                resolution,
                self.resolutions()
            ))
        })
    }

    pub fn cube_dims(&self, resolution: u32) -> Result<[u64; 3]> {
        Ok(self.level(resolution)?.cube_dims)
    }

    pub fn image_size(&self, resolution: u32) -> Result<[u64; 3]> {
        Ok(self.level(resolution)?.image_size)
    }

    /// Voxel extent of one super-cuboid at `resolution`
    pub fn super_dims(&self, resolution: u32) -> Result<[u64; 3]> {
        let c = self.cube_dims(resolution)?;
        Ok([
            c[0] * self.super_cuboid[0],
            c[1] * self.super_cuboid[1],
            c[2] * self.super_cuboid[2],
        ])
    }

    pub fn check_time(&self, timestamp: u64) -> Result<()> {
        if timestamp < self.time_range[0] || timestamp >= self.time_range[1] {
            return Err(SpatialDbError::OutOfBounds(format!(
                "timestamp {} outside {:?}",
                timestamp, self.time_range
            )));
        }
        Ok(())
    }

    /// Grid coordinate of the cuboid holding `voxel` and the voxel's offset inside it
    pub fn locate(&self, voxel: [u64; 3], resolution: u32) -> Result<([u64; 3], [u64; 3])> {
        let level = self.level(resolution)?;
        if (0..3).any(|i| voxel[i] >= level.image_size[i]) {
            return Err(SpatialDbError::OutOfBounds(format!(
                "voxel {:?} outside image {:?} at resolution {}",
                voxel, level.image_size, resolution
            )));
        }
        let d = level.cube_dims;
        Ok((
            [voxel[0] / d[0], voxel[1] / d[1], voxel[2] / d[2]],
            [voxel[0] % d[0], voxel[1] % d[1], voxel[2] % d[2]],
        ))
    }

    /// Cuboids covering the voxel box `corner .. corner + dim`
    pub fn covering(&self, corner: [u64; 3], dim: [u64; 3], resolution: u32) -> Result<CuboidRange> {
        let level = self.level(resolution)?;
        if dim.iter().any(|&d| d == 0) {
            return Err(SpatialDbError::InvalidDimensions(format!(
                "empty region {:?}",
                dim
            )));
        }
        let mut end = [0u64; 3];
        for i in 0..3 {
            end[i] = match corner[i].checked_add(dim[i]) {
                Some(e) if e <= level.image_size[i] => e,
                _ => {
                    return Err(SpatialDbError::OutOfBounds(format!(
                        "region {:?}+{:?} outside image {:?}",
                        corner, dim, level.image_size
                    )))
                }
            };
        }
        let d = level.cube_dims;
        let mut start = [0u64; 3];
        let mut count = [0u64; 3];
        for i in 0..3 {
            start[i] = corner[i] / d[i];
            count[i] = div_ceil(end[i], d[i]) - start[i];
        }
        Ok(CuboidRange { start, count })
    }

    /// Summary string of the layout
    pub fn summary(&self) -> String {
        let base = self.levels[0].image_size;
        format!(
            "{} resolutions, base {}x{}x{}, cuboid {:?}, super-cuboid {:?}",
            self.levels.len(),
            base[0],
            base[1],
            base[2],
            self.levels[0].cube_dims,
            self.super_cuboid
        )
    }
}
