//! Label writes: sparse annotate/shave and dense exception/shave merges
//!
//! Offsets handed back to callers are cuboid-relative `[x, y, z]` triples,
//! the same form the exception tracker stores.

use super::{Cuboid, CuboidData, Label};
use crate::error::{Result, SpatialDbError};
use crate::types::ConflictPolicy;
use ndarray::{Array4, Axis, Zip};
use std::collections::BTreeMap;

/// Conflicting voxels grouped by the entity that claimed them
pub type ExceptionMap = BTreeMap<u64, Vec<[u32; 3]>>;

impl CuboidData {
    /// Label the global voxels `voxels` with `entity`.
    ///
    /// `offset` is the global voxel position of this cuboid's corner. Returns
    /// the relative offsets that already held a different label and were kept
    /// under `policy`. Every voxel is bounds checked before any is written.
    pub fn annotate(
        &mut self,
        entity: u64,
        offset: [u64; 3],
        voxels: &[[u64; 3]],
        policy: ConflictPolicy,
    ) -> Result<Vec<[u32; 3]>> {
        check_entity(entity)?;
        let local = self.localize(offset, voxels)?;
        dispatch_label!(self, a => annotate_labels(a, entity, &local, policy))
    }

    /// Clear `entity` from the global voxels `voxels`.
    ///
    /// Returns `(exceptions, zeroed)`: voxels that did not hold `entity` and
    /// voxels that were cleared.
    pub fn shave(
        &mut self,
        entity: u64,
        offset: [u64; 3],
        voxels: &[[u64; 3]],
    ) -> Result<(Vec<[u32; 3]>, Vec<[u32; 3]>)> {
        check_entity(entity)?;
        let local = self.localize(offset, voxels)?;
        dispatch_label!(self, a => shave_labels(a, entity, &local))
    }

    /// Dense merge that keeps existing labels.
    ///
    /// Voxels where both payloads are nonzero and differ are collected per
    /// incoming label before `preserve` is applied.
    pub fn exception(&mut self, other: &CuboidData) -> Result<ExceptionMap> {
        self.check_same_shape(other)?;
        dispatch_label_pair!(self, other, dst, src => Ok(exception_labels(dst, src)))
    }

    /// Dense shave: clear voxels where `other` holds the same nonzero label.
    ///
    /// Returns the voxels of `other` that did not match, per label.
    pub fn shave_dense(&mut self, other: &CuboidData) -> Result<ExceptionMap> {
        self.check_same_shape(other)?;
        dispatch_label_pair!(self, other, dst, src => Ok(shave_dense_labels(dst, src)))
    }

    fn localize(&self, offset: [u64; 3], voxels: &[[u64; 3]]) -> Result<Vec<[usize; 3]>> {
        let [t, ..] = self.shape();
        if t == 0 {
            return Err(SpatialDbError::InvalidDimensions(
                "cuboid has no timestamps".into(),
            ));
        }
        let dims = self.dims();
        voxels
            .iter()
            .map(|v| {
                let mut rel = [0usize; 3];
                for i in 0..3 {
                    match v[i].checked_sub(offset[i]) {
                        Some(r) if r < dims[i] => rel[i] = r as usize,
                        _ => {
                            return Err(SpatialDbError::OutOfBounds(format!(
                                "voxel {:?} outside cuboid at {:?} with extent {:?}",
                                v, offset, dims
                            )))
                        }
                    }
                }
                Ok(rel)
            })
            .collect()
    }
}

impl Cuboid {
    pub fn annotate(
        &mut self,
        entity: u64,
        offset: [u64; 3],
        voxels: &[[u64; 3]],
        policy: ConflictPolicy,
    ) -> Result<Vec<[u32; 3]>> {
        self.data.annotate(entity, offset, voxels, policy)
    }

    pub fn shave(
        &mut self,
        entity: u64,
        offset: [u64; 3],
        voxels: &[[u64; 3]],
    ) -> Result<(Vec<[u32; 3]>, Vec<[u32; 3]>)> {
        self.data.shave(entity, offset, voxels)
    }

    pub fn exception(&mut self, other: &CuboidData) -> Result<ExceptionMap> {
        self.data.exception(other)
    }

    pub fn shave_dense(&mut self, other: &CuboidData) -> Result<ExceptionMap> {
        self.data.shave_dense(other)
    }
}

fn check_entity(entity: u64) -> Result<()> {
    if entity == 0 {
        return Err(SpatialDbError::InvalidArgument(
            "entity id 0 is reserved for unlabeled voxels".into(),
        ));
    }
    Ok(())
}

#[inline]
fn triple(rel: [usize; 3]) -> [u32; 3] {
    [rel[0] as u32, rel[1] as u32, rel[2] as u32]
}

fn annotate_labels<T: Label>(
    data: &mut Array4<T>,
    entity: u64,
    local: &[[usize; 3]],
    policy: ConflictPolicy,
) -> Result<Vec<[u32; 3]>> {
    let id = T::from_id(entity)?;
    let mut slab = data.index_axis_mut(Axis(0), 0);
    let mut exceptions = Vec::new();
    for &rel in local {
        let cell = &mut slab[[rel[2], rel[1], rel[0]]];
        if cell.is_zero() || *cell == id {
            *cell = id;
            continue;
        }
        match policy {
            ConflictPolicy::Overwrite => *cell = id,
            ConflictPolicy::Preserve | ConflictPolicy::Exception => exceptions.push(triple(rel)),
        }
    }
    Ok(exceptions)
}

fn shave_labels<T: Label>(
    data: &mut Array4<T>,
    entity: u64,
    local: &[[usize; 3]],
) -> Result<(Vec<[u32; 3]>, Vec<[u32; 3]>)> {
    let id = T::from_id(entity)?;
    let mut slab = data.index_axis_mut(Axis(0), 0);
    let mut exceptions = Vec::new();
    let mut zeroed = Vec::new();
    for &rel in local {
        let cell = &mut slab[[rel[2], rel[1], rel[0]]];
        if *cell == id {
            *cell = T::default();
            zeroed.push(triple(rel));
        } else {
            exceptions.push(triple(rel));
        }
    }
    Ok((exceptions, zeroed))
}

fn collect_by_label<T: Label>(
    dst: &Array4<T>,
    src: &Array4<T>,
    hit: impl Fn(T, T) -> bool,
) -> ExceptionMap {
    let mut map = ExceptionMap::new();
    Zip::indexed(dst).and(src).for_each(|(_, z, y, x), &d, &s| {
        if !s.is_zero() && hit(d, s) {
            map.entry(s.into())
                .or_default()
                .push([x as u32, y as u32, z as u32]);
        }
    });
    map
}

fn exception_labels<T: Label>(dst: &mut Array4<T>, src: &Array4<T>) -> ExceptionMap {
    let conflicts = collect_by_label(dst, src, |d, s| !d.is_zero() && d != s);
    Zip::from(dst).and(src).for_each(|d, &s| {
        if d.is_zero() && !s.is_zero() {
            *d = s;
        }
    });
    conflicts
}

fn shave_dense_labels<T: Label>(dst: &mut Array4<T>, src: &Array4<T>) -> ExceptionMap {
    let misses = collect_by_label(dst, src, |d, s| d != s);
    Zip::from(dst).and(src).for_each(|d, &s| {
        if !s.is_zero() && *d == s {
            *d = T::default();
        }
    });
    misses
}
