//! Morton (Z-order) addressing of the cuboid grid
//!
//! Cuboid grid coordinates are interleaved bitwise into a single `u64`,
//! x in bit 0, y in bit 1, z in bit 2, and so on upward. Each axis gets
//! [`AXIS_BITS`] bits, which leaves the top bit of the address unused.
//!
//! Interleaving keeps spatially close cuboids numerically close, so sorting
//! work by address gives good locality in every storage tier.

use crate::error::{Result, SpatialDbError};

/// Bits available per axis
pub const AXIS_BITS: u32 = 21;

/// Largest coordinate that can be encoded on a single axis
pub const MAX_AXIS: u64 = (1 << AXIS_BITS) - 1;

/// Largest valid address (all three axes at [`MAX_AXIS`])
pub const MAX_ADDRESS: u64 = (1 << (3 * AXIS_BITS)) - 1;

#[inline]
fn spread(v: u64) -> u64 {
    let mut x = v & MAX_AXIS;
    x = (x | x << 32) & 0x001f_0000_0000_ffff;
    x = (x | x << 16) & 0x001f_0000_ff00_00ff;
    x = (x | x << 8) & 0x100f_00f0_0f00_f00f;
    x = (x | x << 4) & 0x10c3_0c30_c30c_30c3;
    x = (x | x << 2) & 0x1249_2492_4924_9249;
    x
}

#[inline]
fn compact(v: u64) -> u64 {
    let mut x = v & 0x1249_2492_4924_9249;
    x = (x ^ (x >> 2)) & 0x10c3_0c30_c30c_30c3;
    x = (x ^ (x >> 4)) & 0x100f_00f0_0f00_f00f;
    x = (x ^ (x >> 8)) & 0x001f_0000_ff00_00ff;
    x = (x ^ (x >> 16)) & 0x001f_0000_0000_ffff;
    x = (x ^ (x >> 32)) & MAX_AXIS;
    x
}

/// Encode a cuboid grid coordinate as a Morton address.
///
/// Fails with `InvalidCoordinate` when any axis exceeds [`MAX_AXIS`].
pub fn xyz_to_morton(x: u64, y: u64, z: u64) -> Result<u64> {
    if x > MAX_AXIS || y > MAX_AXIS || z > MAX_AXIS {
        return Err(SpatialDbError::InvalidCoordinate(format!(
            "({}, {}, {}) exceeds the {}-bit axis limit",
            x, y, z, AXIS_BITS
        )));
    }
    Ok(spread(x) | (spread(y) << 1) | (spread(z) << 2))
}

/// Decode a Morton address back into `[x, y, z]`.
pub fn morton_to_xyz(address: u64) -> Result<[u64; 3]> {
    if address > MAX_ADDRESS {
        return Err(SpatialDbError::InvalidCoordinate(format!(
            "address {} exceeds the {}-bit address space",
            address,
            3 * AXIS_BITS
        )));
    }
    Ok([compact(address), compact(address >> 1), compact(address >> 2)])
}

/// Convenience wrapper over [`xyz_to_morton`] taking an array
pub fn encode(coord: [u64; 3]) -> Result<u64> {
    xyz_to_morton(coord[0], coord[1], coord[2])
}

/// Address of the super-cuboid containing `address`.
///
/// The grid coordinate is divided by the super-cuboid factor along each axis
/// and re-encoded, so super-cuboids live on their own coarser Morton grid.
pub fn super_address(address: u64, factor: [u64; 3]) -> Result<u64> {
    if factor.iter().any(|&f| f == 0) {
        return Err(SpatialDbError::InvalidArgument(
            "super-cuboid factor must be positive".into(),
        ));
    }
    let [x, y, z] = morton_to_xyz(address)?;
    xyz_to_morton(x / factor[0], y / factor[1], z / factor[2])
}

/// Grid coordinate of the first cuboid inside the super-cuboid `super_addr`
pub fn super_origin(super_addr: u64, factor: [u64; 3]) -> Result<[u64; 3]> {
    let [sx, sy, sz] = morton_to_xyz(super_addr)?;
    Ok([sx * factor[0], sy * factor[1], sz * factor[2]])
}
