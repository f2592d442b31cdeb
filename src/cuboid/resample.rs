//! Nearest-neighbour resampling along x and y, and byte-plane extraction

use super::{Cuboid, CuboidData, Element};
use crate::error::{Result, SpatialDbError};
use ndarray::Array4;

/// Largest supported zoom step; 2^16 along one axis is already far beyond
/// any pyramid in practice.
const MAX_LEVELS: u32 = 16;

fn check_levels(levels: u32) -> Result<usize> {
    if levels > MAX_LEVELS {
        return Err(SpatialDbError::InvalidArgument(format!(
            "zoom of {} levels exceeds {}",
            levels, MAX_LEVELS
        )));
    }
    Ok(1usize << levels)
}

fn zoom_in_array<T: Element>(data: &Array4<T>, factor: usize) -> Array4<T> {
    let (t, z, y, x) = data.dim();
    Array4::from_shape_fn((t, z, y * factor, x * factor), |(ti, zi, yi, xi)| {
        data[[ti, zi, yi / factor, xi / factor]]
    })
}

fn zoom_out_array<T: Element>(data: &Array4<T>, factor: usize) -> Array4<T> {
    let (t, z, y, x) = data.dim();
    Array4::from_shape_fn((t, z, y / factor, x / factor), |(ti, zi, yi, xi)| {
        data[[ti, zi, yi * factor, xi * factor]]
    })
}

fn byte_planes<T: Element>(data: &Array4<T>) -> Vec<Array4<u8>> {
    (0..T::WIDTH)
        .map(|i| data.mapv(|v| v.le_byte(i)))
        .collect()
}

impl CuboidData {
    /// Replicate each voxel into a `2^levels` square in x and y
    pub fn zoom_in(&self, levels: u32) -> Result<CuboidData> {
        let factor = check_levels(levels)?;
        Ok(dispatch_map!(self, a => zoom_in_array(a, factor)))
    }

    /// Keep every `2^levels`-th voxel in x and y
    pub fn zoom_out(&self, levels: u32) -> Result<CuboidData> {
        let factor = check_levels(levels)?;
        let [_, _, y, x] = self.shape();
        if y < factor || x < factor {
            return Err(SpatialDbError::InvalidDimensions(format!(
                "cannot shrink {}x{} by {}",
                x, y, factor
            )));
        }
        Ok(dispatch_map!(self, a => zoom_out_array(a, factor)))
    }

    /// Split a packed payload into little-endian byte planes.
    ///
    /// Plane 0 holds the least significant byte of every voxel.
    pub fn extract_channels(&self) -> Result<Vec<Array4<u8>>> {
        match self {
            CuboidData::Mask(_) => Err(SpatialDbError::Unsupported(
                "bit masks have no byte planes".into(),
            )),
            CuboidData::U8(a) => Ok(byte_planes(a)),
            CuboidData::U16(a) => Ok(byte_planes(a)),
            CuboidData::U32(a) => Ok(byte_planes(a)),
            CuboidData::U64(a) => Ok(byte_planes(a)),
            CuboidData::F32(a) => Ok(byte_planes(a)),
        }
    }
}

impl Cuboid {
    pub fn zoom_in(&mut self, levels: u32) -> Result<()> {
        if levels > 0 {
            self.data = self.data.zoom_in(levels)?;
        }
        Ok(())
    }

    pub fn zoom_out(&mut self, levels: u32) -> Result<()> {
        if levels > 0 {
            self.data = self.data.zoom_out(levels)?;
        }
        Ok(())
    }

    pub fn extract_channels(&self) -> Result<Vec<Array4<u8>>> {
        self.data.extract_channels()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelKind, DataType};

    fn ramp() -> CuboidData {
        let a = Array4::from_shape_fn((1, 2, 4, 4), |(_, z, y, x)| (z * 100 + y * 10 + x) as u32);
        CuboidData::U32(a)
    }

    #[test]
    fn test_zoom_in() {
        let zoomed = ramp().zoom_in(1).unwrap();
        assert_eq!(zoomed.shape(), [1, 2, 8, 8]);
        assert_eq!(zoomed.label_at(0, [5, 3, 1]).unwrap(), 100 + 10 + 2);
        assert_eq!(zoomed.label_at(0, [4, 2, 1]).unwrap(), 100 + 10 + 2);
    }

    #[test]
    fn test_zoom_out() {
        let shrunk = ramp().zoom_out(1).unwrap();
        assert_eq!(shrunk.shape(), [1, 2, 2, 2]);
        assert_eq!(shrunk.label_at(0, [1, 1, 1]).unwrap(), 100 + 20 + 2);
        assert!(ramp().zoom_out(3).is_err());
    }

    #[test]
    fn test_zoom_round_trip() {
        let back = ramp().zoom_in(2).unwrap().zoom_out(2).unwrap();
        assert_eq!(back, ramp());
    }

    #[test]
    fn test_extract_channels() {
        let mut c = Cuboid::new(ChannelKind::Image, DataType::U32, [2, 1, 1], [0, 1]).unwrap();
        if let CuboidData::U32(a) = c.data_mut() {
            a[[0, 0, 0, 0]] = 0x0403_0201;
            a[[0, 0, 0, 1]] = 0xff00_00aa;
        }
        let planes = c.extract_channels().unwrap();
        assert_eq!(planes.len(), 4);
        assert_eq!(planes[0][[0, 0, 0, 0]], 0x01);
        assert_eq!(planes[1][[0, 0, 0, 0]], 0x02);
        assert_eq!(planes[3][[0, 0, 0, 0]], 0x04);
        assert_eq!(planes[0][[0, 0, 0, 1]], 0xaa);
        assert_eq!(planes[3][[0, 0, 0, 1]], 0xff);
    }

    #[test]
    fn test_extract_channels_mask_unsupported() {
        let mask = CuboidData::zeros(DataType::U1, [1, 1, 2, 2]);
        assert!(matches!(
            mask.extract_channels(),
            Err(SpatialDbError::Unsupported(_))
        ));
    }
}
