//! Cuboid object model
//!
//! A [`Cuboid`] owns one dense voxel grid of a single element type. The grid
//! is stored as a 4-D `ndarray` shaped `(t, z, y, x)`; cuboids held by the
//! storage tiers always have a time extent of one, while assembled cutouts
//! carry the whole requested time range.
//!
//! Element types form a closed set and are modelled as the [`CuboidData`]
//! enum. Generic kernels are written once over the [`Element`] and [`Label`]
//! traits and reached through the dispatch macros below.

use crate::error::{Result, SpatialDbError};
use crate::types::{ChannelKind, DataType};
use ndarray::{s, Array3, Array4, ArrayView4, Axis, Zip};
use num_traits::FromPrimitive;
use std::fmt;
use std::hash::Hash;

/// Apply `$body` to the typed array inside a `CuboidData`, whatever its type.
macro_rules! dispatch {
    ($data:expr, $arr:ident => $body:expr) => {
        match $data {
            CuboidData::U8($arr) => $body,
            CuboidData::U16($arr) => $body,
            CuboidData::U32($arr) => $body,
            CuboidData::U64($arr) => $body,
            CuboidData::F32($arr) => $body,
            CuboidData::Mask($arr) => $body,
        }
    };
}

/// Like [`dispatch!`] but rebuilds a `CuboidData` of the same variant.
macro_rules! dispatch_map {
    ($data:expr, $arr:ident => $body:expr) => {
        match $data {
            CuboidData::U8($arr) => CuboidData::U8($body),
            CuboidData::U16($arr) => CuboidData::U16($body),
            CuboidData::U32($arr) => CuboidData::U32($body),
            CuboidData::U64($arr) => CuboidData::U64($body),
            CuboidData::F32($arr) => CuboidData::F32($body),
            CuboidData::Mask($arr) => CuboidData::Mask($body),
        }
    };
}

/// Apply `$body` to two payloads of the same type, `TypeMismatch` otherwise.
macro_rules! dispatch_pair {
    ($a:expr, $b:expr, $x:ident, $y:ident => $body:expr) => {
        match ($a, $b) {
            (CuboidData::U8($x), CuboidData::U8($y)) => $body,
            (CuboidData::U16($x), CuboidData::U16($y)) => $body,
            (CuboidData::U32($x), CuboidData::U32($y)) => $body,
            (CuboidData::U64($x), CuboidData::U64($y)) => $body,
            (CuboidData::F32($x), CuboidData::F32($y)) => $body,
            (CuboidData::Mask($x), CuboidData::Mask($y)) => $body,
            (a, b) => Err(crate::cuboid::mismatch(a.data_type(), b.data_type())),
        }
    };
}

/// Apply `$body` to a label payload (`U32`/`U64`), `TypeMismatch` otherwise.
macro_rules! dispatch_label {
    ($data:expr, $arr:ident => $body:expr) => {
        match $data {
            CuboidData::U32($arr) => $body,
            CuboidData::U64($arr) => $body,
            other => Err(crate::cuboid::not_labels(other.data_type())),
        }
    };
}

/// Two label payloads of the same width.
macro_rules! dispatch_label_pair {
    ($a:expr, $b:expr, $x:ident, $y:ident => $body:expr) => {
        match ($a, $b) {
            (CuboidData::U32($x), CuboidData::U32($y)) => $body,
            (CuboidData::U64($x), CuboidData::U64($y)) => $body,
            (a, b) => Err(crate::cuboid::mismatch(a.data_type(), b.data_type())),
        }
    };
}

pub mod annotate;
pub mod codec;
pub mod resample;

pub use annotate::ExceptionMap;

pub(crate) fn mismatch(expected: DataType, found: DataType) -> SpatialDbError {
    SpatialDbError::TypeMismatch {
        expected: expected.to_string(),
        found: found.to_string(),
    }
}

pub(crate) fn not_labels(found: DataType) -> SpatialDbError {
    SpatialDbError::TypeMismatch {
        expected: "U32 or U64 labels".to_string(),
        found: found.to_string(),
    }
}

/// A voxel element type
pub trait Element: Copy + PartialEq + Default + fmt::Debug + Send + Sync + 'static {
    const DATA_TYPE: DataType;

    /// Width in bytes of the little-endian encoding
    const WIDTH: usize;

    fn is_zero(&self) -> bool;

    /// Byte `i` of the little-endian encoding
    fn le_byte(&self, i: usize) -> u8;

    fn write_le(&self, out: &mut Vec<u8>);

    /// Decode from exactly [`Self::WIDTH`] bytes
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_int_element {
    ($t:ty, $dt:expr, $w:expr) => {
        impl Element for $t {
            const DATA_TYPE: DataType = $dt;
            const WIDTH: usize = $w;

            #[inline]
            fn is_zero(&self) -> bool {
                *self == 0
            }

            #[inline]
            fn le_byte(&self, i: usize) -> u8 {
                (*self >> (8 * i)) as u8
            }

            fn write_le(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; $w];
                buf.copy_from_slice(bytes);
                <$t>::from_le_bytes(buf)
            }
        }
    };
}

impl_int_element!(u8, DataType::U8, 1);
impl_int_element!(u16, DataType::U16, 2);
impl_int_element!(u32, DataType::U32, 4);
impl_int_element!(u64, DataType::U64, 8);

impl Element for f32 {
    const DATA_TYPE: DataType = DataType::F32;
    const WIDTH: usize = 4;

    #[inline]
    fn is_zero(&self) -> bool {
        *self == 0.0
    }

    #[inline]
    fn le_byte(&self, i: usize) -> u8 {
        (self.to_bits() >> (8 * i)) as u8
    }

    fn write_le(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        f32::from_le_bytes(buf)
    }
}

impl Element for bool {
    const DATA_TYPE: DataType = DataType::U1;
    const WIDTH: usize = 1;

    #[inline]
    fn is_zero(&self) -> bool {
        !*self
    }

    #[inline]
    fn le_byte(&self, i: usize) -> u8 {
        if i == 0 {
            *self as u8
        } else {
            0
        }
    }

    fn write_le(&self, out: &mut Vec<u8>) {
        out.push(*self as u8);
    }

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// Element types usable as entity labels
pub trait Label: Element + Eq + Hash + Ord + Into<u64> + FromPrimitive {
    /// Convert an entity id, failing when it does not fit the label width
    fn from_id(id: u64) -> Result<Self> {
        Self::from_u64(id).ok_or_else(|| {
            SpatialDbError::InvalidArgument(format!(
                "id {} does not fit in {} labels",
                id,
                Self::DATA_TYPE
            ))
        })
    }
}

impl Label for u32 {}
impl Label for u64 {}

/// Typed dense payload shaped `(t, z, y, x)`
#[derive(Debug, Clone, PartialEq)]
pub enum CuboidData {
    U8(Array4<u8>),
    U16(Array4<u16>),
    U32(Array4<u32>),
    U64(Array4<u64>),
    F32(Array4<f32>),
    Mask(Array4<bool>),
}

impl CuboidData {
    /// All-zero payload of the given type and `(t, z, y, x)` shape
    pub fn zeros(data_type: DataType, shape: [usize; 4]) -> Self {
        let sh = (shape[0], shape[1], shape[2], shape[3]);
        match data_type {
            DataType::U1 => CuboidData::Mask(Array4::default(sh)),
            DataType::U8 => CuboidData::U8(Array4::zeros(sh)),
            DataType::U16 => CuboidData::U16(Array4::zeros(sh)),
            DataType::U32 => CuboidData::U32(Array4::zeros(sh)),
            DataType::U64 => CuboidData::U64(Array4::zeros(sh)),
            DataType::F32 => CuboidData::F32(Array4::zeros(sh)),
        }
    }

    /// Build a single-timestamp label payload from a `(z, y, x)` volume
    pub fn from_labels(data_type: DataType, labels: &Array3<u64>) -> Result<Self> {
        let volume = labels.view().insert_axis(Axis(0));
        match data_type {
            DataType::U32 => {
                if let Some(&bad) = labels.iter().find(|&&v| v > u32::MAX as u64) {
                    return Err(SpatialDbError::InvalidArgument(format!(
                        "label {} does not fit in U32",
                        bad
                    )));
                }
                Ok(CuboidData::U32(volume.mapv(|v| v as u32)))
            }
            DataType::U64 => Ok(CuboidData::U64(volume.to_owned())),
            other => Err(not_labels(other)),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            CuboidData::U8(_) => DataType::U8,
            CuboidData::U16(_) => DataType::U16,
            CuboidData::U32(_) => DataType::U32,
            CuboidData::U64(_) => DataType::U64,
            CuboidData::F32(_) => DataType::F32,
            CuboidData::Mask(_) => DataType::U1,
        }
    }

    /// `(t, z, y, x)` shape
    pub fn shape(&self) -> [usize; 4] {
        let sh = dispatch!(self, a => a.shape());
        [sh[0], sh[1], sh[2], sh[3]]
    }

    /// Spatial extent as `[x, y, z]`
    pub fn dims(&self) -> [u64; 3] {
        let [_, z, y, x] = self.shape();
        [x as u64, y as u64, z as u64]
    }

    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any voxel is nonzero
    pub fn is_not_zeros(&self) -> bool {
        dispatch!(self, a => a.iter().any(|v| !v.is_zero()))
    }

    fn check_same_shape(&self, other: &CuboidData) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(SpatialDbError::InvalidDimensions(format!(
                "shape {:?} does not match {:?}",
                other.shape(),
                self.shape()
            )));
        }
        Ok(())
    }

    /// Replace every voxel where `other` is nonzero
    pub fn overwrite(&mut self, other: &CuboidData) -> Result<()> {
        self.check_same_shape(other)?;
        dispatch_pair!(self, other, dst, src => {
            Zip::from(dst).and(src).for_each(|d, s| {
                if !s.is_zero() {
                    *d = *s;
                }
            });
            Ok(())
        })
    }

    /// Fill only voxels that are currently zero with nonzero values of `other`
    pub fn preserve(&mut self, other: &CuboidData) -> Result<()> {
        self.check_same_shape(other)?;
        dispatch_pair!(self, other, dst, src => {
            Zip::from(dst).and(src).for_each(|d, s| {
                if d.is_zero() && !s.is_zero() {
                    *d = *s;
                }
            });
            Ok(())
        })
    }

    /// Copy out the box `origin .. origin + size` (`[x, y, z]`) for all timestamps
    pub fn region(&self, origin: [u64; 3], size: [u64; 3]) -> Result<CuboidData> {
        self.check_box(origin, size)?;
        let (x0, y0, z0) = (origin[0] as usize, origin[1] as usize, origin[2] as usize);
        let (x1, y1, z1) = (
            x0 + size[0] as usize,
            y0 + size[1] as usize,
            z0 + size[2] as usize,
        );
        Ok(dispatch_map!(self, a => a.slice(s![.., z0..z1, y0..y1, x0..x1]).to_owned()))
    }

    /// Write `other` into this payload with its corner at `origin` and its
    /// first timestamp at time index `t`
    pub fn paste(&mut self, other: &CuboidData, origin: [u64; 3], t: usize) -> Result<()> {
        let [ot, oz, oy, ox] = other.shape();
        let [st, ..] = self.shape();
        if t + ot > st {
            return Err(SpatialDbError::OutOfBounds(format!(
                "time slab {}..{} outside extent {}",
                t,
                t + ot,
                st
            )));
        }
        self.check_box(origin, [ox as u64, oy as u64, oz as u64])?;
        let (x0, y0, z0) = (origin[0] as usize, origin[1] as usize, origin[2] as usize);
        dispatch_pair!(self, other, dst, src => {
            dst.slice_mut(s![t..t + ot, z0..z0 + oz, y0..y0 + oy, x0..x0 + ox])
                .assign(src);
            Ok(())
        })
    }

    /// Single-timestamp view as an owned payload
    pub fn time_slice(&self, t: usize) -> Result<CuboidData> {
        let [st, ..] = self.shape();
        if t >= st {
            return Err(SpatialDbError::OutOfBounds(format!(
                "time index {} outside extent {}",
                t, st
            )));
        }
        Ok(dispatch_map!(self, a => a.slice(s![t..t + 1, .., .., ..]).to_owned()))
    }

    fn check_box(&self, origin: [u64; 3], size: [u64; 3]) -> Result<()> {
        let dims = self.dims();
        let fits = |i: usize| origin[i].checked_add(size[i]).is_some_and(|end| end <= dims[i]);
        if !(0..3).all(fits) {
            return Err(SpatialDbError::OutOfBounds(format!(
                "box {:?}+{:?} outside extent {:?}",
                origin, size, dims
            )));
        }
        Ok(())
    }

    /// Label value at `[x, y, z]` of time index `t`
    pub fn label_at(&self, t: usize, voxel: [u64; 3]) -> Result<u64> {
        let [st, ..] = self.shape();
        let dims = self.dims();
        if t >= st || (0..3).any(|i| voxel[i] >= dims[i]) {
            return Err(SpatialDbError::OutOfBounds(format!(
                "voxel {:?} at t={} outside extent {:?}",
                voxel, t, dims
            )));
        }
        let idx = [t, voxel[2] as usize, voxel[1] as usize, voxel[0] as usize];
        dispatch_label!(self, a => Ok(Into::<u64>::into(a[idx])))
    }

    /// Zero every voxel whose label is not in `ids`
    pub fn filter_ids(&mut self, ids: &[u64]) -> Result<()> {
        dispatch_label!(self, a => {
            filter_labels(a, ids);
            Ok(())
        })
    }

    /// Replace every nonzero label with `id`
    pub fn remap(&mut self, id: u64) -> Result<()> {
        dispatch_label!(self, a => remap_labels(a, id))
    }

    /// Zero every voxel labelled `id`
    pub fn erase_id(&mut self, id: u64) -> Result<()> {
        dispatch_label!(self, a => {
            erase_label(a, id);
            Ok(())
        })
    }

    /// Offsets `[x, y, z]` of time index 0 holding label `id`
    pub fn locations_of(&self, id: u64) -> Result<Vec<[u64; 3]>> {
        dispatch_label!(self, a => Ok(label_positions(a.view(), id)))
    }

    /// Per-axis minimum and maximum offsets of label `id`, if present
    pub fn extent_of(&self, id: u64) -> Result<Option<([u64; 3], [u64; 3])>> {
        let locations = self.locations_of(id)?;
        let mut iter = locations.into_iter();
        let Some(first) = iter.next() else {
            return Ok(None);
        };
        let (mut lo, mut hi) = (first, first);
        for v in iter {
            for i in 0..3 {
                lo[i] = lo[i].min(v[i]);
                hi[i] = hi[i].max(v[i]);
            }
        }
        Ok(Some((lo, hi)))
    }

    /// Distinct nonzero labels of the payload, ascending
    pub fn unique_labels(&self) -> Result<Vec<u64>> {
        dispatch_label!(self, a => {
            let mut ids: Vec<u64> = a
                .iter()
                .filter(|v| !v.is_zero())
                .map(|&v| Into::<u64>::into(v))
                .collect();
            ids.sort_unstable();
            ids.dedup();
            Ok(ids)
        })
    }
}

fn label_positions<T: Label>(data: ArrayView4<'_, T>, id: u64) -> Vec<[u64; 3]> {
    if id == 0 || data.shape()[0] == 0 {
        return Vec::new();
    }
    data.index_axis(Axis(0), 0)
        .indexed_iter()
        .filter(|(_, &v)| Into::<u64>::into(v) == id)
        .map(|((z, y, x), _)| [x as u64, y as u64, z as u64])
        .collect()
}

fn filter_labels<T: Label>(data: &mut Array4<T>, ids: &[u64]) {
    data.mapv_inplace(|v| {
        let id: u64 = v.into();
        if ids.contains(&id) {
            v
        } else {
            T::default()
        }
    });
}

fn remap_labels<T: Label>(data: &mut Array4<T>, id: u64) -> Result<()> {
    let target = T::from_id(id)?;
    data.mapv_inplace(|v| if v.is_zero() { v } else { target });
    Ok(())
}

fn erase_label<T: Label>(data: &mut Array4<T>, id: u64) {
    data.mapv_inplace(|v| {
        if Into::<u64>::into(v) == id {
            T::default()
        } else {
            v
        }
    });
}

/// One cuboid of a channel
#[derive(Debug, Clone, PartialEq)]
pub struct Cuboid {
    kind: ChannelKind,
    data: CuboidData,
    time_start: u64,
    synthetic: bool,
}

impl Cuboid {
    /// Create a zero-filled cuboid for a channel.
    ///
    /// `dims` is `[x, y, z]`; `time_range` is half open. Annotation channels
    /// carry only `U32`/`U64` labels.
    pub fn new(
        kind: ChannelKind,
        data_type: DataType,
        dims: [u64; 3],
        time_range: [u64; 2],
    ) -> Result<Self> {
        check_kind(kind, data_type)?;
        if time_range[1] <= time_range[0] {
            return Err(SpatialDbError::InvalidDimensions(format!(
                "empty time range {:?}",
                time_range
            )));
        }
        let t = (time_range[1] - time_range[0]) as usize;
        let shape = [t, dims[2] as usize, dims[1] as usize, dims[0] as usize];
        Ok(Self {
            kind,
            data: CuboidData::zeros(data_type, shape),
            time_start: time_range[0],
            synthetic: false,
        })
    }

    /// Wrap an existing payload
    pub fn from_data(kind: ChannelKind, data: CuboidData, time_start: u64) -> Result<Self> {
        check_kind(kind, data.data_type())?;
        Ok(Self {
            kind,
            data,
            time_start,
            synthetic: false,
        })
    }

    /// Reset to all zeros and mark as synthesized rather than loaded
    pub fn zeros(&mut self) {
        self.data = CuboidData::zeros(self.data.data_type(), self.data.shape());
        self.synthetic = true;
    }

    /// True when the cuboid was synthesized from zeros and never persisted
    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn data_type(&self) -> DataType {
        self.data.data_type()
    }

    pub fn data(&self) -> &CuboidData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut CuboidData {
        &mut self.data
    }

    pub fn into_data(self) -> CuboidData {
        self.data
    }

    pub fn time_start(&self) -> u64 {
        self.time_start
    }

    pub fn time_len(&self) -> usize {
        self.data.shape()[0]
    }

    /// Spatial extent `[x, y, z]`
    pub fn dims(&self) -> [u64; 3] {
        self.data.dims()
    }

    /// Replace the payload; type and shape must match
    pub fn set_data(&mut self, data: CuboidData) -> Result<()> {
        if data.data_type() != self.data.data_type() {
            return Err(mismatch(self.data.data_type(), data.data_type()));
        }
        self.data.check_same_shape(&data)?;
        self.data = data;
        self.synthetic = false;
        Ok(())
    }

    pub fn overwrite(&mut self, other: &CuboidData) -> Result<()> {
        self.data.overwrite(other)
    }

    pub fn preserve(&mut self, other: &CuboidData) -> Result<()> {
        self.data.preserve(other)
    }

    /// Place `other` at voxel `origin`, stamped at absolute time `timestamp`
    pub fn add_data(&mut self, other: &CuboidData, timestamp: u64, origin: [u64; 3]) -> Result<()> {
        let t = timestamp.checked_sub(self.time_start).ok_or_else(|| {
            SpatialDbError::OutOfBounds(format!(
                "timestamp {} precedes cuboid start {}",
                timestamp, self.time_start
            ))
        })?;
        self.data.paste(other, origin, t as usize)
    }

    /// Crop in place to `origin .. origin + size`
    pub fn trim(&mut self, origin: [u64; 3], size: [u64; 3]) -> Result<()> {
        if origin == [0; 3] && size == self.dims() {
            return Ok(());
        }
        self.data = self.data.region(origin, size)?;
        Ok(())
    }

    pub fn label_at(&self, timestamp: u64, voxel: [u64; 3]) -> Result<u64> {
        let t = timestamp.saturating_sub(self.time_start) as usize;
        self.data.label_at(t, voxel)
    }

    pub fn is_not_zeros(&self) -> bool {
        self.data.is_not_zeros()
    }
}

fn check_kind(kind: ChannelKind, data_type: DataType) -> Result<()> {
    if kind.is_annotation() && !data_type.is_label() {
        return Err(SpatialDbError::Configuration(format!(
            "annotation channels cannot hold {} data",
            data_type
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label_cube(dims: [u64; 3]) -> Cuboid {
        Cuboid::new(ChannelKind::Annotation, DataType::U32, dims, [0, 1]).unwrap()
    }

    fn set(c: &mut Cuboid, v: [usize; 3], id: u32) {
        if let CuboidData::U32(a) = c.data_mut() {
            a[[0, v[2], v[1], v[0]]] = id;
        }
    }

    #[test]
    fn test_factory_kinds() {
        assert!(Cuboid::new(ChannelKind::Annotation, DataType::U64, [4, 4, 4], [0, 1]).is_ok());
        assert!(matches!(
            Cuboid::new(ChannelKind::Annotation, DataType::U8, [4, 4, 4], [0, 1]),
            Err(SpatialDbError::Configuration(_))
        ));
        let ts = Cuboid::new(ChannelKind::TimeSeries, DataType::U16, [4, 4, 2], [3, 7]).unwrap();
        assert_eq!(ts.data().shape(), [4, 2, 4, 4]);
        assert_eq!(ts.time_start(), 3);
        let mask = Cuboid::new(ChannelKind::Image, DataType::U1, [8, 8, 1], [0, 1]).unwrap();
        assert_eq!(mask.data_type(), DataType::U1);
    }

    #[test]
    fn test_zeros_marks_synthetic() {
        let mut c = label_cube([4, 4, 4]);
        assert!(!c.is_synthetic());
        set(&mut c, [1, 1, 1], 9);
        c.zeros();
        assert!(c.is_synthetic());
        assert!(!c.is_not_zeros());
    }

    #[test]
    fn test_overwrite_vs_preserve() {
        let mut base = label_cube([4, 4, 4]);
        set(&mut base, [1, 2, 3], 5);
        let mut write = label_cube([4, 4, 4]);
        set(&mut write, [1, 2, 3], 7);
        set(&mut write, [0, 0, 0], 7);

        let mut over = base.clone();
        over.overwrite(write.data()).unwrap();
        assert_eq!(over.label_at(0, [1, 2, 3]).unwrap(), 7);
        assert_eq!(over.label_at(0, [0, 0, 0]).unwrap(), 7);

        let mut pres = base.clone();
        pres.preserve(write.data()).unwrap();
        assert_eq!(pres.label_at(0, [1, 2, 3]).unwrap(), 5);
        assert_eq!(pres.label_at(0, [0, 0, 0]).unwrap(), 7);
    }

    #[test]
    fn test_overwrite_type_mismatch() {
        let mut base = label_cube([4, 4, 4]);
        let other = CuboidData::zeros(DataType::U8, [1, 4, 4, 4]);
        assert!(matches!(
            base.overwrite(&other),
            Err(SpatialDbError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_region_and_paste() {
        let mut small = label_cube([2, 2, 2]);
        set(&mut small, [1, 1, 1], 3);
        let mut big = label_cube([8, 8, 8]);
        big.add_data(small.data(), 0, [4, 2, 6]).unwrap();
        assert_eq!(big.label_at(0, [5, 3, 7]).unwrap(), 3);

        let back = big.data().region([4, 2, 6], [2, 2, 2]).unwrap();
        assert_eq!(&back, small.data());

        assert!(big.add_data(small.data(), 0, [7, 0, 0]).is_err());
        assert!(big.data().region([0, 0, 0], [9, 1, 1]).is_err());
    }

    #[test]
    fn test_box_near_u64_max_is_out_of_bounds() {
        let mut big = label_cube([8, 8, 8]);
        let small = label_cube([2, 2, 2]);
        assert!(matches!(
            big.data().region([u64::MAX - 1, 0, 0], [4, 1, 1]),
            Err(SpatialDbError::OutOfBounds(_))
        ));
        assert!(matches!(
            big.add_data(small.data(), 0, [0, 0, u64::MAX - 1]),
            Err(SpatialDbError::OutOfBounds(_))
        ));
        assert!(matches!(
            big.trim([0, u64::MAX - 1, 0], [1, 4, 1]),
            Err(SpatialDbError::OutOfBounds(_))
        ));
    }

    #[test]
    fn test_trim() {
        let mut c = label_cube([8, 8, 8]);
        set(&mut c, [3, 4, 5], 11);
        c.trim([2, 2, 2], [4, 4, 4]).unwrap();
        assert_eq!(c.dims(), [4, 4, 4]);
        assert_eq!(c.label_at(0, [1, 2, 3]).unwrap(), 11);
    }

    #[test]
    fn test_filter_remap_erase() {
        let mut c = label_cube([4, 4, 1]);
        set(&mut c, [0, 0, 0], 1);
        set(&mut c, [1, 0, 0], 2);
        set(&mut c, [2, 0, 0], 3);

        let mut f = c.clone();
        f.data_mut().filter_ids(&[2, 3]).unwrap();
        assert_eq!(f.data().unique_labels().unwrap(), vec![2, 3]);

        f.data_mut().remap(9).unwrap();
        assert_eq!(f.data().unique_labels().unwrap(), vec![9]);

        c.data_mut().erase_id(2).unwrap();
        assert_eq!(c.data().unique_labels().unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_locations_and_extent() {
        let mut c = label_cube([4, 4, 4]);
        set(&mut c, [1, 2, 3], 4);
        set(&mut c, [3, 0, 1], 4);
        let mut locs = c.data().locations_of(4).unwrap();
        locs.sort();
        assert_eq!(locs, vec![[1, 2, 3], [3, 0, 1]]);
        assert_eq!(
            c.data().extent_of(4).unwrap(),
            Some(([1, 0, 1], [3, 2, 3]))
        );
        assert_eq!(c.data().extent_of(5).unwrap(), None);
    }

    #[test]
    fn test_from_labels_range_check() {
        let mut vol = Array3::<u64>::zeros((1, 2, 2));
        vol[[0, 1, 1]] = 42;
        let data = CuboidData::from_labels(DataType::U32, &vol).unwrap();
        assert_eq!(data.shape(), [1, 1, 2, 2]);
        assert_eq!(data.label_at(0, [1, 1, 0]).unwrap(), 42);

        vol[[0, 0, 0]] = u64::from(u32::MAX) + 1;
        assert!(CuboidData::from_labels(DataType::U32, &vol).is_err());
        assert!(CuboidData::from_labels(DataType::U64, &vol).is_ok());
        assert!(CuboidData::from_labels(DataType::F32, &vol).is_err());
    }

    #[test]
    fn test_label_ops_reject_intensity() {
        let mut img = CuboidData::zeros(DataType::U8, [1, 2, 2, 2]);
        assert!(matches!(
            img.remap(3),
            Err(SpatialDbError::TypeMismatch { .. })
        ));
    }
}
