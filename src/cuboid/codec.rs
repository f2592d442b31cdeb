//! Cuboid wire format
//!
//! ```text
//! "NDCB" | version u8 | method u8 | compressed bincode(CuboidPayload)
//! ```
//!
//! The payload carries the element type, the `(t, z, y, x)` shape and the raw
//! little-endian element bytes. Masks are bit-packed, most significant bit
//! first. Decoding validates every field, so a blob either reproduces the
//! exact array that was written or fails with `CorruptPayload`.

use super::{Cuboid, CuboidData, Element};
use crate::compression::{self, CompressionSettings};
use crate::error::{Result, SpatialDbError};
use crate::types::DataType;
use crate::CUBOID_MAGIC;
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Current blob format version
pub const FORMAT_VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CuboidPayload {
    data_type: u8,
    shape: [u32; 4],
    bytes: Vec<u8>,
}

fn encode_elements<T: Element>(data: &Array4<T>) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * T::WIDTH);
    for v in data.iter() {
        v.write_le(&mut out);
    }
    out
}

fn decode_elements<T: Element>(shape: [usize; 4], bytes: &[u8]) -> Result<Array4<T>> {
    let count: usize = shape.iter().product();
    if bytes.len() != count * T::WIDTH {
        return Err(SpatialDbError::CorruptPayload(format!(
            "{} bytes for {} {} elements",
            bytes.len(),
            count,
            T::DATA_TYPE
        )));
    }
    let values: Vec<T> = bytes.chunks_exact(T::WIDTH).map(T::read_le).collect();
    Array4::from_shape_vec((shape[0], shape[1], shape[2], shape[3]), values)
        .map_err(|e| SpatialDbError::CorruptPayload(e.to_string()))
}

fn pack_bits(data: &Array4<bool>) -> Vec<u8> {
    let mut out = vec![0u8; (data.len() + 7) / 8];
    for (i, &bit) in data.iter().enumerate() {
        if bit {
            out[i / 8] |= 0x80 >> (i % 8);
        }
    }
    out
}

fn unpack_bits(shape: [usize; 4], bytes: &[u8]) -> Result<Array4<bool>> {
    let count: usize = shape.iter().product();
    if bytes.len() != (count + 7) / 8 {
        return Err(SpatialDbError::CorruptPayload(format!(
            "{} bytes for {} mask bits",
            bytes.len(),
            count
        )));
    }
    let values: Vec<bool> = (0..count)
        .map(|i| bytes[i / 8] & (0x80 >> (i % 8)) != 0)
        .collect();
    Array4::from_shape_vec((shape[0], shape[1], shape[2], shape[3]), values)
        .map_err(|e| SpatialDbError::CorruptPayload(e.to_string()))
}

impl CuboidData {
    /// Serialize and compress the payload
    pub fn to_compressed(&self, settings: &CompressionSettings) -> Result<Vec<u8>> {
        let sh = self.shape();
        let mut shape = [0u32; 4];
        for (dst, &src) in shape.iter_mut().zip(sh.iter()) {
            *dst = u32::try_from(src).map_err(|_| {
                SpatialDbError::SerializationFailure(format!("axis length {} too large", src))
            })?;
        }
        let bytes = match self {
            CuboidData::Mask(a) => pack_bits(a),
            CuboidData::U8(a) => encode_elements(a),
            CuboidData::U16(a) => encode_elements(a),
            CuboidData::U32(a) => encode_elements(a),
            CuboidData::U64(a) => encode_elements(a),
            CuboidData::F32(a) => encode_elements(a),
        };
        let payload = CuboidPayload {
            data_type: self.data_type() as u8,
            shape,
            bytes,
        };
        let body = settings.pack(&payload).map_err(|e| {
            error!(error = %e, "cuboid serialization failed");
            e
        })?;

        let mut blob = Vec::with_capacity(body.len() + CUBOID_MAGIC.len() + 1);
        blob.extend_from_slice(CUBOID_MAGIC);
        blob.push(FORMAT_VERSION);
        blob.extend_from_slice(&body);
        Ok(blob)
    }

    /// Decompress and deserialize a blob written by [`CuboidData::to_compressed`]
    pub fn from_compressed(blob: &[u8]) -> Result<CuboidData> {
        decode_blob(blob).map_err(|e| {
            error!(error = %e, len = blob.len(), "cuboid payload failed data integrity check");
            match e {
                SpatialDbError::CorruptPayload(_) => e,
                other => SpatialDbError::CorruptPayload(other.to_string()),
            }
        })
    }
}

fn decode_blob(blob: &[u8]) -> Result<CuboidData> {
    let header = CUBOID_MAGIC.len() + 1;
    if blob.len() < header || &blob[..CUBOID_MAGIC.len()] != CUBOID_MAGIC {
        return Err(SpatialDbError::CorruptPayload("missing cuboid magic".into()));
    }
    let version = blob[CUBOID_MAGIC.len()];
    if version != FORMAT_VERSION {
        return Err(SpatialDbError::CorruptPayload(format!(
            "unsupported cuboid format version {}",
            version
        )));
    }

    let payload: CuboidPayload = compression::unpack(&blob[header..])?;
    let data_type = DataType::from_u8(payload.data_type).ok_or_else(|| {
        SpatialDbError::CorruptPayload(format!("unknown data type {}", payload.data_type))
    })?;
    let shape = payload.shape.map(|v| v as usize);
    let bytes = &payload.bytes;

    Ok(match data_type {
        DataType::U1 => CuboidData::Mask(unpack_bits(shape, bytes)?),
        DataType::U8 => CuboidData::U8(decode_elements(shape, bytes)?),
        DataType::U16 => CuboidData::U16(decode_elements(shape, bytes)?),
        DataType::U32 => CuboidData::U32(decode_elements(shape, bytes)?),
        DataType::U64 => CuboidData::U64(decode_elements(shape, bytes)?),
        DataType::F32 => CuboidData::F32(decode_elements(shape, bytes)?),
    })
}

impl Cuboid {
    pub fn to_compressed(&self, settings: &CompressionSettings) -> Result<Vec<u8>> {
        self.data.to_compressed(settings)
    }

    /// Load the payload from a blob; its type and shape must match this cuboid
    pub fn from_compressed(&mut self, blob: &[u8]) -> Result<()> {
        let data = CuboidData::from_compressed(blob)?;
        self.set_data(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionMethod;
    use crate::types::ChannelKind;

    fn sample(dt: DataType) -> CuboidData {
        let mut data = CuboidData::zeros(dt, [2, 3, 4, 5]);
        match &mut data {
            CuboidData::U8(a) => a.iter_mut().enumerate().for_each(|(i, v)| *v = i as u8),
            CuboidData::U16(a) => a.iter_mut().enumerate().for_each(|(i, v)| *v = (i * 300) as u16),
            CuboidData::U32(a) => a.iter_mut().enumerate().for_each(|(i, v)| *v = (i as u32) << 20),
            CuboidData::U64(a) => a.iter_mut().enumerate().for_each(|(i, v)| *v = (i as u64) << 40),
            CuboidData::F32(a) => a.iter_mut().enumerate().for_each(|(i, v)| *v = i as f32 * 0.5),
            CuboidData::Mask(a) => a.iter_mut().enumerate().for_each(|(i, v)| *v = i % 3 == 0),
        }
        data
    }

    #[test]
    fn test_every_type_round_trips_exactly() {
        let settings = CompressionSettings::default();
        for dt in [
            DataType::U1,
            DataType::U8,
            DataType::U16,
            DataType::U32,
            DataType::U64,
            DataType::F32,
        ] {
            let data = sample(dt);
            let blob = data.to_compressed(&settings).unwrap();
            assert_eq!(&blob[..4], CUBOID_MAGIC);
            assert_eq!(CuboidData::from_compressed(&blob).unwrap(), data, "{:?}", dt);
        }
    }

    #[test]
    fn test_mask_is_bit_packed() {
        let data = CuboidData::zeros(DataType::U1, [1, 8, 8, 8]);
        let settings = CompressionSettings::new(CompressionMethod::None, 0);
        let blob = data.to_compressed(&settings).unwrap();
        // 512 bits pack into 64 bytes plus framing
        assert!(blob.len() < 512);
    }

    #[test]
    fn test_corrupt_blobs() {
        let settings = CompressionSettings::default();
        let blob = sample(DataType::U32).to_compressed(&settings).unwrap();

        let mut bad_magic = blob.clone();
        bad_magic[0] = b'X';
        assert!(matches!(
            CuboidData::from_compressed(&bad_magic),
            Err(SpatialDbError::CorruptPayload(_))
        ));

        let truncated = &blob[..blob.len() / 2];
        assert!(matches!(
            CuboidData::from_compressed(truncated),
            Err(SpatialDbError::CorruptPayload(_))
        ));

        let mut bad_version = blob.clone();
        bad_version[4] = 99;
        assert!(CuboidData::from_compressed(&bad_version).is_err());
    }

    #[test]
    fn test_length_mismatch_detected() {
        let payload = CuboidPayload {
            data_type: DataType::U32 as u8,
            shape: [1, 2, 2, 2],
            bytes: vec![0; 7],
        };
        let mut blob = CUBOID_MAGIC.to_vec();
        blob.push(FORMAT_VERSION);
        blob.extend(CompressionSettings::default().pack(&payload).unwrap());
        assert!(matches!(
            CuboidData::from_compressed(&blob),
            Err(SpatialDbError::CorruptPayload(_))
        ));
    }

    #[test]
    fn test_cuboid_from_compressed_checks_type() {
        let settings = CompressionSettings::default();
        let blob = CuboidData::zeros(DataType::U64, [1, 4, 4, 4])
            .to_compressed(&settings)
            .unwrap();
        let mut c = Cuboid::new(ChannelKind::Annotation, DataType::U32, [4, 4, 4], [0, 1]).unwrap();
        assert!(matches!(
            c.from_compressed(&blob),
            Err(SpatialDbError::TypeMismatch { .. })
        ));

        let mut c64 = Cuboid::new(ChannelKind::Annotation, DataType::U64, [4, 4, 4], [0, 1]).unwrap();
        c64.from_compressed(&blob).unwrap();
        assert!(!c64.is_synthetic());
    }
}
