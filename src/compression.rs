//! Compression and self-describing blob packing for persisted payloads
//!
//! Every blob the engine writes (cuboids, index entries, exception lists)
//! starts with one byte naming its [`CompressionMethod`], followed by the
//! compressed bincode body. Readers therefore never need to know which codec
//! a writer was configured with.

use crate::error::{Result, SpatialDbError};
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression as FlateCompression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Compression methods supported for stored blobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CompressionMethod {
    /// No compression
    None = 0,
    /// Deflate/ZIP compression
    Deflate = 1,
    /// Zstandard compression
    Zstd = 3,
}

impl CompressionMethod {
    /// Get the method from a byte value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionMethod::None),
            1 => Some(CompressionMethod::Deflate),
            3 => Some(CompressionMethod::Zstd),
            _ => None,
        }
    }
}

/// Compression level (0-9, where 0 is no compression and 9 is maximum)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    pub fn new(level: u8) -> Self {
        Self(level.min(9))
    }

    pub fn fast() -> Self {
        Self(1)
    }

    pub fn best() -> Self {
        Self(9)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(6)
    }
}

/// Trait for compression/decompression operations
pub trait Compressor: Send + Sync {
    /// Compress data
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, data: &[u8], expected_size: Option<usize>) -> Result<Vec<u8>>;

    /// Get the compression method
    fn method(&self) -> CompressionMethod;
}

/// No compression
#[derive(Debug, Default)]
pub struct NoneCompressor;

impl Compressor for NoneCompressor {
    fn compress(&self, data: &[u8], _level: CompressionLevel) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], _expected_size: Option<usize>) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::None
    }
}

/// Deflate compression
#[derive(Debug, Default)]
pub struct DeflateCompressor;

impl Compressor for DeflateCompressor {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(data, FlateCompression::new(level.value() as u32));
        let mut compressed = Vec::new();
        encoder
            .read_to_end(&mut compressed)
            .map_err(|e| SpatialDbError::SerializationFailure(e.to_string()))?;
        Ok(compressed)
    }

    fn decompress(&self, data: &[u8], expected_size: Option<usize>) -> Result<Vec<u8>> {
        let mut decoder = DeflateDecoder::new(data);
        let mut decompressed = match expected_size {
            Some(size) => Vec::with_capacity(size),
            None => Vec::new(),
        };
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| SpatialDbError::CorruptPayload(e.to_string()))?;
        Ok(decompressed)
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Deflate
    }
}

/// Zstandard compression
#[derive(Debug, Default)]
pub struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        zstd::encode_all(data, level.value() as i32)
            .map_err(|e| SpatialDbError::SerializationFailure(e.to_string()))
    }

    fn decompress(&self, data: &[u8], _expected_size: Option<usize>) -> Result<Vec<u8>> {
        zstd::decode_all(data).map_err(|e| SpatialDbError::CorruptPayload(e.to_string()))
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zstd
    }
}

/// Get a compressor for a given method
pub fn get_compressor(method: CompressionMethod) -> Box<dyn Compressor> {
    match method {
        CompressionMethod::None => Box::new(NoneCompressor),
        CompressionMethod::Deflate => Box::new(DeflateCompressor),
        CompressionMethod::Zstd => Box::new(ZstdCompressor),
    }
}

/// Codec choice for blobs written by this engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionSettings {
    pub method: CompressionMethod,
    pub level: u8,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            method: CompressionMethod::Zstd,
            level: CompressionLevel::default().value(),
        }
    }
}

impl CompressionSettings {
    pub fn new(method: CompressionMethod, level: u8) -> Self {
        Self {
            method,
            level: CompressionLevel::new(level).value(),
        }
    }

    /// Compress raw bytes, prefixing the method byte
    pub fn compress(&self, raw: &[u8]) -> Result<Vec<u8>> {
        let body = get_compressor(self.method).compress(raw, CompressionLevel::new(self.level))?;
        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(self.method as u8);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Serialize `value` with bincode and compress it
    pub fn pack<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        let raw = bincode::serialize(value)?;
        self.compress(&raw)
    }
}

/// Strip the method byte and decompress
pub fn decompress(blob: &[u8]) -> Result<Vec<u8>> {
    let (&tag, body) = blob
        .split_first()
        .ok_or_else(|| SpatialDbError::CorruptPayload("empty blob".into()))?;
    let method = CompressionMethod::from_u8(tag).ok_or_else(|| {
        SpatialDbError::CorruptPayload(format!("unknown compression method {}", tag))
    })?;
    get_compressor(method).decompress(body, None)
}

/// Inverse of [`CompressionSettings::pack`]
pub fn unpack<T: DeserializeOwned>(blob: &[u8]) -> Result<T> {
    let raw = decompress(blob)?;
    bincode::deserialize(&raw).map_err(|e| SpatialDbError::CorruptPayload(e.to_string()))
}
