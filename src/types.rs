//! Core data types for the spatial database

use crate::error::{Result, SpatialDbError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Voxel element types a cuboid payload can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    /// 1-bit boolean mask, bit-packed on the wire
    U1 = 0,
    /// Unsigned 8-bit integer
    U8 = 1,
    /// Unsigned 16-bit integer
    U16 = 2,
    /// Unsigned 32-bit integer
    U32 = 3,
    /// Unsigned 64-bit integer
    U64 = 4,
    /// 32-bit floating point
    F32 = 9,
}

impl DataType {
    /// Size in bytes of one element in memory
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::U1 => 1, // Stored as full bytes in memory
            DataType::U8 => 1,
            DataType::U16 => 2,
            DataType::U32 | DataType::F32 => 4,
            DataType::U64 => 8,
        }
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32)
    }

    /// Whether values of this type can be used as entity labels
    pub fn is_label(&self) -> bool {
        matches!(self, DataType::U32 | DataType::U64)
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DataType::U1),
            1 => Some(DataType::U8),
            2 => Some(DataType::U16),
            3 => Some(DataType::U32),
            4 => Some(DataType::U64),
            9 => Some(DataType::F32),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Semantic kind of a channel, which decides the cuboid capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Entity labels; supports annotate/shave/exceptions
    Annotation,
    /// Intensity data with a time axis
    TimeSeries,
    /// Intensity data at a single timestamp
    Image,
}

impl ChannelKind {
    pub fn is_annotation(&self) -> bool {
        matches!(self, ChannelKind::Annotation)
    }
}

/// How a write treats voxels that already carry a nonzero label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Replace existing labels unconditionally
    #[default]
    Overwrite,
    /// First writer wins; conflicting voxels are reported back
    Preserve,
    /// Keep the existing label and record an exception for the new one
    Exception,
}

/// Description of one channel of a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Channel name, used in keys and table names
    pub name: String,
    pub kind: ChannelKind,
    pub data_type: DataType,
    /// Resolution at which the channel data is authoritative
    pub resolution: u32,
    /// Whether conflicting annotations are tracked as exceptions
    pub exceptions: bool,
    /// Whether the channel has been propagated to coarser resolutions
    pub propagated: bool,
}

impl Channel {
    /// Create a new channel description
    pub fn new(name: impl Into<String>, kind: ChannelKind, data_type: DataType) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name,
            kind,
            data_type,
            resolution: 0,
            exceptions: false,
            propagated: false,
        })
    }

    /// Annotation channel with 32-bit labels and exceptions enabled
    pub fn annotation(name: impl Into<String>) -> Result<Self> {
        Ok(Self::new(name, ChannelKind::Annotation, DataType::U32)?.with_exceptions(true))
    }

    pub fn time_series(name: impl Into<String>, data_type: DataType) -> Result<Self> {
        Self::new(name, ChannelKind::TimeSeries, data_type)
    }

    pub fn image(name: impl Into<String>, data_type: DataType) -> Result<Self> {
        Self::new(name, ChannelKind::Image, data_type)
    }

    /// Set the native resolution
    pub fn with_resolution(mut self, resolution: u32) -> Self {
        self.resolution = resolution;
        self
    }

    /// Enable or disable exception tracking
    pub fn with_exceptions(mut self, exceptions: bool) -> Self {
        self.exceptions = exceptions;
        self
    }

    /// Mark the channel as propagated
    pub fn with_propagated(mut self, propagated: bool) -> Self {
        self.propagated = propagated;
        self
    }
}

/// Names end up inside `&`-separated keys, so the separator is forbidden.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SpatialDbError::Configuration("name must not be empty".into()));
    }
    if name.contains('&') || name.contains('/') {
        return Err(SpatialDbError::Configuration(format!(
            "name {:?} contains a reserved separator",
            name
        )));
    }
    Ok(())
}
