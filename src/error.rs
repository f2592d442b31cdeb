//! Error types for spatial database operations

use thiserror::Error;

/// Main error type for cuboid storage operations
#[derive(Error, Debug)]
pub enum SpatialDbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("Corrupt payload: {0}")]
    CorruptPayload(String),

    #[error("Serialization failure: {0}")]
    SerializationFailure(String),

    #[error("Storage connection error: {0}")]
    StorageConnection(String),

    #[error("Cache index inconsistency: {0}")]
    CacheIndexInconsistency(String),

    #[error("Index store error: {0}")]
    IndexStore(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Lock error: {0}")]
    Lock(String),
}

impl SpatialDbError {
    /// Whether a caller may reasonably retry the failed operation.
    ///
    /// Only transport-level failures qualify. Codec, bounds and consistency
    /// errors are deterministic and will fail again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SpatialDbError::StorageConnection(_) | SpatialDbError::Lock(_)
        )
    }
}

/// Specialized Result type for spatial database operations
pub type Result<T> = std::result::Result<T, SpatialDbError>;

impl From<bincode::Error> for SpatialDbError {
    fn from(err: bincode::Error) -> Self {
        SpatialDbError::SerializationFailure(err.to_string())
    }
}

impl From<serde_json::Error> for SpatialDbError {
    fn from(err: serde_json::Error) -> Self {
        SpatialDbError::Configuration(err.to_string())
    }
}
