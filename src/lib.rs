//! SpatialDB - Morton-indexed cuboid storage
//!
//! A storage engine for large multi-resolution volumetric datasets, such as
//! electron-microscopy image stacks and the neuron annotations drawn on them.
//!
//! # Features
//!
//! - Fixed-size cuboids addressed by Morton (Z-order) index, resolution and timestamp
//! - Typed dense payloads (U8/U16/U32/U64/F32 and bit masks) with zstd or deflate compression
//! - Read-through cache tier in front of a durable tier of super-cuboids
//! - Entity to cuboid spatial index and per-entity exception lists
//! - Cross-process readers-writer lock and LRU eviction with hysteresis
//! - Async I/O throughout
//!
//! # Backends
//!
//! Every store is an async trait in [`io`]. The [`backend`] module ships
//! in-process and filesystem implementations; production deployments
//! implement the traits over their own key-value, object and relational
//! services.
//!
//! # Example
//!
//! ```rust,ignore
//! use spatialdb::{Channel, ConflictPolicy, CutoutOptions, DatasetLayout, EngineConfig, SpatialDb, StorageBackends};
//!
//! # async fn example() -> spatialdb::Result<()> {
//! let layout = DatasetLayout::new([1024, 1024, 64], [128, 128, 16], 4)?;
//! let db = SpatialDb::new(&EngineConfig::new("kasthuri11"), layout, StorageBackends::in_memory(1 << 30))?;
//!
//! let neurons = Channel::annotation("neurons")?;
//! db.annotate(&neurons, 42, 0, 0, &[[10, 20, 3], [11, 20, 3]], ConflictPolicy::Preserve).await?;
//! let cube = db.cutout(&neurons, [0, 0, 0], [64, 64, 4], 0, &CutoutOptions::default()).await?;
//! let voxels = db.get_locations(&neurons, 42, 0, 0).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache_index;
pub mod compression;
pub mod config;
pub mod coordinator;
pub mod cuboid;
pub mod durable;
pub mod error;
pub mod eviction;
pub mod exceptions;
pub mod io;
pub mod keys;
pub mod layout;
pub mod lock;
pub mod morton;
pub mod spatial_index;
pub mod spatialdb;
pub mod types;
pub mod utils;

// Re-exports
pub use backend::{FileSystemObjectStore, MemoryCacheStore, MemoryObjectStore, MemoryRowStore};
pub use cache_index::CacheIndex;
pub use compression::{CompressionMethod, CompressionSettings, Compressor};
pub use config::{EngineConfig, EvictionConfig};
pub use coordinator::{CacheCoordinator, CuboidBatch};
pub use cuboid::{Cuboid, CuboidData, ExceptionMap};
pub use durable::DurableStore;
pub use error::{Result, SpatialDbError};
pub use eviction::{EvictionManager, EvictionReport};
pub use exceptions::{ExceptionKey, ExceptionTracker};
pub use io::{
    create_object_store, CoordinationStore, IndexStore, KeyValueStore, MemoryStats, ObjectStore,
    RowStore, StorageBackend, Transaction,
};
pub use keys::{CuboidKey, SuperCuboidKey};
pub use layout::{CuboidRange, DatasetLayout, ResolutionLevel};
pub use lock::{ReadGuard, ReaderWriterLock, WriteGuard};
pub use spatial_index::SpatialIndex;
pub use spatialdb::{CutoutOptions, SpatialDb, StorageBackends};
pub use types::{Channel, ChannelKind, ConflictPolicy, DataType};

/// Version of the SpatialDB implementation
pub const SPATIALDB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Magic number opening every cuboid blob
pub const CUBOID_MAGIC: &[u8; 4] = b"NDCB";
