//! Built-in backend implementations
//!
//! The in-memory stores implement the full contracts of [`crate::io`] and
//! are what the test suite runs against. [`FileSystemObjectStore`] persists
//! super-cuboids on local disk.

mod filesystem;
mod memory;

pub use filesystem::FileSystemObjectStore;
pub use memory::{MemoryCacheStore, MemoryObjectStore, MemoryRowStore};
