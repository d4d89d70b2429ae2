//! Pluggable storage backends.
//!
//! Shard files and repository blobs go through the [`Storage`] trait so the
//! same snapshot code runs over a local directory, an in-memory map for
//! tests, or any other byte store.

pub mod file;
pub mod memory;
pub mod traits;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use traits::{Storage, StorageError, StorageInput, StorageOutput};
