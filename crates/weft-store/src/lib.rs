//! Content-addressed block storage.
//!
//! This crate defines the [`BlockStore`] trait for persisting immutable blocks
//! keyed by the BLAKE3 hash of their content, along with two backends:
//!
//! - [`MemoryStore`]: in-memory storage backed by a `RwLock<HashMap>`.
//! - [`FileStore`]: file-based storage with a 2-level fan-out directory layout.
//!
//! Because a block's identity is derived from its bytes, writing the same block
//! twice is a no-op: the first writer wins and later identical writers return
//! `Ok(false)`.

mod error;
mod file_store;
mod memory_store;
mod traits;

pub use error::StoreError;
pub use file_store::FileStore;
pub use memory_store::MemoryStore;
pub use traits::{BlockStore, StorageCapacity};
