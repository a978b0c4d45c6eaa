//! Core trait and types for block storage.

use bytes::Bytes;
use weft_types::ContentId;

use crate::error::StoreError;

/// Capacity information for a storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageCapacity {
    /// Total capacity in bytes.
    pub total_bytes: u64,
    /// Bytes currently used.
    pub used_bytes: u64,
    /// Bytes available for new data.
    pub available_bytes: u64,
}

/// Trait for storing and retrieving content-addressed blocks.
///
/// All implementations must be `Send + Sync` for use across async tasks and
/// must tolerate concurrent reads and concurrent writes of distinct ids.
#[async_trait::async_trait]
pub trait BlockStore: Send + Sync {
    /// Store a block under its content hash.
    ///
    /// Returns `Ok(true)` if the block was written, `Ok(false)` if it was
    /// already present. Data whose hash differs from `id` is rejected.
    async fn put(&self, id: ContentId, data: Bytes) -> Result<bool, StoreError>;

    /// Retrieve a block by ID. Returns `None` if not found.
    async fn get(&self, id: ContentId) -> Result<Option<Bytes>, StoreError>;

    /// Delete a block by ID. Deleting a missing block is not an error.
    async fn delete(&self, id: ContentId) -> Result<(), StoreError>;

    /// Check whether a block exists.
    async fn contains(&self, id: ContentId) -> Result<bool, StoreError>;

    /// List all stored block IDs.
    async fn list(&self) -> Result<Vec<ContentId>, StoreError>;

    /// Report current storage capacity.
    async fn capacity(&self) -> Result<StorageCapacity, StoreError>;

    /// Verify block integrity by re-hashing and comparing to the ID.
    async fn verify(&self, id: ContentId) -> Result<bool, StoreError>;
}

/// Reject data that does not hash to `id`.
pub(crate) fn check_content(id: ContentId, data: &[u8]) -> Result<(), StoreError> {
    let actual = ContentId::from_data(data);
    if actual != id {
        return Err(StoreError::HashMismatch {
            expected: id,
            actual,
        });
    }
    Ok(())
}
