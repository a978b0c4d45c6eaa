//! In-memory block storage backend.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use tracing::debug;
use weft_types::ContentId;

use crate::error::StoreError;
use crate::traits::{BlockStore, StorageCapacity, check_content};

/// In-memory block store backed by a `RwLock<HashMap>`.
///
/// Used by tests and by nodes started with `--memory`. Tracks total bytes
/// stored against a configurable maximum.
pub struct MemoryStore {
    blocks: RwLock<HashMap<ContentId, Bytes>>,
    max_bytes: u64,
}

impl MemoryStore {
    /// Create a new in-memory store with the given capacity limit.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
            max_bytes,
        }
    }

    /// Create a store with no practical capacity limit.
    pub fn unbounded() -> Self {
        Self::new(u64::MAX)
    }

    // Every critical section is a single map call, so a poisoned map is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<ContentId, Bytes>> {
        self.blocks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ContentId, Bytes>> {
        self.blocks.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Overwrite a block without any checks (for corruption tests).
    #[cfg(test)]
    pub(crate) fn inject(&self, id: ContentId, data: &'static [u8]) {
        self.write().insert(id, Bytes::from_static(data));
    }

    fn used_bytes_unlocked(map: &HashMap<ContentId, Bytes>) -> u64 {
        map.values().map(|v| v.len() as u64).sum()
    }
}

#[async_trait::async_trait]
impl BlockStore for MemoryStore {
    async fn put(&self, id: ContentId, data: Bytes) -> Result<bool, StoreError> {
        check_content(id, &data)?;

        let mut map = self.write();
        if map.contains_key(&id) {
            return Ok(false);
        }

        let used = Self::used_bytes_unlocked(&map);
        let needed = data.len() as u64;
        if used.saturating_add(needed) > self.max_bytes {
            return Err(StoreError::CapacityExceeded {
                needed,
                available: self.max_bytes.saturating_sub(used),
            });
        }

        debug!(%id, size = data.len(), "storing block in memory");
        map.insert(id, data);
        Ok(true)
    }

    async fn get(&self, id: ContentId) -> Result<Option<Bytes>, StoreError> {
        Ok(self.read().get(&id).cloned())
    }

    async fn delete(&self, id: ContentId) -> Result<(), StoreError> {
        self.write().remove(&id);
        debug!(%id, "deleted block from memory");
        Ok(())
    }

    async fn contains(&self, id: ContentId) -> Result<bool, StoreError> {
        Ok(self.read().contains_key(&id))
    }

    async fn list(&self) -> Result<Vec<ContentId>, StoreError> {
        Ok(self.read().keys().copied().collect())
    }

    async fn capacity(&self) -> Result<StorageCapacity, StoreError> {
        let map = self.read();
        let used = Self::used_bytes_unlocked(&map);
        Ok(StorageCapacity {
            total_bytes: self.max_bytes,
            used_bytes: used,
            available_bytes: self.max_bytes.saturating_sub(used),
        })
    }

    async fn verify(&self, id: ContentId) -> Result<bool, StoreError> {
        match self.read().get(&id) {
            Some(data) => Ok(ContentId::from_data(data) == id),
            None => Err(StoreError::NotFound(id)),
        }
    }
}
