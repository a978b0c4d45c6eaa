//! File-based block storage backend.
//!
//! Stores one file per block with a 2-level fan-out directory structure:
//! `{base_dir}/{hex[0..2]}/{hex[2..4]}/{hex}`.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use rand::RngCore;
use tracing::{debug, error, warn};
use weft_types::ContentId;

use crate::error::StoreError;
use crate::traits::{BlockStore, StorageCapacity, check_content};

/// File-based block store with 2-level fan-out directory layout.
///
/// Each block is stored as a file at
/// `{base_dir}/{hex(id)[0..2]}/{hex(id)[2..4]}/{hex(id)}`.
///
/// Writes go to a uniquely named temporary file which is then hard-linked
/// into place. The link fails if the block already exists, so concurrent
/// writers of the same block never clobber each other and exactly one of
/// them observes `Ok(true)`.
pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    /// Create a new file store rooted at the given directory.
    ///
    /// The directory is created if it does not exist.
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// Root directory of the store.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Compute the full file path for a block ID.
    fn block_path(&self, id: &ContentId) -> PathBuf {
        let hex = id.to_string();
        self.base_dir.join(&hex[0..2]).join(&hex[2..4]).join(&hex)
    }
}

#[async_trait::async_trait]
impl BlockStore for FileStore {
    async fn put(&self, id: ContentId, data: Bytes) -> Result<bool, StoreError> {
        check_content(id, &data)?;

        let path = self.block_path(&id);
        if tokio::fs::try_exists(&path).await? {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let nonce = rand::thread_rng().next_u64();
        let tmp_path = path.with_extension(format!("{nonce:016x}.tmp"));
        write_tmp(&tmp_path, &data).await?;

        let linked = tokio::fs::hard_link(&tmp_path, &path).await;
        let _ = tokio::fs::remove_file(&tmp_path).await;

        match linked {
            Ok(()) => {
                debug!(%id, path = %path.display(), size = data.len(), "stored block to file");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn get(&self, id: ContentId) -> Result<Option<Bytes>, StoreError> {
        let path = self.block_path(&id);
        match tokio::fs::read(&path).await {
            Ok(data) => {
                // Verify-on-read: a corrupt block is never handed to the caller.
                let actual = ContentId::from_data(&data);
                if actual != id {
                    error!(expected = %id, %actual, "block corruption detected on read");
                    return Err(StoreError::CorruptBlock {
                        expected: id,
                        actual,
                    });
                }
                Ok(Some(Bytes::from(data)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn delete(&self, id: ContentId) -> Result<(), StoreError> {
        let path = self.block_path(&id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(%id, "deleted block file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn contains(&self, id: ContentId) -> Result<bool, StoreError> {
        Ok(tokio::fs::try_exists(self.block_path(&id)).await?)
    }

    async fn list(&self) -> Result<Vec<ContentId>, StoreError> {
        let mut ids = Vec::new();

        // Walk the 2-level fan-out: base/XX/YY/<hex>
        let mut level0 = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(d0) = level0.next_entry().await? {
            if !d0.file_type().await?.is_dir() {
                continue;
            }
            let mut level1 = tokio::fs::read_dir(d0.path()).await?;
            while let Some(d1) = level1.next_entry().await? {
                if !d1.file_type().await?.is_dir() {
                    continue;
                }
                let mut files = tokio::fs::read_dir(d1.path()).await?;
                while let Some(entry) = files.next_entry().await? {
                    if !entry.file_type().await?.is_file() {
                        continue;
                    }
                    if let Some(name) = entry.file_name().to_str()
                        && let Ok(id) = name.parse::<ContentId>()
                    {
                        ids.push(id);
                    }
                }
            }
        }
        Ok(ids)
    }

    async fn capacity(&self) -> Result<StorageCapacity, StoreError> {
        let path = self.base_dir.clone();
        tokio::task::spawn_blocking(move || statvfs(&path))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }

    async fn verify(&self, id: ContentId) -> Result<bool, StoreError> {
        let path = self.block_path(&id);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(ContentId::from_data(&data) == id),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(id)),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

/// Write `data` to `tmp_path`, removing whatever was written on failure.
async fn write_tmp(tmp_path: &Path, data: &[u8]) -> Result<(), StoreError> {
    if let Err(e) = tokio::fs::write(tmp_path, data).await {
        let _ = tokio::fs::remove_file(tmp_path).await;
        return Err(StoreError::Io(e));
    }
    Ok(())
}

/// Get filesystem capacity information using `libc::statvfs`.
#[cfg(unix)]
fn statvfs(path: &Path) -> Result<StorageCapacity, StoreError> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    // SAFETY: `c_path` is a valid null-terminated C string pointing to an existing directory.
    // `stat` is zero-initialized and passed as an out-parameter. The libc::statvfs call
    // only writes to `stat` and reads from `c_path`; both are valid for the duration of the call.
    unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
            return Err(StoreError::Io(std::io::Error::last_os_error()));
        }

        let block_size = stat.f_frsize as u64;
        let total = stat.f_blocks as u64 * block_size;
        let available = stat.f_bavail as u64 * block_size;
        let free = stat.f_bfree as u64 * block_size;
        let used = total.saturating_sub(free);

        // One file per block: inode exhaustion shows up long before bytes run out.
        let inodes_total = stat.f_files as u64;
        let inodes_free = stat.f_ffree as u64;
        if inodes_total > 0 && inodes_free < inodes_total / 5 {
            warn!(inodes_free, inodes_total, "block store filesystem inode usage above 80%");
        }

        Ok(StorageCapacity {
            total_bytes: total,
            used_bytes: used,
            available_bytes: available,
        })
    }
}

#[cfg(not(unix))]
fn statvfs(_path: &Path) -> Result<StorageCapacity, StoreError> {
    Ok(StorageCapacity {
        total_bytes: 0,
        used_bytes: 0,
        available_bytes: 0,
    })
}
