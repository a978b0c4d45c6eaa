//! Durable heads file.
//!
//! Entries themselves live in the block store. The only extra state a
//! database keeps on disk is its current heads, from which the whole DAG
//! can be walked back on reopen.

use std::io::Write;
use std::path::{Path, PathBuf};

use rand::RngCore;
use tracing::debug;
use weft_types::EntryId;

use crate::error::LogDbError;

/// `<data_dir>/<db name>/heads`, postcard encoded.
#[derive(Debug, Clone)]
pub struct HeadsFile {
    path: PathBuf,
}

impl HeadsFile {
    /// Heads file for database `name` under `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>, name: &str) -> Self {
        Self {
            path: data_dir.as_ref().join(name).join("heads"),
        }
    }

    /// Location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted heads. A missing file means an empty database.
    pub async fn load(&self) -> Result<Vec<EntryId>, LogDbError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(postcard::from_bytes(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(LogDbError::Io(e)),
        }
    }

    /// Replace the persisted heads atomically (tmp file, fsync, rename).
    pub async fn save(&self, heads: &[EntryId]) -> Result<(), LogDbError> {
        let bytes = postcard::to_allocvec(heads)?;
        let path = self.path.clone();
        let count = heads.len();

        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| LogDbError::Io(std::io::Error::other(e)))??;

        debug!(path = %self.path.display(), heads = count, "persisted heads");
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let nonce = rand::thread_rng().next_u64();
    let tmp = path.with_extension(format!("{nonce:016x}.tmp"));

    let result = (|| {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}
