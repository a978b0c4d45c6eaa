//! Error types for block storage operations.

use weft_types::{ContentId, FaultKind};

/// Errors that can occur during block storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested block was not found.
    #[error("block not found: {0}")]
    NotFound(ContentId),

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The store has reached its capacity limit.
    #[error("store capacity exceeded: need {needed} bytes, only {available} available")]
    CapacityExceeded {
        /// Bytes needed for the operation.
        needed: u64,
        /// Bytes currently available.
        available: u64,
    },

    /// A caller tried to store data under an id that is not its hash.
    #[error("content hash mismatch: expected {expected}, actual {actual}")]
    HashMismatch {
        /// The id the caller supplied.
        expected: ContentId,
        /// The hash of the supplied data.
        actual: ContentId,
    },

    /// Block data on disk does not match its content-addressed ID.
    ///
    /// The block is treated as missing (not returned to the caller); the
    /// database layer refetches it from a peer.
    #[error("block corruption detected: expected {expected}, actual hash {actual}")]
    CorruptBlock {
        /// The ID that was requested.
        expected: ContentId,
        /// The ID computed from the data actually on disk.
        actual: ContentId,
    },
}

impl StoreError {
    /// Map onto the shared fault taxonomy.
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::HashMismatch { .. } => FaultKind::Merge,
            _ => FaultKind::Io,
        }
    }
}
