//! Error types for the log database.

use weft_net::NetError;
use weft_store::StoreError;
use weft_types::{ContentId, EntryId, FaultKind};

use crate::database::DbState;

/// Errors that can occur while opening, writing, reading or merging a database.
#[derive(Debug, thiserror::Error)]
pub enum LogDbError {
    /// The local node may not write to this database.
    #[error("access denied: {0}")]
    Access(String),

    /// The database was opened read-only.
    #[error("database {0} is read-only")]
    ReadOnly(String),

    /// The operation is not available for this database type.
    #[error("{0} is not supported by this database type")]
    Unsupported(&'static str),

    /// The database is not in the `Open` state.
    #[error("database is {0:?}, not open")]
    NotOpen(DbState),

    /// A write allow-list entry is neither `*` nor a peer id.
    #[error("invalid access policy entry: {0}")]
    InvalidPolicy(String),

    /// Entry signature verification failed.
    #[error("invalid signature on entry {0}")]
    InvalidSignature(EntryId),

    /// Entry clock is not one more than its highest predecessor.
    #[error("entry {id} has clock {actual}, expected {expected}")]
    InvalidClock {
        /// The offending entry.
        id: EntryId,
        /// `1 + max(predecessor clocks)`.
        expected: u64,
        /// The clock the entry carries.
        actual: u64,
    },

    /// Entry references predecessors that are not known yet.
    #[error("missing predecessors: {0:?}")]
    MissingPredecessors(Vec<EntryId>),

    /// A fetched entry belongs to a different database.
    #[error("entry {id} belongs to database {db}")]
    ForeignEntry {
        /// The offending entry.
        id: EntryId,
        /// The database it names.
        db: String,
    },

    /// A fetched block does not hash to the id it was requested under.
    #[error("integrity check failed for {expected}: got {actual}")]
    Integrity {
        /// The requested id.
        expected: ContentId,
        /// The hash of what arrived.
        actual: ContentId,
    },

    /// Block storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// Network error.
    #[error("network error: {0}")]
    Network(#[from] NetError),

    /// Local file I/O (heads file).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<postcard::Error> for LogDbError {
    fn from(e: postcard::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl LogDbError {
    /// Map onto the shared fault taxonomy.
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::Access(_) | Self::ReadOnly(_) => FaultKind::Access,
            Self::Unsupported(_) | Self::NotOpen(_) => FaultKind::Internal,
            Self::InvalidPolicy(_) => FaultKind::Config,
            Self::InvalidSignature(_)
            | Self::InvalidClock { .. }
            | Self::MissingPredecessors(_)
            | Self::ForeignEntry { .. }
            | Self::Integrity { .. }
            | Self::Serialization(_) => FaultKind::Merge,
            Self::Storage(e) => e.kind(),
            Self::Network(e) => e.kind(),
            Self::Io(_) => FaultKind::Io,
        }
    }
}
