//! Error types for the node orchestrator.

use weft_types::FaultKind;

/// Errors that can occur while starting, running or stopping a node.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The node configuration is unusable.
    #[error("invalid node configuration: {0}")]
    Config(String),

    /// Identity, transport, discovery or pub/sub failure.
    #[error("network error: {0}")]
    Net(#[from] weft_net::NetError),

    /// The block store could not be opened.
    #[error("store error: {0}")]
    Store(#[from] weft_store::StoreError),

    /// The database rejected the operation.
    #[error("database error: {0}")]
    Database(#[from] weft_logdb::LogDbError),

    /// The node has been stopped.
    #[error("node is stopped")]
    Stopped,
}

impl NodeError {
    /// Map onto the shared fault taxonomy.
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::Config(_) => FaultKind::Config,
            Self::Net(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Database(e) => e.kind(),
            Self::Stopped => FaultKind::Internal,
        }
    }
}
