//! Error types for network operations.

use std::path::PathBuf;
use std::time::Duration;

use weft_types::{ContentId, FaultKind};

/// Errors that can occur during identity, transport, discovery and pub/sub operations.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The identity file exists but cannot be read or parsed.
    #[error("identity file {path} is unreadable or corrupt: {reason}")]
    Identity {
        /// Path of the identity file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Key generation failed (no OS entropy).
    #[error("key generation failed: {0}")]
    KeyGen(String),

    /// Local I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A configured listen address could not be bound.
    #[error("failed to listen on {addr}: {reason}")]
    Listen {
        /// The multiaddr we tried to bind.
        addr: String,
        /// Transport error text.
        reason: String,
    },

    /// Building the transport stack or behaviour failed.
    #[error("transport setup error: {0}")]
    Transport(String),

    /// A dial attempt failed. Retry is left to the caller.
    #[error("dial to {target} failed: {reason}")]
    Dial {
        /// Peer or address that was dialled.
        target: String,
        /// Transport error text.
        reason: String,
    },

    /// A bounded wait (dial, lookup, fetch) expired.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Operation name.
        operation: &'static str,
        /// The bound that was exceeded.
        after: Duration,
    },

    /// A topic or event stream already has its maximum number of subscribers.
    #[error("subscriber limit reached for {target} (max {max})")]
    SubscriberLimit {
        /// Topic name or `"events"`.
        target: String,
        /// Configured cap.
        max: usize,
    },

    /// Gossipsub rejected a publish or subscribe.
    #[error("pubsub error: {0}")]
    Pubsub(String),

    /// A DHT operation failed.
    #[error("routing error: {0}")]
    Routing(String),

    /// Block data received from a peer does not match the requested id.
    #[error("integrity check failed for block {expected}: actual hash {actual}")]
    IntegrityFailure {
        /// The requested block id.
        expected: ContentId,
        /// The hash of the data actually received.
        actual: ContentId,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),

    /// The network service has shut down.
    #[error("network service is not running")]
    ServiceStopped,
}

impl NetError {
    /// Map onto the shared fault taxonomy.
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::Identity { .. } | Self::Io(_) | Self::Listen { .. } => FaultKind::Io,
            Self::KeyGen(_) => FaultKind::KeyGen,
            Self::Dial { .. } => FaultKind::Dial,
            Self::Timeout { .. } => FaultKind::Timeout,
            Self::IntegrityFailure { .. } => FaultKind::Merge,
            Self::Config(_) | Self::SubscriberLimit { .. } => FaultKind::Config,
            Self::Transport(_)
            | Self::Pubsub(_)
            | Self::Routing(_)
            | Self::Serialization(_)
            | Self::ServiceStopped => FaultKind::Internal,
        }
    }
}

impl From<postcard::Error> for NetError {
    fn from(e: postcard::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
