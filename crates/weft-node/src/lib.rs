//! Node orchestrator tying the Weft components together.
//!
//! [`WeftNode::start`] brings up identity, transport, discovery, pub/sub,
//! the block store and the replicated database in that order;
//! [`WeftNode::stop`] tears them down in reverse. A start that fails halfway
//! stops whatever it had already started.

pub mod config;
pub mod error;
pub mod node;

pub use config::{BLOCKS_DIR, DEFAULT_DB_ROOT, DatabaseConfig, IDENTITY_FILE, NodeConfig};
pub use error::NodeError;
pub use node::WeftNode;
