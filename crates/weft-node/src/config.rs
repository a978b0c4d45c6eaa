//! Node configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use weft_logdb::{ANY_WRITER, FetchRetry};
use weft_net::NetConfig;
use weft_types::{DbAddress, DbType};

use crate::error::NodeError;

/// Storage root shared by every node, so equal names give equal addresses.
pub const DEFAULT_DB_ROOT: &str = "/weft";

/// File name of the persisted identity inside the data directory.
pub const IDENTITY_FILE: &str = "peer-id.json";

/// Directory of the block store inside the data directory.
pub const BLOCKS_DIR: &str = "blocks";

/// Which replicated database the node opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Address root.
    pub root: String,
    /// Database name. Required.
    pub name: String,
    /// Event log or key-value.
    #[serde(rename = "type")]
    pub db_type: DbType,
    /// Write allow-list: `"*"`, hex node ids or peer ids.
    pub write: Vec<String>,
    /// Open without write access.
    pub read_only: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            root: DEFAULT_DB_ROOT.to_string(),
            name: String::new(),
            db_type: DbType::default(),
            write: vec![ANY_WRITER.to_string()],
            read_only: false,
        }
    }
}

impl DatabaseConfig {
    pub fn address(&self) -> DbAddress {
        DbAddress::new(&self.root, &self.name)
    }
}

/// Everything [`crate::WeftNode::start`] needs.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Holds the identity, the block store and persisted heads.
    pub data_dir: PathBuf,
    /// Keep blocks and heads in memory. The identity is still persisted.
    pub memory: bool,
    /// Byte cap of the in-memory block store. `None` is unbounded.
    pub memory_max_bytes: Option<u64>,
    pub network: NetConfig,
    pub database: DatabaseConfig,
    /// Retry schedule for fetching remote entries.
    pub fetch_retry: FetchRetry,
    /// Lifetime of the address record published in the DHT.
    pub address_ttl: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            memory: false,
            memory_max_bytes: None,
            network: NetConfig::default(),
            database: DatabaseConfig::default(),
            fetch_retry: FetchRetry::default(),
            address_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl NodeConfig {
    /// Normalise the database name and reject configurations that cannot
    /// start.
    pub fn validated(mut self) -> Result<Self, NodeError> {
        let name = self.database.name.trim();
        if name.is_empty() {
            return Err(NodeError::Config("database name is required".into()));
        }
        if name.contains('/') {
            return Err(NodeError::Config(format!(
                "database name {name:?} must not contain '/'"
            )));
        }
        if self.database.write.is_empty() {
            return Err(NodeError::Config(
                "write allow-list is empty; use \"*\" to allow everyone".into(),
            ));
        }
        self.database.name = name.to_string();
        Ok(self)
    }
}
