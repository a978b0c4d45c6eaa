//! TOML configuration for the Weft daemon.
//!
//! Values come from, in order of precedence: command-line flags and their
//! environment variables, the TOML file given with `-c`, then defaults.
//! Flags are merged in by `main`; this module owns the file format and the
//! final conversion into a [`NodeConfig`].

use std::path::{Path, PathBuf};

use serde::Deserialize;
use weft_logdb::ANY_WRITER;
use weft_net::NetConfig;
use weft_node::{DEFAULT_DB_ROOT, DatabaseConfig, NodeConfig, NodeError};
use weft_types::DbType;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Local storage.
    pub node: NodeSection,
    /// Listen port, announced addresses and discovery.
    pub network: NetworkSection,
    /// The replicated database to open.
    pub database: DatabaseSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Directory for the identity, blocks and heads.
    pub data_dir: PathBuf,
    /// Keep blocks and heads in memory.
    pub memory: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".weft"))
            .unwrap_or_else(|| PathBuf::from(".weft"));
        Self {
            data_dir,
            memory: false,
        }
    }
}

/// `[network]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// TCP port. WebSocket listens on `port + 1`. Required.
    pub port: Option<u16>,
    /// Public IPv4 address to announce.
    pub host: Option<String>,
    /// Public DNS name to announce.
    pub domain: Option<String>,
    /// Extra bootstrap peers.
    pub bootstrap: Vec<String>,
    /// Interface to bind listeners on.
    pub bind: String,
    /// Dial the public libp2p bootstrap peers.
    pub default_bootstrap: bool,
    pub mdns: bool,
    pub upnp: bool,
    pub websocket: bool,
    pub webrtc: bool,
    /// Relay circuits for other peers.
    pub relay_server: bool,
}

impl Default for NetworkSection {
    fn default() -> Self {
        let net = NetConfig::default();
        Self {
            port: None,
            host: None,
            domain: None,
            bootstrap: Vec::new(),
            bind: net.host_bind,
            default_bootstrap: net.default_bootstrap,
            mdns: net.mdns,
            upnp: net.upnp,
            websocket: net.websocket,
            webrtc: net.webrtc,
            relay_server: net.relay_server,
        }
    }
}

/// `[database]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// Database name. Required.
    pub name: Option<String>,
    /// `events` or `keyvalue`.
    #[serde(rename = "type")]
    pub db_type: Option<String>,
    /// Address root shared by every node.
    pub root: String,
    /// Write allow-list.
    pub write: Vec<String>,
    /// Open without write access.
    pub read_only: bool,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            name: None,
            db_type: None,
            root: DEFAULT_DB_ROOT.to_string(),
            write: vec![ANY_WRITER.to_string()],
            read_only: false,
        }
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                let config: CliConfig = toml::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Resolve into a node configuration. A missing port or database name
    /// is a configuration error.
    pub fn node_config(&self) -> Result<NodeConfig, NodeError> {
        let port = self
            .network
            .port
            .ok_or_else(|| NodeError::Config("PORT is required".into()))?;
        let name = self
            .database
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| NodeError::Config("DB_NAME is required".into()))?;
        let db_type = match self.database.db_type.as_deref() {
            Some(t) => t
                .parse::<DbType>()
                .map_err(|_| NodeError::Config(format!("unknown DB_TYPE {t:?}")))?,
            None => DbType::default(),
        };

        let net = &self.network;
        let network = NetConfig {
            host_bind: net.bind.clone(),
            port,
            announce_host: net.host.clone().filter(|h| !h.is_empty()),
            announce_domain: net.domain.clone().filter(|d| !d.is_empty()),
            bootstrap: net.bootstrap.clone(),
            default_bootstrap: net.default_bootstrap,
            mdns: net.mdns,
            upnp: net.upnp,
            websocket: net.websocket,
            webrtc: net.webrtc,
            relay_server: net.relay_server,
            ..NetConfig::default()
        };

        Ok(NodeConfig {
            data_dir: self.node.data_dir.clone(),
            memory: self.node.memory,
            network,
            database: DatabaseConfig {
                root: self.database.root.clone(),
                name: name.to_string(),
                db_type,
                write: self.database.write.clone(),
                read_only: self.database.read_only,
            },
            ..NodeConfig::default()
        })
    }
}
