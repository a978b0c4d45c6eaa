//! `weftd`: the Weft node daemon.
//!
//! Starts a node that joins the peer-to-peer overlay and opens one
//! replicated database.
//!
//! # Usage
//!
//! ```text
//! weftd start --port 4001 --db-name orders            # first node
//! weftd start -c weft.toml                            # with a config file
//! weftd start -d ./node2 -p 4101 --db-name orders \
//!     --bootstrap /ip4/127.0.0.1/tcp/4001/p2p/<peer>  # second node
//! weftd identity                                      # print the node id
//! ```
//!
//! Every `start` flag can also come from the environment (`HOST`, `DOMAIN`,
//! `PORT`, `BOOTSTRAP`, `DB_NAME`, `DB_TYPE`), including a `.env` file in
//! the working directory.

mod config;
mod telemetry;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use weft_net::NodeIdentity;
use weft_node::{IDENTITY_FILE, WeftNode};

use config::CliConfig;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "weftd", version, about = "Weft peer-to-peer replicated log node")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node and run until ctrl-c.
    Start(StartArgs),

    /// Load or create the node identity and print its id.
    Identity {
        /// Override data directory.
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },
}

#[derive(Args, Debug, Default)]
struct StartArgs {
    /// Public IPv4 address to announce.
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// Public DNS name to announce.
    #[arg(long, env = "DOMAIN")]
    domain: Option<String>,

    /// TCP listen port. WebSocket uses the next port.
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// One extra bootstrap peer multiaddr.
    #[arg(short, long, env = "BOOTSTRAP")]
    bootstrap: Option<String>,

    /// Name of the database to open.
    #[arg(long, env = "DB_NAME")]
    db_name: Option<String>,

    /// `events` (default) or `keyvalue`.
    #[arg(long, env = "DB_TYPE")]
    db_type: Option<String>,

    /// Override data directory (useful for running multiple instances).
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Keep blocks and heads in memory. The identity is still persisted.
    #[arg(short, long)]
    memory: bool,

    /// Allowed writer (`*` or a peer id). Repeat for several; replaces the
    /// config file list.
    #[arg(short, long = "writer")]
    writers: Vec<String>,

    /// Open the database without write access.
    #[arg(long)]
    read_only: bool,
}

impl StartArgs {
    /// Flags and environment win over the config file.
    fn apply(self, config: &mut CliConfig) {
        if let Some(host) = self.host {
            config.network.host = Some(host);
        }
        if let Some(domain) = self.domain {
            config.network.domain = Some(domain);
        }
        if let Some(port) = self.port {
            config.network.port = Some(port);
        }
        if let Some(peer) = self.bootstrap.filter(|b| !b.trim().is_empty()) {
            config.network.bootstrap.push(peer);
        }
        if let Some(name) = self.db_name {
            config.database.name = Some(name);
        }
        if let Some(db_type) = self.db_type {
            config.database.db_type = Some(db_type);
        }
        if let Some(dir) = self.data_dir {
            config.node.data_dir = dir;
        }
        if self.memory {
            config.node.memory = true;
        }
        if !self.writers.is_empty() {
            config.database.write = self.writers;
        }
        if self.read_only {
            config.database.read_only = true;
        }
    }
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Before parsing, so `.env` values reach the `env = ...` flags.
    let dotenv = dotenvy::dotenv();

    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    telemetry::init(&config.log.level);
    match dotenv {
        Ok(path) => debug!(path = %path.display(), "loaded .env"),
        Err(e) if e.not_found() => {}
        Err(e) => warn!(error = %e, "ignoring unreadable .env"),
    }

    match cli.command {
        Commands::Start(args) => {
            args.apply(&mut config);
            cmd_start(config).await
        }
        Commands::Identity { data_dir } => {
            if let Some(dir) = data_dir {
                config.node.data_dir = dir;
            }
            cmd_identity(&config)
        }
    }
}

// -----------------------------------------------------------------------
// weftd start
// -----------------------------------------------------------------------

async fn cmd_start(config: CliConfig) -> Result<()> {
    info!("starting weftd");
    info!(
        db_name = config.database.name.as_deref().unwrap_or(""),
        db_type = config.database.db_type.as_deref().unwrap_or("events"),
        port = ?config.network.port,
        host = config.network.host.as_deref().unwrap_or(""),
        domain = config.network.domain.as_deref().unwrap_or(""),
        bootstrap = ?config.network.bootstrap,
        "environment"
    );

    let node_config = config.node_config().context("invalid configuration")?;
    info!(
        data_dir = %node_config.data_dir.display(),
        memory = node_config.memory,
        "node configuration"
    );

    let mut node = WeftNode::start(node_config)
        .await
        .context("failed to start node")?;
    let mut updates = node.updates()?;

    info!("node running, press ctrl-c to stop");
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "cannot listen for ctrl-c, shutting down");
                }
                break;
            }
            update = updates.recv() => match update {
                Ok(update) => info!(
                    applied = update.applied,
                    heads = update.heads.len(),
                    "merged remote entries"
                ),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "update stream lagged"),
                Err(RecvError::Closed) => {
                    warn!("database update stream closed");
                    break;
                }
            },
        }
    }

    info!("shutting down");
    node.stop().await;
    Ok(())
}

// -----------------------------------------------------------------------
// weftd identity
// -----------------------------------------------------------------------

fn cmd_identity(config: &CliConfig) -> Result<()> {
    let path = config.node.data_dir.join(IDENTITY_FILE);
    let identity = NodeIdentity::load_or_create(&path)
        .with_context(|| format!("failed to load identity from {}", path.display()))?;

    println!("node id: {}", identity.derived_id());
    println!("peer id: {}", identity.peer_id());
    Ok(())
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_start(args: &[&str]) -> StartArgs {
        let argv = ["weftd", "start"].iter().chain(args).copied();
        match Cli::try_parse_from(argv).expect("CLI should parse").command {
            Commands::Start(args) => args,
            _ => panic!("expected Start command"),
        }
    }

    #[test]
    fn test_cli_flags_override_config_file() {
        let mut config = CliConfig::from_toml(
            r#"
[network]
port = 4001
bootstrap = ["/ip4/198.51.100.1/tcp/4001"]

[database]
name = "from-file"
"#,
        )
        .unwrap();

        let args = parse_start(&[
            "--port",
            "5001",
            "--db-name",
            "orders",
            "--db-type",
            "kv",
            "--host",
            "203.0.113.7",
            "--bootstrap",
            "/ip4/127.0.0.1/tcp/4001",
            "--memory",
        ]);
        args.apply(&mut config);

        let node = config.node_config().unwrap();
        assert_eq!(node.network.port, 5001);
        assert_eq!(node.database.name, "orders");
        assert_eq!(node.database.db_type, weft_types::DbType::KeyValue);
        assert_eq!(node.network.announce_host.as_deref(), Some("203.0.113.7"));
        assert_eq!(
            node.network.bootstrap,
            vec!["/ip4/198.51.100.1/tcp/4001", "/ip4/127.0.0.1/tcp/4001"]
        );
        assert!(node.memory);
    }

    #[test]
    fn test_unset_flags_keep_config_values() {
        let mut config = CliConfig::from_toml(
            "[network]\nport = 4001\n[database]\nname = \"orders\"\n",
        )
        .unwrap();
        StartArgs::default().apply(&mut config);

        let node = config.node_config().unwrap();
        assert_eq!(node.network.port, 4001);
        assert_eq!(node.database.name, "orders");
        assert!(!node.memory);
    }

    #[test]
    fn test_writer_flags_replace_allow_list() {
        let mut config = CliConfig::from_toml(
            "[network]\nport = 4001\n[database]\nname = \"orders\"\nwrite = [\"*\"]\n",
        )
        .unwrap();
        let a = "12D3KooWHdiAxVd8uMQR1hGWXccidmfCwLqcMpGwR6QcTP6QRMuD";
        let b = "12D3KooWQYhTNQdmr3ArTeUHRYzFg94BKyTkoWBDWez9kSCVe2Xo";
        parse_start(&["-w", a, "--writer", b, "--read-only"]).apply(&mut config);

        assert_eq!(config.database.write, vec![a, b]);
        let node = config.node_config().unwrap();
        assert!(node.database.read_only);
    }

    #[test]
    fn test_blank_bootstrap_is_ignored() {
        let mut config = CliConfig::default();
        StartArgs {
            bootstrap: Some("  ".into()),
            ..Default::default()
        }
        .apply(&mut config);
        assert!(config.network.bootstrap.is_empty());
    }

    #[test]
    fn test_identity_command_parses_data_dir() {
        let cli = Cli::try_parse_from(["weftd", "identity", "-d", "/tmp/weft-node"]).unwrap();
        match cli.command {
            Commands::Identity { data_dir } => {
                assert_eq!(data_dir, Some(PathBuf::from("/tmp/weft-node")));
            }
            _ => panic!("expected Identity command"),
        }
    }

    #[test]
    fn test_identity_command_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CliConfig::default();
        config.node.data_dir = dir.path().to_path_buf();

        cmd_identity(&config).unwrap();
        let first = NodeIdentity::load_or_create(dir.path().join(IDENTITY_FILE)).unwrap();
        cmd_identity(&config).unwrap();
        let second = NodeIdentity::load_or_create(dir.path().join(IDENTITY_FILE)).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::try_parse_from(["weftd", "start", "-c", "weft.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("weft.toml")));
    }
}
