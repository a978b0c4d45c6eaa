//! [`WeftNode`]: starts every component in order and stops them in reverse.

use std::net::IpAddr;
use std::sync::Arc;

use libp2p::Multiaddr;
use libp2p::multiaddr::Protocol;
use tracing::{debug, error, info, warn};
use weft_logdb::{AccessPolicy, Database, DbUpdate, OpenOptions, Operation};
use weft_net::{Discovery, NetworkHandle, NetworkService, NodeIdentity, PubSub, address_key};
use weft_store::{BlockStore, FileStore, MemoryStore};
use weft_types::{DbAddress, EntryId, NodeId};

use crate::config::{BLOCKS_DIR, IDENTITY_FILE, NodeConfig};
use crate::error::NodeError;

type Result<T> = std::result::Result<T, NodeError>;

/// A running node.
///
/// Every component is held as an `Option` so that [`WeftNode::stop`] can
/// release exactly what was started, including after a failed start.
pub struct WeftNode {
    identity: NodeIdentity,
    config: NodeConfig,
    db_address: DbAddress,
    network: Option<NetworkService>,
    handle: Option<NetworkHandle>,
    discovery: Option<Discovery>,
    pubsub: Option<PubSub>,
    store: Option<Arc<dyn BlockStore>>,
    database: Option<Database>,
    tcp_port: Option<u16>,
}

impl WeftNode {
    /// Start identity, transport, discovery, pub/sub, the block store and
    /// the database, in that order.
    ///
    /// If a step fails, the steps already started are stopped in reverse
    /// before the error is returned.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        let config = config.validated()?;

        let identity = NodeIdentity::load_or_create(config.data_dir.join(IDENTITY_FILE))?;
        info!(
            peer_id = %identity.peer_id(),
            node_id = %identity.derived_id(),
            "identity loaded"
        );

        let db_address = config.database.address();
        let mut node = Self {
            identity,
            config,
            db_address,
            network: None,
            handle: None,
            discovery: None,
            pubsub: None,
            store: None,
            database: None,
            tcp_port: None,
        };

        if let Err(e) = node.start_components().await {
            error!(error = %e, "node start failed, stopping started components");
            node.stop().await;
            return Err(e);
        }

        match node.dialable_address() {
            Some(addr) => info!(%addr, "node address"),
            None => warn!("no tcp listener, node has no dialable address"),
        }
        info!(address = %node.db_address, "database address");
        node.publish_address();
        Ok(node)
    }

    async fn start_components(&mut self) -> Result<()> {
        let (service, handle) =
            NetworkService::start(&self.identity, self.config.network.clone()).await?;
        self.network = Some(service);
        self.handle = Some(handle.clone());
        self.tcp_port = tcp_port(&handle.listen_addrs().await?);

        self.discovery = Some(Discovery::start(handle.clone(), &self.config.network).await?);
        self.pubsub = Some(PubSub::start(handle.clone(), &self.config.network).await?);

        let store: Arc<dyn BlockStore> = if self.config.memory {
            match self.config.memory_max_bytes {
                Some(max) => Arc::new(MemoryStore::new(max)),
                None => Arc::new(MemoryStore::unbounded()),
            }
        } else {
            Arc::new(FileStore::new(self.config.data_dir.join(BLOCKS_DIR))?)
        };
        match store.capacity().await {
            Ok(cap) => debug!(
                total = cap.total_bytes,
                available = cap.available_bytes,
                "block store capacity"
            ),
            Err(e) => debug!(error = %e, "block store capacity unavailable"),
        }
        self.store = Some(store.clone());
        handle.serve_blocks(Some(store.clone())).await?;

        let db = &self.config.database;
        let mut options = OpenOptions::new(self.db_address.clone())
            .db_type(db.db_type)
            .policy(AccessPolicy::new(&db.write)?)
            .read_only(db.read_only)
            .fetch_retry(self.config.fetch_retry);
        if !self.config.memory {
            options = options.data_dir(&self.config.data_dir);
        }
        let network = Arc::new(handle);
        let database =
            Database::open(options, &self.identity, store, network.clone(), network).await?;
        self.database = Some(database);
        Ok(())
    }

    /// Publish the signed dialable address in the DHT. Best effort.
    fn publish_address(&self) {
        let (Some(handle), Some(addr)) = (self.handle.clone(), self.dialable_address()) else {
            return;
        };
        let key = address_key(&self.identity.peer_id());
        let ttl = self.config.address_ttl;
        tokio::spawn(async move {
            match handle.put_record(key, addr.to_string().into_bytes(), ttl).await {
                Ok(()) => debug!(%addr, "address record published"),
                Err(e) => debug!(error = %e, "address record not published"),
            }
        });
    }

    /// Close the database, release the store, then stop pub/sub, discovery
    /// and transport. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(database) = self.database.take() {
            database.close().await;
        }
        if self.store.take().is_some()
            && let Some(handle) = &self.handle
            && let Err(e) = handle.serve_blocks(None).await
        {
            debug!(error = %e, "could not detach block store");
        }
        if let Some(mut pubsub) = self.pubsub.take() {
            pubsub.stop().await;
        }
        if let Some(mut discovery) = self.discovery.take() {
            discovery.stop().await;
        }
        self.handle = None;
        if let Some(mut network) = self.network.take() {
            network.stop().await;
            info!(peer_id = %self.identity.peer_id(), "node stopped");
        }
    }

    /// `/ip4/<host>/tcp/<port>/p2p/<peer>`, using the announced host, else
    /// the announced domain as `/dns4`, else loopback. `None` without a tcp
    /// listener.
    pub fn dialable_address(&self) -> Option<Multiaddr> {
        let port = self.tcp_port?;
        let net = &self.config.network;
        let host = match (&net.announce_host, &net.announce_domain) {
            (Some(host), _) => match host.parse::<IpAddr>() {
                Ok(IpAddr::V4(ip)) => Protocol::Ip4(ip),
                Ok(IpAddr::V6(ip)) => Protocol::Ip6(ip),
                Err(_) => Protocol::Dns4(host.clone().into()),
            },
            (None, Some(domain)) => Protocol::Dns4(domain.clone().into()),
            (None, None) => Protocol::Ip4([127, 0, 0, 1].into()),
        };
        Some(
            Multiaddr::empty()
                .with(host)
                .with(Protocol::Tcp(port))
                .with(Protocol::P2p(self.identity.peer_id())),
        )
    }

    pub fn db_address(&self) -> &DbAddress {
        &self.db_address
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    pub fn peer_id(&self) -> weft_net::PeerId {
        self.identity.peer_id()
    }

    /// The network handle, while running.
    pub fn network(&self) -> Option<&NetworkHandle> {
        self.handle.as_ref()
    }

    /// The open database, while running.
    pub fn database(&self) -> Option<&Database> {
        self.database.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.database.is_some()
    }

    fn db(&self) -> Result<&Database> {
        self.database.as_ref().ok_or(NodeError::Stopped)
    }

    pub async fn put(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Result<EntryId> {
        Ok(self.db()?.put(key, value).await?)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db()?.get(key).await?)
    }

    pub async fn delete(&self, key: impl Into<String>) -> Result<EntryId> {
        Ok(self.db()?.delete(key).await?)
    }

    pub async fn events(&self) -> Result<Vec<(EntryId, Operation)>> {
        Ok(self.db()?.events().await?)
    }

    /// Notifications of remote merges.
    pub fn updates(&self) -> Result<tokio::sync::broadcast::Receiver<DbUpdate>> {
        Ok(self.db()?.updates())
    }
}

/// Port of the first plain TCP listener (no websocket, no relay circuit).
pub(crate) fn tcp_port(addrs: &[Multiaddr]) -> Option<u16> {
    addrs.iter().find_map(|addr| {
        let mut port = None;
        for proto in addr.iter() {
            match proto {
                Protocol::Tcp(p) => port = Some(p),
                Protocol::Ws(_) | Protocol::Wss(_) | Protocol::P2pCircuit => return None,
                _ => {}
            }
        }
        port
    })
}
