//! The network service: one swarm task driven through a command channel.
//!
//! [`NetworkService::start`] builds the swarm, binds every configured
//! listener and spawns the task that owns the swarm. Everything else talks
//! to that task through a cloneable [`NetworkHandle`]; each request carries a
//! `oneshot` reply channel. Long-running DHT queries are tracked by query id
//! and cancelled when their caller stops waiting.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use ed25519_dalek::SigningKey;
use futures::{Stream, StreamExt};
use libp2p::core::ConnectedPoint;
use libp2p::core::transport::ListenerId;
use libp2p::gossipsub::{self, IdentTopic};
use libp2p::kad::store::RecordStore;
use libp2p::kad::{self, QueryId};
use libp2p::multiaddr::Protocol;
use libp2p::request_response::{self, OutboundRequestId, ResponseChannel};
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{ConnectionId, SwarmEvent};
use libp2p::{Multiaddr, PeerId, autonat, identify, mdns, relay};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use weft_store::BlockStore;
use weft_types::{ContentId, PeerRecord};

use crate::behaviour::{WeftBehaviourEvent, WeftSwarm, build_swarm};
use crate::config::NetConfig;
use crate::error::NetError;
use crate::identity::NodeIdentity;
use crate::message::{BlockRequest, BlockResponse};
use crate::pubsub::{PubsubEvent, PubsubLimits, Subscription, TopicRegistry};
use crate::records::{SignedRecord, Validators};

/// How often abandoned queries and stale peer records are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Peer records not refreshed for this long are evicted (unless connected).
const PEER_RECORD_TTL_SECS: u64 = 3600;

/// How long `start` waits for each listener to report its first address.
const LISTEN_WAIT: Duration = Duration::from_secs(5);

/// Capacity of the network event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Something that happened on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A listener reported a new local address.
    Listening {
        /// The address.
        address: Multiaddr,
    },
    /// A connection to a peer was established.
    PeerConnected {
        /// The remote peer.
        peer: PeerId,
        /// Remote address of the connection.
        address: Multiaddr,
        /// Whether the remote side dialled us.
        inbound: bool,
    },
    /// A connection to a peer closed.
    PeerDisconnected {
        /// The remote peer.
        peer: PeerId,
        /// Connections to the peer still open.
        remaining: u32,
    },
    /// mDNS found a peer on the local network.
    PeerDiscovered {
        /// The peer.
        peer: PeerId,
        /// Its advertised addresses.
        addresses: Vec<Multiaddr>,
    },
    /// A discovered peer's addresses all expired.
    PeerExpired {
        /// The peer.
        peer: PeerId,
    },
    /// AutoNAT changed its view of our reachability.
    Reachability {
        /// Our public address, if we are publicly reachable.
        public_address: Option<Multiaddr>,
    },
}

type Reply<T> = oneshot::Sender<T>;

/// Requests sent from [`NetworkHandle`] to the swarm task.
enum Command {
    Dial {
        addr: Multiaddr,
        reply: Reply<Result<PeerId, NetError>>,
    },
    DialPeer {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: Reply<Result<PeerId, NetError>>,
    },
    ListenAddrs {
        reply: Reply<Vec<Multiaddr>>,
    },
    ConnectedPeers {
        reply: Reply<Vec<PeerId>>,
    },
    KnownPeers {
        reply: Reply<Vec<PeerRecord>>,
    },
    Relays {
        reply: Reply<Vec<(PeerId, Multiaddr)>>,
    },
    FindPeer {
        peer: PeerId,
        reply: Reply<Result<Vec<Multiaddr>, NetError>>,
    },
    GetProviders {
        id: ContentId,
        tx: mpsc::Sender<PeerId>,
    },
    StartProviding {
        id: ContentId,
        reply: Reply<Result<(), NetError>>,
    },
    PutRecord {
        record: kad::Record,
        reply: Reply<Result<(), NetError>>,
    },
    GetRecord {
        key: Vec<u8>,
        reply: Reply<Vec<Vec<u8>>>,
    },
    RandomWalk,
    EnablePubsub {
        limits: PubsubLimits,
        reply: Reply<()>,
    },
    DisablePubsub {
        reply: Reply<()>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: Reply<Result<(), NetError>>,
    },
    Subscribe {
        topic: String,
        reply: Reply<Result<Subscription, NetError>>,
    },
    Unsubscribe {
        topic: String,
        reply: Reply<()>,
    },
    ServeBlocks {
        store: Option<Arc<dyn BlockStore>>,
        reply: Reply<()>,
    },
    RequestBlock {
        peer: PeerId,
        id: ContentId,
        reply: Reply<Result<Option<Bytes>, NetError>>,
    },
    RespondBlock {
        channel: ResponseChannel<BlockResponse>,
        response: BlockResponse,
    },
}

/// Owns the network task.
#[derive(Debug)]
pub struct NetworkService {
    handle: NetworkHandle,
    task: Option<JoinHandle<()>>,
}

impl NetworkService {
    /// Build the swarm, bind every configured listener and start the task.
    ///
    /// A listener that fails to bind is fatal: the partially built swarm is
    /// dropped (releasing any listener already bound) and `NetError::Listen`
    /// is returned.
    pub async fn start(
        identity: &NodeIdentity,
        config: NetConfig,
    ) -> Result<(Self, NetworkHandle), NetError> {
        config.validate()?;

        let mut swarm = build_swarm(identity, &config).await?;
        for addr in config.announce_multiaddrs() {
            info!(%addr, "announcing external address");
            swarm.add_external_address(addr);
        }
        bind_listeners(&mut swarm, config.listen_multiaddrs()?).await?;
        if config.relay_server && config.announce_multiaddrs().is_empty() {
            // Reservations carry the relay's external addresses; without an
            // announced one, offer what we listen on.
            let listening: Vec<Multiaddr> = swarm.listeners().cloned().collect();
            for addr in listening {
                debug!(%addr, "relay address");
                swarm.add_external_address(addr);
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let validators = Arc::new(Validators::with_defaults());

        let handle = NetworkHandle {
            commands: cmd_tx.clone(),
            events: events_tx.clone(),
            shutdown: Arc::new(shutdown_tx),
            local_peer_id: identity.peer_id(),
            signing_key: identity.signing_key().clone(),
            validators: validators.clone(),
            dial_timeout: config.dial_timeout,
            lookup_timeout: config.lookup_timeout,
            max_event_subscribers: config.max_event_subscribers,
        };

        let task = SwarmTask {
            swarm,
            commands: cmd_rx,
            internal: cmd_tx,
            events: events_tx,
            shutdown: shutdown_rx,
            validators,
            lookup_timeout: config.lookup_timeout,
            pubsub: None,
            blocks: None,
            peers: HashMap::new(),
            dialed_addrs: HashMap::new(),
            relays: HashMap::new(),
            reservation: None,
            pending_dials: HashMap::new(),
            pending_find_peer: HashMap::new(),
            pending_providers: HashMap::new(),
            pending_records: HashMap::new(),
            pending_blocks: HashMap::new(),
        };
        let task = tokio::spawn(task.run());

        info!(peer_id = %identity.peer_id(), "network service started");
        Ok((
            Self {
                handle: handle.clone(),
                task: Some(task),
            },
            handle,
        ))
    }

    /// A handle to the running service.
    pub fn handle(&self) -> &NetworkHandle {
        &self.handle
    }

    /// Stop the swarm task and wait for it to release its listeners. Idempotent.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        self.handle.shutdown();
        if let Err(e) = task.await {
            warn!(error = %e, "network task ended abnormally");
        }
        info!("network service stopped");
    }
}

/// Listen on every address and wait until each listener is bound.
async fn bind_listeners(swarm: &mut WeftSwarm, addrs: Vec<Multiaddr>) -> Result<(), NetError> {
    for addr in &addrs {
        ensure_port_free(addr)?;
    }

    let mut pending = HashMap::new();
    for addr in addrs {
        let id = swarm.listen_on(addr.clone()).map_err(|e| NetError::Listen {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
        pending.insert(id, addr);
    }

    let deadline = tokio::time::sleep(LISTEN_WAIT);
    tokio::pin!(deadline);

    while !pending.is_empty() {
        tokio::select! {
            event = swarm.select_next_some() => match event {
                SwarmEvent::NewListenAddr { listener_id, address } => {
                    info!(%address, "listening");
                    pending.remove(&listener_id);
                }
                SwarmEvent::ListenerClosed { listener_id, reason, .. } => {
                    if let Some(addr) = pending.remove(&listener_id) {
                        return Err(NetError::Listen {
                            addr: addr.to_string(),
                            reason: match reason {
                                Ok(()) => "listener closed".to_string(),
                                Err(e) => e.to_string(),
                            },
                        });
                    }
                }
                SwarmEvent::ListenerError { listener_id, error } => {
                    if let Some(addr) = pending.remove(&listener_id) {
                        return Err(NetError::Listen {
                            addr: addr.to_string(),
                            reason: error.to_string(),
                        });
                    }
                }
                _ => {}
            },
            _ = &mut deadline => {
                let addr = pending.values().next().map(|a| a.to_string()).unwrap_or_default();
                return Err(NetError::Listen {
                    addr,
                    reason: format!("no address reported within {LISTEN_WAIT:?}"),
                });
            }
        }
    }
    Ok(())
}

/// Fail if a fixed port in `addr` is already bound by anyone.
///
/// The TCP transport listens with `SO_REUSEPORT`, which would let a second
/// node silently share the port. A plain socket without it cannot bind an
/// occupied port, so a throwaway bind tells the two cases apart.
fn ensure_port_free(addr: &Multiaddr) -> Result<(), NetError> {
    let mut ip = None;
    for proto in addr.iter() {
        let bound = match proto {
            Protocol::Ip4(v4) => {
                ip = Some(IpAddr::V4(v4));
                continue;
            }
            Protocol::Ip6(v6) => {
                ip = Some(IpAddr::V6(v6));
                continue;
            }
            Protocol::Tcp(port) if port != 0 => ip
                .map(|ip| std::net::TcpListener::bind(SocketAddr::new(ip, port)).map(drop)),
            Protocol::Udp(port) if port != 0 => {
                ip.map(|ip| std::net::UdpSocket::bind(SocketAddr::new(ip, port)).map(drop))
            }
            _ => None,
        };
        if let Some(Err(e)) = bound {
            return Err(NetError::Listen {
                addr: addr.to_string(),
                reason: e.to_string(),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable client of the network task.
#[derive(Clone)]
pub struct NetworkHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<NetworkEvent>,
    shutdown: Arc<watch::Sender<bool>>,
    local_peer_id: PeerId,
    signing_key: SigningKey,
    validators: Arc<Validators>,
    dial_timeout: Duration,
    lookup_timeout: Duration,
    max_event_subscribers: usize,
}

impl std::fmt::Debug for NetworkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkHandle")
            .field("local_peer_id", &self.local_peer_id)
            .finish_non_exhaustive()
    }
}

impl NetworkHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, NetError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| NetError::ServiceStopped)?;
        rx.await.map_err(|_| NetError::ServiceStopped)
    }

    /// This node's peer id.
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Dial a single multiaddr, bounded by the dial timeout.
    pub async fn dial(&self, addr: Multiaddr) -> Result<PeerId, NetError> {
        let fut = self.request(|reply| Command::Dial { addr, reply });
        match tokio::time::timeout(self.dial_timeout, fut).await {
            Ok(result) => result?,
            Err(_) => Err(NetError::Timeout {
                operation: "dial",
                after: self.dial_timeout,
            }),
        }
    }

    async fn dial_peer_via(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<PeerId, NetError> {
        let fut = self.request(|reply| Command::DialPeer { peer, addrs, reply });
        match tokio::time::timeout(self.dial_timeout, fut).await {
            Ok(result) => result?,
            Err(_) => Err(NetError::Timeout {
                operation: "dial",
                after: self.dial_timeout,
            }),
        }
    }

    /// Connect to `peer`: directly first, then through each known relay.
    pub async fn dial_peer(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<(), NetError> {
        let direct = if addrs.is_empty() {
            Err(NetError::Dial {
                target: peer.to_string(),
                reason: "no direct addresses".into(),
            })
        } else {
            self.dial_peer_via(peer, addrs).await
        };
        let mut last_err = match direct {
            Ok(_) => return Ok(()),
            Err(e) => {
                debug!(%peer, error = %e, "direct dial failed, trying relays");
                e
            }
        };

        let relays = self.relays().await?;
        for (relay, relay_addr) in relays {
            if relay == peer {
                continue;
            }
            let circuit = with_peer(relay_addr, relay)
                .with(Protocol::P2pCircuit)
                .with(Protocol::P2p(peer));
            match self.dial_peer_via(peer, vec![circuit.clone()]).await {
                Ok(_) => {
                    info!(%peer, %relay, "connected through relay");
                    return Ok(());
                }
                Err(e) => {
                    debug!(%peer, %circuit, error = %e, "relayed dial failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Known circuit relays and the address we reach each one on.
    pub async fn relays(&self) -> Result<Vec<(PeerId, Multiaddr)>, NetError> {
        self.request(|reply| Command::Relays { reply }).await
    }

    /// Current listen addresses.
    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>, NetError> {
        self.request(|reply| Command::ListenAddrs { reply }).await
    }

    /// Peers with at least one open connection.
    pub async fn connected_peers(&self) -> Result<Vec<PeerId>, NetError> {
        self.request(|reply| Command::ConnectedPeers { reply }).await
    }

    /// Discovery's view of known peers.
    pub async fn known_peers(&self) -> Result<Vec<PeerRecord>, NetError> {
        self.request(|reply| Command::KnownPeers { reply }).await
    }

    /// Subscribe to network events.
    pub fn events(&self) -> Result<broadcast::Receiver<NetworkEvent>, NetError> {
        if self.events.receiver_count() >= self.max_event_subscribers {
            return Err(NetError::SubscriberLimit {
                target: "events".into(),
                max: self.max_event_subscribers,
            });
        }
        Ok(self.events.subscribe())
    }

    /// Ask the swarm task to stop. Returns immediately.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Find addresses for `peer`, from cache or via a DHT lookup.
    pub async fn find_peer(&self, peer: PeerId) -> Result<Vec<Multiaddr>, NetError> {
        let fut = self.request(|reply| Command::FindPeer { peer, reply });
        match tokio::time::timeout(self.lookup_timeout, fut).await {
            Ok(result) => result?,
            Err(_) => Err(NetError::Timeout {
                operation: "find_peer",
                after: self.lookup_timeout,
            }),
        }
    }

    /// Stream the providers of `id`. The stream ends when the query does.
    pub async fn find_providers(&self, id: ContentId) -> Result<ProviderStream, NetError> {
        let (tx, rx) = mpsc::channel(32);
        self.commands
            .send(Command::GetProviders { id, tx })
            .await
            .map_err(|_| NetError::ServiceStopped)?;
        Ok(ProviderStream { rx })
    }

    /// Announce this node as a provider of `id`.
    pub async fn provide(&self, id: ContentId) -> Result<(), NetError> {
        self.request(|reply| Command::StartProviding { id, reply })
            .await?
    }

    /// Sign `value` and store it under `key` in the DHT.
    pub async fn put_record(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> Result<(), NetError> {
        let signed = SignedRecord::sign(&self.signing_key, &key, value, ttl);
        let mut record = kad::Record::new(key, signed.encode()?);
        record.publisher = Some(self.local_peer_id);
        record.expires = Some(Instant::now() + ttl);
        self.request(|reply| Command::PutRecord { record, reply })
            .await?
    }

    /// Look up `key` and return the best valid record, if any.
    pub async fn get_record(&self, key: Vec<u8>) -> Result<Option<SignedRecord>, NetError> {
        let fut = self.request(|reply| Command::GetRecord {
            key: key.clone(),
            reply,
        });
        let values = match tokio::time::timeout(self.lookup_timeout, fut).await {
            Ok(values) => values?,
            Err(_) => {
                return Err(NetError::Timeout {
                    operation: "get_record",
                    after: self.lookup_timeout,
                });
            }
        };
        match self.validators.select_valid(&key, values) {
            Some(raw) => Ok(Some(SignedRecord::decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Start one Kademlia random walk.
    pub async fn random_walk(&self) -> Result<(), NetError> {
        self.commands
            .send(Command::RandomWalk)
            .await
            .map_err(|_| NetError::ServiceStopped)
    }

    pub(crate) async fn enable_pubsub(&self, limits: PubsubLimits) -> Result<(), NetError> {
        self.request(|reply| Command::EnablePubsub { limits, reply })
            .await
    }

    pub(crate) async fn disable_pubsub(&self) -> Result<(), NetError> {
        self.request(|reply| Command::DisablePubsub { reply }).await
    }

    /// Publish on a topic. Succeeds when nobody is listening.
    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), NetError> {
        let topic = topic.to_string();
        self.request(|reply| Command::Publish { topic, data, reply })
            .await?
    }

    /// Subscribe to a topic.
    pub async fn subscribe(&self, topic: &str) -> Result<Subscription, NetError> {
        let topic = topic.to_string();
        self.request(|reply| Command::Subscribe { topic, reply })
            .await?
    }

    /// Drop local subscribers of a topic and leave it.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), NetError> {
        let topic = topic.to_string();
        self.request(|reply| Command::Unsubscribe { topic, reply })
            .await
    }

    /// Serve inbound block requests from `store`, or stop serving with `None`.
    pub async fn serve_blocks(&self, store: Option<Arc<dyn BlockStore>>) -> Result<(), NetError> {
        self.request(|reply| Command::ServeBlocks { store, reply })
            .await
    }

    /// Ask one peer for a block. The data is verified against `id`.
    pub async fn request_block(&self, peer: PeerId, id: ContentId) -> Result<Option<Bytes>, NetError> {
        let data = self
            .request(|reply| Command::RequestBlock { peer, id, reply })
            .await??;
        match data {
            Some(bytes) => {
                let actual = ContentId::from_data(&bytes);
                if actual != id {
                    return Err(NetError::IntegrityFailure {
                        expected: id,
                        actual,
                    });
                }
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    /// Fetch a block from `hint`, then from any provider.
    pub async fn fetch_block(&self, id: ContentId, hint: Option<PeerId>) -> Result<Option<Bytes>, NetError> {
        let mut tried = HashSet::new();
        tried.insert(self.local_peer_id);

        if let Some(peer) = hint
            && tried.insert(peer)
            && let Some(data) = self.try_block(peer, id).await
        {
            return Ok(Some(data));
        }

        let mut providers = self.find_providers(id).await?;
        while let Some(peer) = providers.next().await {
            if !tried.insert(peer) {
                continue;
            }
            if let Some(data) = self.try_block(peer, id).await {
                return Ok(Some(data));
            }
        }
        Ok(None)
    }

    async fn try_block(&self, peer: PeerId, id: ContentId) -> Option<Bytes> {
        match self.request_block(peer, id).await {
            Ok(found) => found,
            Err(e @ NetError::IntegrityFailure { .. }) => {
                warn!(%peer, error = %e, "peer served a corrupt block");
                None
            }
            Err(e) => {
                debug!(%peer, %id, error = %e, "block request failed");
                None
            }
        }
    }
}

/// Providers of a key, as discovered. Finite and free of duplicates.
pub struct ProviderStream {
    rx: mpsc::Receiver<PeerId>,
}

impl Stream for ProviderStream {
    type Item = PeerId;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<PeerId>> {
        self.rx.poll_recv(cx)
    }
}

/// `addr` with a trailing `/p2p/<peer>`, replacing any existing one.
fn with_peer(mut addr: Multiaddr, peer: PeerId) -> Multiaddr {
    if matches!(addr.iter().last(), Some(Protocol::P2p(_))) {
        addr.pop();
    }
    addr.with(Protocol::P2p(peer))
}

/// The peer id in a trailing `/p2p/<peer>` component.
pub fn peer_of(addr: &Multiaddr) -> Option<PeerId> {
    match addr.iter().last() {
        Some(Protocol::P2p(peer)) => Some(peer),
        _ => None,
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Swarm task
// ---------------------------------------------------------------------------

struct ProviderQuery {
    tx: mpsc::Sender<PeerId>,
    seen: HashSet<PeerId>,
}

struct SwarmTask {
    swarm: WeftSwarm,
    commands: mpsc::Receiver<Command>,
    internal: mpsc::Sender<Command>,
    events: broadcast::Sender<NetworkEvent>,
    shutdown: watch::Receiver<bool>,
    validators: Arc<Validators>,
    lookup_timeout: Duration,
    pubsub: Option<TopicRegistry>,
    blocks: Option<Arc<dyn BlockStore>>,
    peers: HashMap<PeerId, PeerRecord>,
    dialed_addrs: HashMap<PeerId, Multiaddr>,
    relays: HashMap<PeerId, Multiaddr>,
    /// The one relay we hold a circuit reservation on, and its listener.
    reservation: Option<(PeerId, ListenerId)>,
    pending_dials: HashMap<ConnectionId, Reply<Result<PeerId, NetError>>>,
    pending_find_peer: HashMap<QueryId, (PeerId, Reply<Result<Vec<Multiaddr>, NetError>>)>,
    pending_providers: HashMap<QueryId, ProviderQuery>,
    pending_records: HashMap<QueryId, (Vec<Vec<u8>>, Reply<Vec<Vec<u8>>>)>,
    pending_blocks: HashMap<OutboundRequestId, Reply<Result<Option<Bytes>, NetError>>>,
}

impl SwarmTask {
    async fn run(mut self) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                event = self.swarm.select_next_some() => self.on_swarm_event(event),
                Some(cmd) = self.commands.recv() => self.on_command(cmd),
                _ = sweep.tick() => self.sweep(),
            }
        }
        info!("network loop exited");
    }

    fn emit(&self, event: NetworkEvent) {
        // No receivers is not an error.
        let _ = self.events.send(event);
    }

    fn note_peer<'a>(&mut self, peer: PeerId, addrs: impl IntoIterator<Item = &'a Multiaddr>) {
        let now = unix_now();
        self.peers
            .entry(peer)
            .or_insert_with(|| PeerRecord::new(peer.to_string(), now))
            .refresh(addrs.into_iter().map(|a| a.to_string()), now);
    }

    fn cached_addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.peers
            .get(peer)
            .map(|r| r.addresses.iter().filter_map(|a| a.parse().ok()).collect())
            .unwrap_or_default()
    }

    // --- commands ---

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Dial { addr, reply } => {
                let opts = match peer_of(&addr) {
                    Some(peer) => DialOpts::peer_id(peer)
                        .addresses(vec![addr.clone()])
                        .condition(PeerCondition::Always)
                        .build(),
                    None => DialOpts::unknown_peer_id().address(addr.clone()).build(),
                };
                self.start_dial(addr.to_string(), opts, reply);
            }
            Command::DialPeer { peer, addrs, reply } => {
                if self.swarm.is_connected(&peer) {
                    let _ = reply.send(Ok(peer));
                    return;
                }
                let opts = DialOpts::peer_id(peer)
                    .addresses(addrs)
                    .condition(PeerCondition::Always)
                    .build();
                self.start_dial(peer.to_string(), opts, reply);
            }
            Command::ListenAddrs { reply } => {
                let _ = reply.send(self.swarm.listeners().cloned().collect());
            }
            Command::ConnectedPeers { reply } => {
                let _ = reply.send(self.swarm.connected_peers().copied().collect());
            }
            Command::KnownPeers { reply } => {
                let _ = reply.send(self.peers.values().cloned().collect());
            }
            Command::Relays { reply } => {
                let _ = reply.send(self.relays.iter().map(|(p, a)| (*p, a.clone())).collect());
            }
            Command::FindPeer { peer, reply } => {
                let cached = self.cached_addrs(&peer);
                if !cached.is_empty() {
                    let _ = reply.send(Ok(cached));
                    return;
                }
                let qid = self.swarm.behaviour_mut().kad.get_closest_peers(peer);
                self.pending_find_peer.insert(qid, (peer, reply));
            }
            Command::GetProviders { id, tx } => {
                let qid = self
                    .swarm
                    .behaviour_mut()
                    .kad
                    .get_providers(kad::RecordKey::new(&id));
                self.pending_providers.insert(
                    qid,
                    ProviderQuery {
                        tx,
                        seen: HashSet::new(),
                    },
                );
            }
            Command::StartProviding { id, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .kad
                    .start_providing(kad::RecordKey::new(&id))
                    .map(|_| ())
                    .map_err(|e| NetError::Routing(e.to_string()));
                let _ = reply.send(result);
            }
            Command::PutRecord { record, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .kad
                    .put_record(record, kad::Quorum::One)
                    .map(|_| ())
                    .map_err(|e| NetError::Routing(e.to_string()));
                let _ = reply.send(result);
            }
            Command::GetRecord { key, reply } => {
                let qid = self
                    .swarm
                    .behaviour_mut()
                    .kad
                    .get_record(kad::RecordKey::new(&key));
                self.pending_records.insert(qid, (Vec::new(), reply));
            }
            Command::RandomWalk => self.random_walk(),
            Command::EnablePubsub { limits, reply } => {
                if self.pubsub.is_none() {
                    self.pubsub = Some(TopicRegistry::new(limits));
                }
                let _ = reply.send(());
            }
            Command::DisablePubsub { reply } => {
                if let Some(mut registry) = self.pubsub.take() {
                    for topic in registry.drain() {
                        let _ = self
                            .swarm
                            .behaviour_mut()
                            .gossipsub
                            .unsubscribe(&IdentTopic::new(topic));
                    }
                }
                let _ = reply.send(());
            }
            Command::Publish { topic, data, reply } => {
                let _ = reply.send(self.publish(topic, data));
            }
            Command::Subscribe { topic, reply } => {
                let _ = reply.send(self.subscribe(&topic));
            }
            Command::Unsubscribe { topic, reply } => {
                if let Some(registry) = self.pubsub.as_mut() {
                    registry.remove_topic(&topic);
                }
                let _ = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .unsubscribe(&IdentTopic::new(topic));
                let _ = reply.send(());
            }
            Command::ServeBlocks { store, reply } => {
                debug!(serving = store.is_some(), "block store attached");
                self.blocks = store;
                let _ = reply.send(());
            }
            Command::RequestBlock { peer, id, reply } => {
                let rid = self
                    .swarm
                    .behaviour_mut()
                    .blocks
                    .send_request(&peer, BlockRequest::Get(id));
                self.pending_blocks.insert(rid, reply);
            }
            Command::RespondBlock { channel, response } => {
                if self
                    .swarm
                    .behaviour_mut()
                    .blocks
                    .send_response(channel, response)
                    .is_err()
                {
                    debug!("block requester went away before the response");
                }
            }
        }
    }

    fn start_dial(&mut self, target: String, opts: DialOpts, reply: Reply<Result<PeerId, NetError>>) {
        let connection_id = opts.connection_id();
        match self.swarm.dial(opts) {
            Ok(()) => {
                self.pending_dials.insert(connection_id, reply);
            }
            Err(e) => {
                let _ = reply.send(Err(NetError::Dial {
                    target,
                    reason: e.to_string(),
                }));
            }
        }
    }

    fn random_walk(&mut self) {
        let kad = &mut self.swarm.behaviour_mut().kad;
        kad.get_closest_peers(PeerId::random());
        if let Err(e) = kad.bootstrap() {
            trace!(error = ?e, "kademlia bootstrap skipped");
        }
    }

    fn publish(&mut self, topic: String, data: Vec<u8>) -> Result<(), NetError> {
        if self.pubsub.is_none() {
            return Err(NetError::Pubsub("pub/sub is not started".into()));
        }
        match self
            .swarm
            .behaviour_mut()
            .gossipsub
            .publish(IdentTopic::new(topic.clone()), data)
        {
            Ok(_) => Ok(()),
            Err(gossipsub::PublishError::InsufficientPeers) => {
                trace!(%topic, "published with no subscribed peers");
                Ok(())
            }
            Err(gossipsub::PublishError::Duplicate) => Ok(()),
            Err(e) => Err(NetError::Pubsub(e.to_string())),
        }
    }

    fn subscribe(&mut self, topic: &str) -> Result<Subscription, NetError> {
        let registry = self
            .pubsub
            .as_mut()
            .ok_or_else(|| NetError::Pubsub("pub/sub is not started".into()))?;
        let (subscription, first) = registry.add(topic)?;
        if first {
            self.swarm
                .behaviour_mut()
                .gossipsub
                .subscribe(&IdentTopic::new(topic))
                .map_err(|e| NetError::Pubsub(e.to_string()))?;
            debug!(%topic, "joined topic");
        }
        Ok(subscription)
    }

    fn deliver(&mut self, topic: &str, event: PubsubEvent) {
        let Some(registry) = self.pubsub.as_mut() else {
            return;
        };
        registry.deliver(topic, &event);
        if !registry.has_topic(topic) {
            debug!(%topic, "last local subscriber gone, leaving topic");
            let _ = self
                .swarm
                .behaviour_mut()
                .gossipsub
                .unsubscribe(&IdentTopic::new(topic));
        }
    }

    fn sweep(&mut self) {
        let kad = &mut self.swarm.behaviour_mut().kad;

        self.pending_find_peer.retain(|qid, (_, reply)| {
            let keep = !reply.is_closed();
            if !keep && let Some(mut q) = kad.query_mut(qid) {
                q.finish();
            }
            keep
        });
        self.pending_providers.retain(|qid, q| {
            let keep = !q.tx.is_closed();
            if !keep && let Some(mut q) = kad.query_mut(qid) {
                q.finish();
            }
            keep
        });
        self.pending_records.retain(|qid, (_, reply)| {
            let keep = !reply.is_closed();
            if !keep && let Some(mut q) = kad.query_mut(qid) {
                q.finish();
            }
            keep
        });
        self.pending_dials.retain(|_, reply| !reply.is_closed());

        let now = unix_now();
        let swarm = &self.swarm;
        self.peers
            .retain(|peer, rec| swarm.is_connected(peer) || !rec.is_stale(now, PEER_RECORD_TTL_SECS));
    }

    // --- swarm events ---

    fn on_swarm_event(&mut self, event: SwarmEvent<WeftBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "listening");
                self.emit(NetworkEvent::Listening { address });
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                debug!(%address, "listen address expired");
            }
            SwarmEvent::ListenerClosed {
                listener_id,
                addresses,
                reason,
            } => {
                match reason {
                    Ok(()) => debug!(?addresses, "listener closed"),
                    Err(e) => warn!(?addresses, error = %e, "listener closed with error"),
                }
                if let Some((relay, id)) = self.reservation
                    && id == listener_id
                {
                    info!(%relay, "relay reservation lost");
                    self.reservation = None;
                    self.relays.remove(&relay);
                    self.reserve_relay();
                }
            }
            SwarmEvent::ListenerError { error, .. } => {
                warn!(error = %error, "listener error");
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => self.on_connected(peer_id, connection_id, endpoint),
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                cause,
                ..
            } => {
                debug!(peer = %peer_id, remaining = num_established, ?cause, "connection closed");
                if num_established == 0 {
                    self.dialed_addrs.remove(&peer_id);
                    self.relays.remove(&peer_id);
                    if let Some((relay, id)) = self.reservation
                        && relay == peer_id
                    {
                        self.swarm.remove_listener(id);
                        self.reservation = None;
                        self.reserve_relay();
                    }
                    if self.peers.get(&peer_id).is_some_and(|r| r.addresses.is_empty()) {
                        self.peers.remove(&peer_id);
                    }
                }
                self.emit(NetworkEvent::PeerDisconnected {
                    peer: peer_id,
                    remaining: num_established,
                });
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
                ..
            } => {
                let target = peer_id.map(|p| p.to_string()).unwrap_or_else(|| "address".into());
                debug!(%target, error = %error, "outgoing connection failed");
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Err(NetError::Dial {
                        target,
                        reason: error.to_string(),
                    }));
                }
            }
            SwarmEvent::IncomingConnectionError { error, .. } => {
                debug!(error = %error, "incoming connection failed");
            }
            SwarmEvent::ExternalAddrConfirmed { address } => {
                info!(%address, "external address confirmed");
            }
            SwarmEvent::Behaviour(event) => self.on_behaviour_event(event),
            _ => {}
        }
    }

    fn on_connected(&mut self, peer: PeerId, connection_id: ConnectionId, endpoint: ConnectedPoint) {
        let address = endpoint.get_remote_address().clone();
        let inbound = !endpoint.is_dialer();
        debug!(%peer, %address, inbound, "connection established");

        if !inbound {
            self.note_peer(peer, [&address]);
            self.dialed_addrs.insert(peer, address.clone());
        } else {
            self.note_peer(peer, std::iter::empty());
        }
        if let Some(reply) = self.pending_dials.remove(&connection_id) {
            let _ = reply.send(Ok(peer));
        }
        self.emit(NetworkEvent::PeerConnected {
            peer,
            address,
            inbound,
        });
    }

    fn on_behaviour_event(&mut self, event: WeftBehaviourEvent) {
        match event {
            WeftBehaviourEvent::Identify(event) => self.on_identify(event),
            WeftBehaviourEvent::Mdns(event) => self.on_mdns(event),
            WeftBehaviourEvent::Kad(event) => self.on_kad(event),
            WeftBehaviourEvent::Gossipsub(event) => self.on_gossipsub(event),
            WeftBehaviourEvent::Blocks(event) => self.on_blocks(event),
            WeftBehaviourEvent::Autonat(autonat::Event::StatusChanged { old, new }) => {
                info!(?old, ?new, "reachability changed");
                let public_address = match new {
                    autonat::NatStatus::Public(addr) => Some(addr),
                    _ => None,
                };
                self.emit(NetworkEvent::Reachability { public_address });
            }
            WeftBehaviourEvent::Autonat(event) => trace!(?event, "autonat"),
            WeftBehaviourEvent::Dcutr(event) => info!(?event, "hole punching"),
            WeftBehaviourEvent::Upnp(event) => info!(?event, "upnp"),
            WeftBehaviourEvent::RelayClient(relay::client::Event::ReservationReqAccepted {
                relay_peer_id,
                renewal,
                ..
            }) => {
                if !renewal {
                    info!(relay = %relay_peer_id, "relay reservation accepted");
                }
            }
            WeftBehaviourEvent::RelayClient(event) => debug!(?event, "relay client"),
            WeftBehaviourEvent::RelayServer(event) => debug!(?event, "relay server"),
            WeftBehaviourEvent::Ping(_) => {}
        }
    }

    fn on_identify(&mut self, event: identify::Event) {
        let identify::Event::Received { peer_id, info, .. } = event else {
            return;
        };
        debug!(peer = %peer_id, agent = %info.agent_version, "identified peer");

        for addr in &info.listen_addrs {
            self.swarm
                .behaviour_mut()
                .kad
                .add_address(&peer_id, addr.clone());
        }
        self.note_peer(peer_id, &info.listen_addrs);
        if let Some(rec) = self.peers.get_mut(&peer_id) {
            rec.agent_version = Some(info.agent_version.clone());
        }

        if info.protocols.contains(&relay::HOP_PROTOCOL_NAME) {
            let addr = self
                .dialed_addrs
                .get(&peer_id)
                .cloned()
                .or_else(|| info.listen_addrs.first().cloned());
            if let Some(addr) = addr {
                debug!(relay = %peer_id, %addr, "found relay");
                self.relays.insert(peer_id, addr);
                self.reserve_relay();
            }
        }
    }

    /// Hold a reservation on one connected relay so peers that cannot reach
    /// us directly can come in through `<relay>/p2p-circuit`.
    fn reserve_relay(&mut self) {
        if self.reservation.is_some() {
            return;
        }
        let candidate = self
            .relays
            .iter()
            .find(|(peer, _)| self.swarm.is_connected(peer))
            .map(|(peer, addr)| (*peer, addr.clone()));
        let Some((relay, addr)) = candidate else {
            return;
        };
        let circuit = with_peer(addr, relay).with(Protocol::P2pCircuit);
        match self.swarm.listen_on(circuit.clone()) {
            Ok(id) => {
                info!(%relay, %circuit, "requesting relay reservation");
                self.reservation = Some((relay, id));
            }
            Err(e) => {
                debug!(%relay, %circuit, error = %e, "relay reservation not started");
                self.relays.remove(&relay);
            }
        }
    }

    fn on_mdns(&mut self, event: mdns::Event) {
        match event {
            mdns::Event::Discovered(list) => {
                let mut by_peer: HashMap<PeerId, Vec<Multiaddr>> = HashMap::new();
                for (peer, addr) in list {
                    by_peer.entry(peer).or_default().push(addr);
                }
                for (peer, addrs) in by_peer {
                    debug!(%peer, count = addrs.len(), "mdns discovered peer");
                    for addr in &addrs {
                        self.swarm.behaviour_mut().kad.add_address(&peer, addr.clone());
                    }
                    self.note_peer(peer, &addrs);
                    if !self.swarm.is_connected(&peer) {
                        let opts = DialOpts::peer_id(peer).addresses(addrs.clone()).build();
                        if let Err(e) = self.swarm.dial(opts) {
                            debug!(%peer, error = %e, "dial of mdns peer not started");
                        }
                    }
                    self.emit(NetworkEvent::PeerDiscovered {
                        peer,
                        addresses: addrs,
                    });
                }
            }
            mdns::Event::Expired(list) => {
                for (peer, addr) in list {
                    self.swarm.behaviour_mut().kad.remove_address(&peer, &addr);
                    let now_empty = match self.peers.get_mut(&peer) {
                        Some(rec) => {
                            rec.addresses.remove(&addr.to_string());
                            rec.addresses.is_empty()
                        }
                        None => false,
                    };
                    if now_empty {
                        debug!(%peer, "mdns peer expired");
                        self.peers.remove(&peer);
                        self.emit(NetworkEvent::PeerExpired { peer });
                    }
                }
            }
        }
    }

    fn on_kad(&mut self, event: kad::Event) {
        match event {
            kad::Event::RoutingUpdated { peer, .. } => {
                trace!(%peer, "routing table updated");
            }
            kad::Event::InboundRequest { request } => self.on_kad_inbound(request),
            kad::Event::OutboundQueryProgressed {
                id, result, step, ..
            } => {
                self.on_kad_progress(id, result);
                if step.last {
                    self.on_kad_finished(id);
                }
            }
            _ => {}
        }
    }

    fn on_kad_inbound(&mut self, request: kad::InboundRequest) {
        match request {
            kad::InboundRequest::PutRecord {
                source,
                record: Some(record),
                ..
            } => {
                if let Err(e) = self.validators.validate(&record.key.to_vec(), &record.value) {
                    debug!(%source, error = %e, "dropping invalid record");
                    return;
                }
                if let Err(e) = self.swarm.behaviour_mut().kad.store_mut().put(record) {
                    warn!(error = %e, "failed to store record");
                }
            }
            kad::InboundRequest::AddProvider {
                record: Some(provider),
            } => {
                if let Err(e) = self
                    .swarm
                    .behaviour_mut()
                    .kad
                    .store_mut()
                    .add_provider(provider)
                {
                    debug!(error = %e, "failed to store provider");
                }
            }
            _ => {}
        }
    }

    fn on_kad_progress(&mut self, id: QueryId, result: kad::QueryResult) {
        match result {
            kad::QueryResult::GetClosestPeers(Ok(ok)) => {
                for info in &ok.peers {
                    self.note_peer(info.peer_id, &info.addrs);
                }
                if let Some((target, reply)) = self.pending_find_peer.remove(&id) {
                    let found: Vec<Multiaddr> = ok
                        .peers
                        .iter()
                        .find(|p| p.peer_id == target)
                        .map(|p| p.addrs.clone())
                        .unwrap_or_default();
                    let found = if found.is_empty() {
                        self.cached_addrs(&target)
                    } else {
                        found
                    };
                    let result = if found.is_empty() {
                        Err(NetError::Routing(format!("peer {target} not found")))
                    } else {
                        Ok(found)
                    };
                    let _ = reply.send(result);
                } else {
                    debug!(found = ok.peers.len(), "random walk finished");
                }
            }
            kad::QueryResult::GetClosestPeers(Err(kad::GetClosestPeersError::Timeout { .. })) => {
                if let Some((_, reply)) = self.pending_find_peer.remove(&id) {
                    let _ = reply.send(Err(NetError::Timeout {
                        operation: "find_peer",
                        after: self.lookup_timeout,
                    }));
                }
            }
            kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                providers,
                ..
            })) => {
                let mut closed = false;
                if let Some(q) = self.pending_providers.get_mut(&id) {
                    for peer in providers {
                        if q.seen.insert(peer) && q.tx.try_send(peer).is_err() {
                            closed = q.tx.is_closed();
                        }
                    }
                }
                if closed {
                    self.pending_providers.remove(&id);
                    if let Some(mut q) = self.swarm.behaviour_mut().kad.query_mut(&id) {
                        q.finish();
                    }
                }
            }
            kad::QueryResult::GetProviders(_) => {}
            kad::QueryResult::GetRecord(Ok(kad::GetRecordOk::FoundRecord(found))) => {
                if let Some((values, _)) = self.pending_records.get_mut(&id) {
                    values.push(found.record.value);
                }
            }
            kad::QueryResult::GetRecord(_) => {}
            kad::QueryResult::PutRecord(result) => {
                debug!(ok = result.is_ok(), "record replication finished");
            }
            kad::QueryResult::StartProviding(result) => {
                debug!(ok = result.is_ok(), "provider announcement finished");
            }
            kad::QueryResult::Bootstrap(result) => {
                trace!(ok = result.is_ok(), "kademlia bootstrap step");
            }
            _ => {}
        }
    }

    fn on_kad_finished(&mut self, id: QueryId) {
        if let Some((target, reply)) = self.pending_find_peer.remove(&id) {
            let _ = reply.send(Err(NetError::Routing(format!("peer {target} not found"))));
        }
        self.pending_providers.remove(&id);
        if let Some((values, reply)) = self.pending_records.remove(&id) {
            let _ = reply.send(values);
        }
    }

    fn on_gossipsub(&mut self, event: gossipsub::Event) {
        match event {
            gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            } => {
                let topic = message.topic.as_str().to_string();
                let source = message.source.unwrap_or(propagation_source);
                trace!(%topic, %source, size = message.data.len(), "gossip message");
                let event = PubsubEvent::Message {
                    topic: topic.clone(),
                    source,
                    data: message.data,
                };
                self.deliver(&topic, event);
            }
            gossipsub::Event::Subscribed { peer_id, topic } => {
                debug!(peer = %peer_id, topic = %topic, "peer joined topic");
                self.deliver(topic.as_str(), PubsubEvent::PeerJoined { peer: peer_id });
            }
            _ => {}
        }
    }

    fn on_blocks(&mut self, event: request_response::Event<BlockRequest, BlockResponse>) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => self.serve_block(peer, request, channel),
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some(reply) = self.pending_blocks.remove(&request_id) {
                        let data = match response {
                            BlockResponse::Found(bytes) => Some(Bytes::from(bytes)),
                            BlockResponse::NotFound => None,
                        };
                        let _ = reply.send(Ok(data));
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                debug!(%peer, error = %error, "block request failed");
                if let Some(reply) = self.pending_blocks.remove(&request_id) {
                    let _ = reply.send(Err(NetError::Dial {
                        target: peer.to_string(),
                        reason: error.to_string(),
                    }));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!(%peer, error = %error, "inbound block request failed");
            }
            _ => {}
        }
    }

    fn serve_block(&mut self, peer: PeerId, request: BlockRequest, channel: ResponseChannel<BlockResponse>) {
        let BlockRequest::Get(id) = request;
        let Some(store) = self.blocks.clone() else {
            let _ = self
                .swarm
                .behaviour_mut()
                .blocks
                .send_response(channel, BlockResponse::NotFound);
            return;
        };
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let response = match store.get(id).await {
                Ok(Some(data)) => BlockResponse::Found(data.to_vec()),
                Ok(None) => BlockResponse::NotFound,
                Err(e) => {
                    warn!(%peer, %id, error = %e, "failed to read requested block");
                    BlockResponse::NotFound
                }
            };
            let _ = internal
                .send(Command::RespondBlock { channel, response })
                .await;
        });
    }
}
