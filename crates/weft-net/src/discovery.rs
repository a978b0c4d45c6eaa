//! Peer discovery: bootstrap dialing, random walks and reconnection.
//!
//! mDNS and identify are handled inside the swarm task. This component adds
//! the parts that run on timers:
//!
//! - dial the bootstrap list once at start;
//! - run a Kademlia random walk every `random_walk_interval`;
//! - re-dial bootstrap peers that disconnect, with exponential backoff.
//!
//! None of these can fail startup. A node with no reachable bootstrap peer
//! keeps running on local discovery alone.

use std::collections::HashMap;
use std::time::Duration;

use libp2p::{Multiaddr, PeerId};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::NetConfig;
use crate::error::NetError;
use crate::service::{NetworkEvent, NetworkHandle, peer_of};

const FIRST_RETRY: Duration = Duration::from_secs(5);
const MAX_RETRY: Duration = Duration::from_secs(300);
const MAX_RETRIES: u32 = 10;
const RECONNECT_TICK: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Retry {
    addrs: Vec<Multiaddr>,
    attempts: u32,
    delay: Duration,
    due: Instant,
}

/// Re-dials disconnected peers with exponential backoff.
///
/// The first retry happens [`FIRST_RETRY`] after the disconnect; each further
/// retry doubles the delay up to [`MAX_RETRY`]. A peer is forgotten after
/// [`MAX_RETRIES`] attempts or as soon as it reconnects.
#[derive(Debug, Default)]
pub struct PeerReconnector {
    waiting: HashMap<PeerId, Retry>,
}

impl PeerReconnector {
    /// Create an empty reconnector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `peer`. Keeps existing backoff if already tracked.
    pub fn disconnected(&mut self, peer: PeerId, addrs: Vec<Multiaddr>, now: Instant) {
        if addrs.is_empty() || self.waiting.contains_key(&peer) {
            return;
        }
        debug!(%peer, "scheduling reconnect");
        self.waiting.insert(
            peer,
            Retry {
                addrs,
                attempts: 0,
                delay: FIRST_RETRY,
                due: now + FIRST_RETRY,
            },
        );
    }

    /// Stop tracking `peer`.
    pub fn connected(&mut self, peer: &PeerId) {
        if self.waiting.remove(peer).is_some() {
            debug!(%peer, "peer back, reconnect cancelled");
        }
    }

    /// Peers whose next attempt is due at `now`. Advances their backoff and
    /// drops peers that ran out of attempts.
    pub fn due(&mut self, now: Instant) -> Vec<(PeerId, Vec<Multiaddr>)> {
        let mut out = Vec::new();
        self.waiting.retain(|peer, retry| {
            if now < retry.due {
                return true;
            }
            if retry.attempts >= MAX_RETRIES {
                warn!(%peer, attempts = retry.attempts, "giving up on peer");
                return false;
            }
            retry.attempts += 1;
            out.push((*peer, retry.addrs.clone()));
            retry.delay = (retry.delay * 2).min(MAX_RETRY);
            retry.due = now + retry.delay;
            true
        });
        out
    }

    /// Number of peers waiting for a retry.
    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    /// Whether no peer is waiting.
    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

/// The discovery component.
pub struct Discovery {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Discovery {
    /// Start bootstrap dialing, random walks and reconnection.
    pub async fn start(handle: NetworkHandle, config: &NetConfig) -> Result<Self, NetError> {
        let events = handle.events()?;
        let bootstrap = config.bootstrap_multiaddrs();
        let walk_every = config.random_walk_interval;
        let (shutdown, shutdown_rx) = watch::channel(false);

        info!(
            bootstrap = bootstrap.len(),
            random_walk_secs = walk_every.as_secs(),
            "discovery started"
        );
        let task = tokio::spawn(run(handle, bootstrap, walk_every, events, shutdown_rx));
        Ok(Self {
            shutdown,
            task: Some(task),
        })
    }

    /// Stop all discovery timers. Idempotent.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let _ = self.shutdown.send(true);
        if let Err(e) = task.await {
            warn!(error = %e, "discovery task ended abnormally");
        }
        info!("discovery stopped");
    }
}

/// Dial every bootstrap address concurrently. Returns the peers reached and
/// the addresses of those that could be identified but not reached.
async fn dial_bootstrap(
    handle: &NetworkHandle,
    addrs: Vec<Multiaddr>,
) -> HashMap<PeerId, Vec<Multiaddr>> {
    let attempts = addrs.into_iter().map(|addr| async move {
        let result = handle.dial(addr.clone()).await;
        (addr, result)
    });

    let mut known = HashMap::new();
    let mut reached = 0usize;
    for (addr, result) in futures::future::join_all(attempts).await {
        match result {
            Ok(peer) => {
                reached += 1;
                info!(%peer, %addr, "connected to bootstrap peer");
                known.entry(peer).or_insert_with(Vec::new).push(addr);
            }
            Err(e) => {
                warn!(%addr, error = %e, "bootstrap peer unreachable");
                if let Some(peer) = peer_of(&addr) {
                    known.entry(peer).or_insert_with(Vec::new).push(addr);
                }
            }
        }
    }
    if reached == 0 {
        info!("no bootstrap peer reachable, relying on local discovery");
    }
    known
}

async fn run(
    handle: NetworkHandle,
    bootstrap: Vec<Multiaddr>,
    walk_every: Duration,
    mut events: broadcast::Receiver<NetworkEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reconnector = PeerReconnector::new();

    let bootstrap_peers = tokio::select! {
        peers = dial_bootstrap(&handle, bootstrap) => peers,
        _ = shutdown.changed() => return,
    };
    let connected = handle.connected_peers().await.unwrap_or_default();
    for (peer, addrs) in &bootstrap_peers {
        if !connected.contains(peer) {
            reconnector.disconnected(*peer, addrs.clone(), Instant::now());
        }
    }

    let mut walk = tokio::time::interval(walk_every);
    let mut tick = tokio::time::interval(RECONNECT_TICK);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = walk.tick() => {
                if let Err(e) = handle.random_walk().await {
                    debug!(error = %e, "random walk not started");
                    break;
                }
            }
            _ = tick.tick() => {
                for (peer, addrs) in reconnector.due(Instant::now()) {
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle.dial_peer(peer, addrs).await {
                            debug!(%peer, error = %e, "reconnect attempt failed");
                        }
                    });
                }
            }
            event = events.recv() => match event {
                Ok(NetworkEvent::PeerConnected { peer, .. }) => reconnector.connected(&peer),
                Ok(NetworkEvent::PeerDisconnected { peer, remaining: 0 }) => {
                    if let Some(addrs) = bootstrap_peers.get(&peer) {
                        reconnector.disconnected(peer, addrs.clone(), Instant::now());
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "discovery lagged behind network events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("discovery loop exited");
}
