//! Shared test harness for Weft integration tests.
//!
//! Provides [`MemoryNetwork`], an in-process stand-in for gossip and block
//! exchange with partition injection, and [`ReplicaCluster`], N replicas of
//! one database wired through it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use weft_logdb::{AccessPolicy, Database, FetchRetry, OpenOptions};
use weft_net::{BlockExchange, Broadcast, NetError, NodeIdentity, PeerId, PubsubEvent, Subscription};
use weft_store::{BlockStore, MemoryStore};
use weft_types::{ContentId, DbAddress, DbType, EntryId, NodeId};

const SUBSCRIBER_QUEUE: usize = 256;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

// =========================================================================
// In-memory network
// =========================================================================

struct Member {
    peer: PeerId,
    store: Arc<dyn BlockStore>,
    down: bool,
}

struct TopicSub {
    member: usize,
    topic: String,
    tx: mpsc::Sender<PubsubEvent>,
}

#[derive(Default)]
struct NetState {
    members: Vec<Member>,
    subs: Vec<TopicSub>,
    delivered: usize,
}

/// Gossip and block exchange between in-process members.
///
/// A member marked down neither sends nor receives messages and cannot
/// fetch blocks. Bringing it back up makes it and every peer sharing a
/// topic see each other join, the way a reconnect does on a real network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a member whose blocks live in `store`.
    pub fn join(&self, peer: PeerId, store: Arc<dyn BlockStore>) -> Arc<MemberNet> {
        let mut state = self.lock();
        state.members.push(Member {
            peer,
            store,
            down: false,
        });
        Arc::new(MemberNet {
            net: self.clone(),
            index: state.members.len() - 1,
            peer,
        })
    }

    /// Cut a member off, or reconnect it.
    pub fn set_down(&self, member: usize, down: bool) {
        let mut state = self.lock();
        let was_down = std::mem::replace(&mut state.members[member].down, down);
        if !was_down || down {
            return;
        }

        let state = &*state;
        for mine in state.subs.iter().filter(|s| s.member == member) {
            for theirs in state
                .subs
                .iter()
                .filter(|s| s.topic == mine.topic && s.member != member)
                .filter(|s| !state.members[s.member].down)
            {
                let _ = theirs.tx.try_send(PubsubEvent::PeerJoined {
                    peer: state.members[member].peer,
                });
                let _ = mine.tx.try_send(PubsubEvent::PeerJoined {
                    peer: state.members[theirs.member].peer,
                });
            }
        }
    }

    pub fn is_down(&self, member: usize) -> bool {
        self.lock().members[member].down
    }

    /// Messages delivered to subscribers so far.
    pub fn delivered(&self) -> usize {
        self.lock().delivered
    }
}

/// One member's view of a [`MemoryNetwork`].
pub struct MemberNet {
    net: MemoryNetwork,
    index: usize,
    peer: PeerId,
}

impl MemberNet {
    pub fn peer(&self) -> PeerId {
        self.peer
    }
}

#[async_trait]
impl Broadcast for MemberNet {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), NetError> {
        let mut state = self.net.lock();
        state.subs.retain(|s| !s.tx.is_closed());
        if state.members[self.index].down {
            return Ok(());
        }

        let mut delivered = 0;
        for sub in state
            .subs
            .iter()
            .filter(|s| s.topic == topic && s.member != self.index)
            .filter(|s| !state.members[s.member].down)
        {
            let event = PubsubEvent::Message {
                topic: topic.to_string(),
                source: self.peer,
                data: data.clone(),
            };
            if sub.tx.try_send(event).is_ok() {
                delivered += 1;
            }
        }
        state.delivered += delivered;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, NetError> {
        let mut state = self.net.lock();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);

        if !state.members[self.index].down {
            for sub in state
                .subs
                .iter()
                .filter(|s| s.topic == topic && s.member != self.index)
                .filter(|s| !state.members[s.member].down)
            {
                let _ = sub.tx.try_send(PubsubEvent::PeerJoined { peer: self.peer });
            }
        }
        state.subs.push(TopicSub {
            member: self.index,
            topic: topic.to_string(),
            tx,
        });
        Ok(Subscription::new(topic, rx))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), NetError> {
        let index = self.index;
        self.net
            .lock()
            .subs
            .retain(|s| !(s.member == index && s.topic == topic));
        Ok(())
    }
}

#[async_trait]
impl BlockExchange for MemberNet {
    async fn fetch(&self, id: ContentId, hint: Option<PeerId>) -> Result<Option<Bytes>, NetError> {
        let candidates: Vec<Arc<dyn BlockStore>> = {
            let state = self.net.lock();
            if state.members[self.index].down {
                return Err(NetError::Timeout {
                    operation: "block fetch",
                    after: Duration::ZERO,
                });
            }
            let mut up: Vec<&Member> = state
                .members
                .iter()
                .enumerate()
                .filter(|(i, m)| *i != self.index && !m.down)
                .map(|(_, m)| m)
                .collect();
            up.sort_by_key(|m| Some(m.peer) != hint);
            up.into_iter().map(|m| m.store.clone()).collect()
        };

        for store in candidates {
            match store.get(id).await {
                Ok(Some(bytes)) => return Ok(Some(bytes)),
                Ok(None) => {}
                Err(e) => return Err(NetError::Routing(e.to_string())),
            }
        }
        Ok(None)
    }

    async fn provide(&self, _id: ContentId) -> Result<(), NetError> {
        Ok(())
    }
}

// =========================================================================
// Replica cluster
// =========================================================================

/// Retry schedule short enough for tests.
pub fn fast_retry() -> FetchRetry {
    FetchRetry {
        attempts: 3,
        first_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
    }
}

/// Deterministic identity for replica `i`.
pub fn identity(i: usize) -> NodeIdentity {
    let seed = u8::try_from(i + 1).unwrap_or(u8::MAX);
    NodeIdentity::from_secret([seed; 32]).unwrap_or_else(|e| panic!("identity {i}: {e}"))
}

/// One replica: its database, identity and local block store.
pub struct Replica {
    pub db: Database,
    pub identity: NodeIdentity,
    pub store: Arc<MemoryStore>,
}

/// N replicas of one database over a [`MemoryNetwork`].
pub struct ReplicaCluster {
    net: MemoryNetwork,
    address: DbAddress,
    db_type: DbType,
    replicas: Vec<Replica>,
}

impl ReplicaCluster {
    /// `n` replicas of a key-value database with an open write policy.
    pub async fn new(n: usize) -> Self {
        Self::with_type(n, DbType::KeyValue).await
    }

    pub async fn with_type(n: usize, db_type: DbType) -> Self {
        let mut cluster = Self {
            net: MemoryNetwork::new(),
            address: DbAddress::new("/weft", "cluster-test"),
            db_type,
            replicas: Vec::new(),
        };
        for _ in 0..n {
            cluster.add_replica(AccessPolicy::default(), false).await;
        }
        cluster
    }

    /// Open one more replica. Returns its index.
    pub async fn add_replica(&mut self, policy: AccessPolicy, read_only: bool) -> usize {
        let i = self.replicas.len();
        let identity = identity(i);
        let store = Arc::new(MemoryStore::unbounded());
        let member = self.net.join(identity.peer_id(), store.clone());

        let options = OpenOptions::new(self.address.clone())
            .db_type(self.db_type)
            .policy(policy)
            .read_only(read_only)
            .fetch_retry(fast_retry());
        let db = Database::open(options, &identity, store.clone(), member.clone(), member)
            .await
            .unwrap_or_else(|e| panic!("open replica {i}: {e}"));

        self.replicas.push(Replica {
            db,
            identity,
            store,
        });
        i
    }

    pub fn db(&self, i: usize) -> &Database {
        &self.replicas[i].db
    }

    pub fn node_id(&self, i: usize) -> NodeId {
        self.replicas[i].identity.node_id()
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.net
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Cut replica `i` off the network.
    pub fn partition(&self, i: usize) {
        self.net.set_down(i, true);
    }

    /// Reconnect replica `i`.
    pub fn heal(&self, i: usize) {
        self.net.set_down(i, false);
    }

    /// Wait until replica `i` reads `expected` for `key`.
    pub async fn wait_for_value(
        &self,
        i: usize,
        key: &str,
        expected: Option<&[u8]>,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(value) = self.db(i).get(key).await
                && value.as_deref() == expected
            {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait until every connected replica has the same heads.
    pub async fn wait_converged(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.converged().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn converged(&self) -> bool {
        let mut reference: Option<Vec<EntryId>> = None;
        for (i, replica) in self.replicas.iter().enumerate() {
            if self.net.is_down(i) {
                continue;
            }
            let heads = replica.db.heads().await;
            match &reference {
                None => reference = Some(heads),
                Some(r) if *r != heads => return false,
                Some(_) => {}
            }
        }
        true
    }

    /// Close every replica.
    pub async fn close(&self) {
        for replica in &self.replicas {
            replica.db.close().await;
        }
    }
}

/// Deterministic pseudo-random sequence for chaos tests.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn next_below(&mut self, n: usize) -> usize {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 33) as usize % n.max(1)
    }
}
