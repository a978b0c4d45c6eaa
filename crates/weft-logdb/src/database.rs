//! The database state machine: open, put/get, close.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError};

use bytes::Bytes;
use ed25519_dalek::SigningKey;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};
use weft_net::{BlockExchange, Broadcast, NodeIdentity};
use weft_store::BlockStore;
use weft_types::{DbAddress, DbType, EntryId};

use crate::access::AccessPolicy;
use crate::entry::{LogEntry, Operation};
use crate::error::LogDbError;
use crate::message::DbMessage;
use crate::replica::ReplicaState;
use crate::replicator::{FetchRetry, Replicator};
use crate::store::HeadsFile;

type Result<T> = std::result::Result<T, LogDbError>;

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle of a local replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// Parameters for [`Database::open`].
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Address of the database, also its pub/sub topic.
    pub address: DbAddress,
    /// Event log or key-value.
    pub db_type: DbType,
    /// Write allow-list.
    pub policy: AccessPolicy,
    /// Open without write access even if the policy would allow it.
    pub read_only: bool,
    /// Where to persist heads. `None` keeps them in memory only.
    pub data_dir: Option<PathBuf>,
    /// Retry schedule for fetching remote entries.
    pub fetch_retry: FetchRetry,
}

impl OpenOptions {
    /// Defaults for `address`: event log, open policy, writable, in memory.
    pub fn new(address: DbAddress) -> Self {
        Self {
            address,
            db_type: DbType::default(),
            policy: AccessPolicy::default(),
            read_only: false,
            data_dir: None,
            fetch_retry: FetchRetry::default(),
        }
    }

    pub fn db_type(mut self, db_type: DbType) -> Self {
        self.db_type = db_type;
        self
    }

    pub fn policy(mut self, policy: AccessPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    pub fn fetch_retry(mut self, fetch_retry: FetchRetry) -> Self {
        self.fetch_retry = fetch_retry;
        self
    }
}

/// Sent to [`Database::updates`] subscribers after a remote merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbUpdate {
    /// Entries the merge added.
    pub applied: usize,
    /// Heads after the merge.
    pub heads: Vec<EntryId>,
}

/// State shared between a database handle and its replicator.
pub(crate) struct Shared {
    pub(crate) address: DbAddress,
    db_type: DbType,
    writable: bool,
    signing_key: SigningKey,
    state: std::sync::Mutex<DbState>,
    /// The merge lock.
    pub(crate) replica: Mutex<ReplicaState>,
    append: Mutex<()>,
    persist: Mutex<()>,
    blocks: RwLock<Option<Arc<dyn BlockStore>>>,
    broadcast: Arc<dyn Broadcast>,
    pub(crate) exchange: Arc<dyn BlockExchange>,
    heads_file: Option<HeadsFile>,
    pub(crate) updates: broadcast::Sender<DbUpdate>,
    pub(crate) fetch_retry: FetchRetry,
}

impl Shared {
    pub(crate) fn state(&self) -> DbState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: DbState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            DbState::Open => Ok(()),
            other => Err(LogDbError::NotOpen(other)),
        }
    }

    /// The block store, unless the database has released it.
    pub(crate) async fn blocks(&self) -> Result<Arc<dyn BlockStore>> {
        self.blocks
            .read()
            .await
            .clone()
            .ok_or_else(|| LogDbError::NotOpen(self.state()))
    }

    pub(crate) async fn heads(&self) -> Vec<EntryId> {
        self.replica.lock().await.heads()
    }

    /// Write the current heads to the heads file, if there is one.
    pub(crate) async fn persist_heads(&self) -> Result<()> {
        let Some(file) = &self.heads_file else {
            return Ok(());
        };
        let _guard = self.persist.lock().await;
        let heads = self.heads().await;
        file.save(&heads).await
    }

    /// Publish our heads on the topic. Failures are logged.
    pub(crate) async fn announce(&self) {
        let message = DbMessage::Heads {
            address: self.address.clone(),
            heads: self.heads().await,
        };
        let result = match message.encode() {
            Ok(bytes) => self
                .broadcast
                .publish(&self.address.topic(), bytes)
                .await
                .map_err(LogDbError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(address = %self.address, error = %e, "failed to publish heads");
        }
    }
}

/// A replicated log database.
pub struct Database {
    shared: Arc<Shared>,
    replicator: Mutex<Option<Replicator>>,
}

impl Database {
    /// Open (or create) the database at `options.address`.
    ///
    /// Fails with [`LogDbError::Access`] when the local node is not
    /// allow-listed, unless `read_only` is set.
    pub async fn open(
        options: OpenOptions,
        identity: &NodeIdentity,
        blocks: Arc<dyn BlockStore>,
        pubsub: Arc<dyn Broadcast>,
        exchange: Arc<dyn BlockExchange>,
    ) -> Result<Self> {
        let OpenOptions {
            address,
            db_type,
            policy,
            read_only,
            data_dir,
            fetch_retry,
        } = options;
        debug!(%address, %db_type, "opening database");

        let allowed = policy.allows(&identity.node_id());
        if !allowed && !read_only {
            return Err(LogDbError::Access(format!(
                "{} is not allowed to write to {address}",
                identity.derived_id()
            )));
        }

        let heads_file = data_dir.map(|dir| HeadsFile::new(dir, &address.name));
        let heads = match &heads_file {
            Some(file) => file.load().await?,
            None => Vec::new(),
        };
        let replica = rebuild(&address, policy, &heads, blocks.as_ref()).await;

        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            address: address.clone(),
            db_type,
            writable: allowed && !read_only,
            signing_key: identity.signing_key().clone(),
            state: std::sync::Mutex::new(DbState::Opening),
            replica: Mutex::new(replica),
            append: Mutex::new(()),
            persist: Mutex::new(()),
            blocks: RwLock::new(Some(blocks)),
            broadcast: pubsub,
            exchange,
            heads_file,
            updates,
            fetch_retry,
        });

        let subscription = shared.broadcast.subscribe(&address.topic()).await?;
        let replicator = Replicator::spawn(shared.clone(), subscription);
        shared.set_state(DbState::Open);

        let entries = shared.replica.lock().await.len();
        info!(
            %address,
            %db_type,
            entries,
            writable = shared.writable,
            "database opened"
        );
        shared.announce().await;

        Ok(Self {
            shared,
            replicator: Mutex::new(Some(replicator)),
        })
    }

    /// Append a put. Returns the new entry id.
    pub async fn put(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Result<EntryId> {
        self.append(Operation::Put {
            key: key.into(),
            value: value.into(),
        })
        .await
    }

    /// Append a delete. Only key-value databases support it.
    pub async fn delete(&self, key: impl Into<String>) -> Result<EntryId> {
        if self.shared.db_type == DbType::Events {
            return Err(LogDbError::Unsupported("delete"));
        }
        self.append(Operation::Delete { key: key.into() }).await
    }

    async fn append(&self, op: Operation) -> Result<EntryId> {
        let shared = &self.shared;
        let _guard = shared.append.lock().await;
        shared.ensure_open()?;
        if !shared.writable {
            return Err(LogDbError::ReadOnly(shared.address.to_string()));
        }

        let (predecessors, clock) = {
            let replica = shared.replica.lock().await;
            (replica.heads(), replica.next_clock())
        };
        let entry = LogEntry::new_signed(
            &shared.address.name,
            op,
            predecessors,
            clock,
            &shared.signing_key,
        )?;
        let bytes = entry.encode()?;
        let id = EntryId::from_data(&bytes);

        shared.blocks().await?.put(id.into(), Bytes::from(bytes)).await?;
        shared.replica.lock().await.insert(entry)?;
        shared.persist_heads().await?;

        if let Err(e) = shared.exchange.provide(id.into()).await {
            debug!(%id, error = %e, "provider announcement failed");
        }
        shared.announce().await;

        debug!(%id, clock, "appended entry");
        Ok(id)
    }

    /// Current value of `key`. `None` if absent or deleted.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.shared.ensure_open()?;
        let replica = self.shared.replica.lock().await;
        Ok(replica.value(key).map(<[u8]>::to_vec))
    }

    /// Visible operations in `(clock, id)` order.
    pub async fn events(&self) -> Result<Vec<(EntryId, Operation)>> {
        self.shared.ensure_open()?;
        let replica = self.shared.replica.lock().await;
        Ok(replica
            .entries_in_order()
            .into_iter()
            .map(|(id, entry)| (id, entry.op.clone()))
            .collect())
    }

    /// Current heads.
    pub async fn heads(&self) -> Vec<EntryId> {
        self.shared.heads().await
    }

    pub fn address(&self) -> &DbAddress {
        &self.shared.address
    }

    pub fn db_type(&self) -> DbType {
        self.shared.db_type
    }

    pub fn state(&self) -> DbState {
        self.shared.state()
    }

    /// Whether local writes are accepted.
    pub fn is_writable(&self) -> bool {
        self.shared.writable
    }

    /// Notifications for remote merges that changed the replica.
    pub fn updates(&self) -> broadcast::Receiver<DbUpdate> {
        self.shared.updates.subscribe()
    }

    /// Flush local appends, stop replicating and release the store.
    ///
    /// A no-op unless the database is open.
    pub async fn close(&self) {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *state != DbState::Open {
                return;
            }
            *state = DbState::Closing;
        }

        let _guard = self.shared.append.lock().await;
        if let Some(replicator) = self.replicator.lock().await.take() {
            replicator.stop().await;
        }
        let topic = self.shared.address.topic();
        if let Err(e) = self.shared.broadcast.unsubscribe(&topic).await {
            warn!(%topic, error = %e, "failed to unsubscribe");
        }
        self.shared.blocks.write().await.take();

        self.shared.set_state(DbState::Closed);
        info!(address = %self.shared.address, "database closed");
    }
}

/// Walk back from `heads` through the local block store and rebuild the
/// replica. Entries that cannot be read are logged and skipped.
async fn rebuild(
    address: &DbAddress,
    policy: AccessPolicy,
    heads: &[EntryId],
    blocks: &dyn BlockStore,
) -> ReplicaState {
    let mut replica = ReplicaState::new(policy);
    if heads.is_empty() {
        return replica;
    }

    let mut found: HashMap<EntryId, LogEntry> = HashMap::new();
    let mut queue: VecDeque<EntryId> = heads.iter().copied().collect();
    while let Some(id) = queue.pop_front() {
        if found.contains_key(&id) {
            continue;
        }
        match blocks.get(id.into()).await {
            Ok(Some(bytes)) => match LogEntry::decode(&bytes) {
                Ok(entry) if entry.db == address.name => {
                    queue.extend(entry.predecessors.iter().copied());
                    found.insert(id, entry);
                }
                Ok(entry) => warn!(%id, db = %entry.db, "local entry belongs to another database"),
                Err(e) => warn!(%id, error = %e, "local entry undecodable"),
            },
            Ok(None) => warn!(%id, "local entry missing"),
            Err(e) => warn!(%id, error = %e, "local entry unreadable"),
        }
    }

    let report = replica.merge(found.into_values().collect());
    if report.missing > 0 || report.rejected > 0 {
        warn!(
            %address,
            missing = report.missing,
            rejected = report.rejected,
            "local history incomplete"
        );
    }
    debug!(%address, entries = report.applied, "replica rebuilt");
    replica
}
