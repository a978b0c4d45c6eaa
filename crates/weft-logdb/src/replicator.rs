//! Background replication for one database.
//!
//! Listens on the database topic. A heads announcement starts a merge job
//! that fetches every unknown entry reachable from the announced heads and
//! applies the batch under the merge lock. A peer joining the topic gets our
//! heads so it can catch up.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use weft_net::{PeerId, PubsubEvent, Subscription};
use weft_types::{ContentId, EntryId};

use crate::database::{DbUpdate, Shared};
use crate::entry::LogEntry;
use crate::error::LogDbError;
use crate::message::DbMessage;

type Result<T> = std::result::Result<T, LogDbError>;

/// Most entries a single merge job will fetch.
pub const MAX_WALK: usize = 10_000;

/// Retry schedule for fetching one remote entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRetry {
    /// Attempts before the entry is reported unavailable.
    pub attempts: u32,
    /// Wait after the first failed attempt.
    pub first_backoff: Duration,
    /// Upper bound for the wait between attempts.
    pub max_backoff: Duration,
}

impl Default for FetchRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            first_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl FetchRetry {
    /// Wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.first_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Handle to a running replicator task.
pub(crate) struct Replicator {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Replicator {
    pub(crate) fn spawn(shared: Arc<Shared>, subscription: Subscription) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(shared, subscription, shutdown_rx));
        Self {
            shutdown,
            task: Some(task),
        }
    }

    /// Stop the task and abort in-flight merge jobs.
    pub(crate) async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "replicator ended abnormally");
        }
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(shared: Arc<Shared>, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
    let mut jobs: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = subscription.recv() => match event {
                None => {
                    debug!(address = %shared.address, "subscription closed");
                    break;
                }
                Some(PubsubEvent::Message { source, data, .. }) => match DbMessage::decode(&data) {
                    Ok(DbMessage::Heads { address, heads }) if address == shared.address => {
                        jobs.spawn(merge_job(shared.clone(), heads, Some(source)));
                    }
                    Ok(DbMessage::Heads { address, .. }) => {
                        debug!(%address, "ignoring heads of another database");
                    }
                    Err(e) => warn!(%source, error = %e, "undecodable database message"),
                },
                Some(PubsubEvent::PeerJoined { peer }) => {
                    debug!(%peer, address = %shared.address, "peer joined, announcing heads");
                    shared.announce().await;
                }
            },
            Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                if let Err(e) = joined
                    && e.is_panic()
                {
                    error!(error = %e, "merge job panicked");
                }
            }
        }
    }

    jobs.abort_all();
    while jobs.join_next().await.is_some() {}
    debug!(address = %shared.address, "replicator stopped");
}

/// Fetch and apply everything reachable from `heads` that we lack.
pub(crate) async fn merge_job(shared: Arc<Shared>, heads: Vec<EntryId>, source: Option<PeerId>) {
    let unknown: Vec<EntryId> = {
        let replica = shared.replica.lock().await;
        heads.iter().filter(|h| !replica.contains(h)).copied().collect()
    };

    // A truncated walk leaves its blocks in the local store, so the next
    // pass reads them back for free and reaches further towards the roots.
    let mut pending = !unknown.is_empty();
    while pending {
        let walked = walk(&shared, unknown.clone(), source).await;
        pending = walked.truncated && walked.downloaded > 0;
        if walked.entries.is_empty() {
            break;
        }
        let report = shared.replica.lock().await.merge(walked.entries);
        if report.applied > 0 {
            if let Err(e) = shared.persist_heads().await {
                warn!(address = %shared.address, error = %e, "failed to persist heads");
            }
            let heads = shared.heads().await;
            info!(
                address = %shared.address,
                applied = report.applied,
                heads = heads.len(),
                "merged remote entries"
            );
            let _ = shared.updates.send(DbUpdate {
                applied: report.applied,
                heads,
            });
        }
        if report.missing > 0 || report.rejected > 0 {
            debug!(missing = report.missing, rejected = report.rejected, "partial merge");
        }
    }

    // The sender lacks some of our entries: tell it our heads.
    let behind = !shared.replica.lock().await.delta_from(&heads).is_empty();
    if behind {
        shared.announce().await;
    }
}

/// Entries gathered by one [`walk`].
struct Walked {
    entries: Vec<LogEntry>,
    /// The remote fetch budget ran out before the walk reached known entries.
    truncated: bool,
    /// Entries this walk brought in from the network and kept locally.
    downloaded: usize,
}

/// Breadth-first walk from `start` towards the roots, loading each entry
/// not yet known. Stops at known entries and after [`MAX_WALK`] remote
/// fetches. Entries already in the local block store are free.
async fn walk(shared: &Shared, start: Vec<EntryId>, source: Option<PeerId>) -> Walked {
    let mut queue: VecDeque<EntryId> = start.into();
    let mut visited: HashSet<EntryId> = HashSet::new();
    let mut fetched: HashMap<EntryId, LogEntry> = HashMap::new();
    let mut remote_fetches = 0usize;
    let mut truncated = false;
    let mut downloaded = 0usize;

    while let Some(id) = queue.pop_front() {
        if !visited.insert(id) || shared.replica.lock().await.contains(&id) {
            continue;
        }
        let local = match has_local_block(shared, id).await {
            Ok(local) => local,
            Err(e) => {
                warn!(%id, error = %e, "block store unavailable");
                break;
            }
        };
        if !local {
            if remote_fetches >= MAX_WALK {
                warn!(limit = MAX_WALK, address = %shared.address, "history walk truncated");
                truncated = true;
                break;
            }
            remote_fetches += 1;
        }
        match fetch_entry(shared, id, source).await {
            Ok(Some(entry)) => {
                if !local && matches!(has_local_block(shared, id).await, Ok(true)) {
                    downloaded += 1;
                }
                queue.extend(entry.predecessors.iter().copied());
                fetched.insert(id, entry);
            }
            Ok(None) => warn!(%id, "entry unavailable"),
            Err(e) => warn!(%id, kind = %e.kind(), error = %e, "discarding entry"),
        }
    }

    Walked {
        entries: fetched.into_values().collect(),
        truncated,
        downloaded,
    }
}

async fn has_local_block(shared: &Shared, id: EntryId) -> Result<bool> {
    Ok(shared.blocks().await?.contains(ContentId::from(id)).await?)
}

/// Load one entry, from the local store if possible, else from the network.
///
/// Remote blocks are checked (hash, encoding, database, signature) and then
/// stored locally.
pub(crate) async fn fetch_entry(
    shared: &Shared,
    id: EntryId,
    hint: Option<PeerId>,
) -> Result<Option<LogEntry>> {
    let cid = ContentId::from(id);
    let blocks = shared.blocks().await?;

    let local = match blocks.get(cid).await {
        Ok(found) => found,
        Err(e) => {
            warn!(%id, error = %e, "local copy unusable, refetching");
            None
        }
    };
    let (bytes, remote) = match local {
        Some(bytes) => (bytes, false),
        None => match fetch_remote(shared, cid, hint).await? {
            Some(bytes) => (bytes, true),
            None => return Ok(None),
        },
    };

    let actual = ContentId::from_data(&bytes);
    if actual != cid {
        return Err(LogDbError::Integrity {
            expected: cid,
            actual,
        });
    }
    let entry = LogEntry::decode(&bytes)?;
    let reencoded = entry.id()?;
    if reencoded != id {
        return Err(LogDbError::Integrity {
            expected: cid,
            actual: reencoded.into(),
        });
    }
    if entry.db != shared.address.name {
        return Err(LogDbError::ForeignEntry { id, db: entry.db });
    }
    if !entry.verify_signature() {
        return Err(LogDbError::InvalidSignature(id));
    }

    if remote && let Err(e) = blocks.put(cid, bytes).await {
        warn!(%id, error = %e, "failed to store fetched entry");
    }
    Ok(Some(entry))
}

async fn fetch_remote(shared: &Shared, id: ContentId, hint: Option<PeerId>) -> Result<Option<Bytes>> {
    let retry = shared.fetch_retry;
    for attempt in 1..=retry.attempts {
        match shared.exchange.fetch(id, hint).await {
            Ok(Some(bytes)) => return Ok(Some(bytes)),
            Ok(None) => debug!(%id, attempt, "no peer has the entry yet"),
            Err(e) if e.kind().is_transient() => {
                debug!(%id, attempt, error = %e, "entry fetch failed");
            }
            Err(e) => return Err(e.into()),
        }
        if attempt < retry.attempts {
            tokio::time::sleep(retry.backoff(attempt)).await;
        }
    }
    Ok(None)
}
