//! Replica state: the known causal DAG, its heads and the materialized view.
//!
//! The view is last-writer-wins per key. Among the entries by allow-listed
//! authors, the one with the greatest `(clock, id)` decides the key. Because
//! that is a maximum over a set, the view depends only on which entries are
//! known, never on the order they arrived in.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use tracing::{debug, warn};
use weft_types::EntryId;

use crate::access::AccessPolicy;
use crate::entry::LogEntry;
use crate::error::LogDbError;

type Result<T> = std::result::Result<T, LogDbError>;

/// The current value of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Winner {
    /// Clock of the deciding entry.
    pub clock: u64,
    /// Id of the deciding entry.
    pub id: EntryId,
    /// The value, `None` if the deciding entry is a delete.
    pub value: Option<Vec<u8>>,
}

/// Outcome of [`ReplicaState::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    /// The entry was new.
    New,
    /// The entry was already known. Nothing changed.
    Known,
}

/// Outcome of [`ReplicaState::merge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Entries added to the DAG.
    pub applied: usize,
    /// Entries that were already known.
    pub known: usize,
    /// Entries rejected as invalid (signature, clock, encoding).
    pub rejected: usize,
    /// Entries left out because a predecessor is unknown.
    pub missing: usize,
}

/// Per-database replica state.
///
/// Owned by its database and only mutated under the database's merge lock.
#[derive(Debug)]
pub struct ReplicaState {
    policy: AccessPolicy,
    entries: HashMap<EntryId, LogEntry>,
    heads: BTreeSet<EntryId>,
    view: BTreeMap<String, Winner>,
}

impl ReplicaState {
    /// Empty replica governed by `policy`.
    pub fn new(policy: AccessPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
            heads: BTreeSet::new(),
            view: BTreeMap::new(),
        }
    }

    /// The access policy.
    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    /// Number of known entries, including ones excluded from the view.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entry is known.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `id` is known.
    pub fn contains(&self, id: &EntryId) -> bool {
        self.entries.contains_key(id)
    }

    /// Look up a known entry.
    pub fn entry(&self, id: &EntryId) -> Option<&LogEntry> {
        self.entries.get(id)
    }

    /// Entries with no known successor, in id order.
    pub fn heads(&self) -> Vec<EntryId> {
        self.heads.iter().copied().collect()
    }

    /// Clock for a new entry whose predecessors are the current heads.
    pub fn next_clock(&self) -> u64 {
        1 + self
            .heads
            .iter()
            .filter_map(|h| self.entries.get(h))
            .map(|e| e.clock)
            .max()
            .unwrap_or(0)
    }

    /// The materialized view.
    pub fn view(&self) -> &BTreeMap<String, Winner> {
        &self.view
    }

    /// Current value of `key`. `None` if absent or deleted.
    pub fn value(&self, key: &str) -> Option<&[u8]> {
        self.view.get(key).and_then(|w| w.value.as_deref())
    }

    /// Add one entry to the DAG.
    ///
    /// Checks, in order: already known, signature, predecessors present,
    /// clock. Entries by authors outside the allow-list are stored but not
    /// applied to the view.
    pub fn insert(&mut self, entry: LogEntry) -> Result<Inserted> {
        let id = entry.id()?;
        self.insert_with_id(id, entry)
    }

    fn insert_with_id(&mut self, id: EntryId, entry: LogEntry) -> Result<Inserted> {
        if self.entries.contains_key(&id) {
            return Ok(Inserted::Known);
        }

        if !entry.verify_signature() {
            return Err(LogDbError::InvalidSignature(id));
        }

        let missing: Vec<EntryId> = entry
            .predecessors
            .iter()
            .filter(|p| !self.entries.contains_key(*p))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(LogDbError::MissingPredecessors(missing));
        }

        let expected = 1 + entry
            .predecessors
            .iter()
            .filter_map(|p| self.entries.get(p))
            .map(|p| p.clock)
            .max()
            .unwrap_or(0);
        if entry.clock != expected {
            return Err(LogDbError::InvalidClock {
                id,
                expected,
                actual: entry.clock,
            });
        }

        // Predecessors are known, so no known entry can already follow this one.
        for pred in &entry.predecessors {
            self.heads.remove(pred);
        }
        self.heads.insert(id);

        if self.policy.allows(&entry.author) {
            apply(&mut self.view, id, &entry);
        } else {
            debug!(%id, author = %entry.author, "entry by non-writer kept out of view");
        }

        self.entries.insert(id, entry);
        Ok(Inserted::New)
    }

    /// Insert a batch in causal order.
    ///
    /// The batch is sorted with Kahn's algorithm over the predecessor edges
    /// inside it, ties broken by id. Predecessors outside the batch must
    /// already be known.
    pub fn merge(&mut self, batch: Vec<LogEntry>) -> MergeReport {
        let mut report = MergeReport::default();

        let mut pending: HashMap<EntryId, LogEntry> = HashMap::with_capacity(batch.len());
        for entry in batch {
            match entry.id() {
                Ok(id) if pending.contains_key(&id) || self.entries.contains_key(&id) => {
                    report.known += 1;
                }
                Ok(id) => {
                    pending.insert(id, entry);
                }
                Err(e) => {
                    warn!(error = %e, "rejecting unencodable entry");
                    report.rejected += 1;
                }
            }
        }

        for id in topological_order(&pending) {
            let Some(entry) = pending.remove(&id) else {
                continue;
            };
            match self.insert_with_id(id, entry) {
                Ok(Inserted::New) => report.applied += 1,
                Ok(Inserted::Known) => report.known += 1,
                Err(LogDbError::MissingPredecessors(missing)) => {
                    debug!(%id, missing = missing.len(), "entry waits for predecessors");
                    report.missing += 1;
                }
                Err(e) => {
                    warn!(%id, error = %e, "rejecting entry");
                    report.rejected += 1;
                }
            }
        }

        report
    }

    /// Recompute a view from scratch over `entries`.
    ///
    /// The incrementally maintained view always equals this over all known
    /// entries.
    pub fn materialize<'a, I>(entries: I, policy: &AccessPolicy) -> Result<BTreeMap<String, Winner>>
    where
        I: IntoIterator<Item = &'a LogEntry>,
    {
        let mut view = BTreeMap::new();
        for entry in entries {
            if policy.allows(&entry.author) {
                apply(&mut view, entry.id()?, entry);
            }
        }
        Ok(view)
    }

    /// Visible entries sorted by `(clock, id)`.
    pub fn entries_in_order(&self) -> Vec<(EntryId, &LogEntry)> {
        let mut out: Vec<(EntryId, &LogEntry)> = self
            .entries
            .iter()
            .filter(|(_, e)| self.policy.allows(&e.author))
            .map(|(id, e)| (*id, e))
            .collect();
        out.sort_by_key(|(id, e)| (e.clock, *id));
        out
    }

    /// Entries a replica holding `their_heads` is missing, predecessors
    /// first.
    ///
    /// Heads we do not know are ignored, so the result can be larger than
    /// what the other side actually lacks. It is never smaller.
    pub fn delta_from(&self, their_heads: &[EntryId]) -> Vec<LogEntry> {
        // Everything reachable from their known heads is theirs already.
        let mut theirs: HashSet<EntryId> = HashSet::new();
        let mut queue: VecDeque<EntryId> = their_heads
            .iter()
            .filter(|h| self.entries.contains_key(*h))
            .copied()
            .collect();
        while let Some(id) = queue.pop_front() {
            if !theirs.insert(id) {
                continue;
            }
            if let Some(entry) = self.entries.get(&id) {
                queue.extend(entry.predecessors.iter().copied());
            }
        }

        let mut delta: HashMap<EntryId, LogEntry> = HashMap::new();
        let mut queue: VecDeque<EntryId> = self.heads.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            if theirs.contains(&id) || delta.contains_key(&id) {
                continue;
            }
            if let Some(entry) = self.entries.get(&id) {
                queue.extend(entry.predecessors.iter().copied());
                delta.insert(id, entry.clone());
            }
        }

        topological_order(&delta)
            .into_iter()
            .filter_map(|id| delta.remove(&id))
            .collect()
    }
}

/// Let `entry` take `key` if it beats the current winner.
fn apply(view: &mut BTreeMap<String, Winner>, id: EntryId, entry: &LogEntry) {
    let key = entry.op.key();
    if let Some(current) = view.get(key)
        && (current.clock, current.id) >= (entry.clock, id)
    {
        return;
    }
    view.insert(
        key.to_string(),
        Winner {
            clock: entry.clock,
            id,
            value: entry.op.value().map(<[u8]>::to_vec),
        },
    );
}

/// Kahn's algorithm over the predecessor edges inside `entries`.
///
/// Among entries that are ready at the same time the smallest id goes
/// first, so the order is deterministic. Entries caught in a cycle (which
/// content addressing rules out) are appended in id order.
fn topological_order(entries: &HashMap<EntryId, LogEntry>) -> Vec<EntryId> {
    let mut in_degree: HashMap<EntryId, usize> = HashMap::with_capacity(entries.len());
    let mut children: HashMap<EntryId, Vec<EntryId>> = HashMap::new();

    for (id, entry) in entries {
        let deg = entry
            .predecessors
            .iter()
            .filter(|p| entries.contains_key(*p))
            .count();
        in_degree.insert(*id, deg);
        for pred in &entry.predecessors {
            if entries.contains_key(pred) {
                children.entry(*pred).or_default().push(*id);
            }
        }
    }

    let mut ready: BTreeSet<EntryId> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(entries.len());

    while let Some(id) = ready.pop_first() {
        order.push(id);
        in_degree.remove(&id);
        if let Some(kids) = children.get(&id) {
            for kid in kids {
                if let Some(deg) = in_degree.get_mut(kid) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(*kid);
                    }
                }
            }
        }
    }

    if !in_degree.is_empty() {
        let mut rest: Vec<EntryId> = in_degree.into_keys().collect();
        rest.sort_unstable();
        order.extend(rest);
    }
    order
}
