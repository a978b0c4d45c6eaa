//! Tests for the log database crate.

mod database_tests;
mod entry_tests;

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use ed25519_dalek::SigningKey;
use tokio::sync::mpsc;
use weft_net::{
    BlockExchange, Broadcast, NetError, NodeIdentity, PeerId, PubsubEvent, Subscription,
};
use weft_types::{ContentId, EntryId, NodeId};

use crate::entry::{LogEntry, Operation};

/// Deterministic signing key from a seed.
fn test_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

/// Deterministic node identity from a seed. Matches [`test_key`].
fn test_identity(seed: u8) -> NodeIdentity {
    NodeIdentity::from_secret([seed; 32]).unwrap()
}

fn node_id(seed: u8) -> NodeId {
    NodeId::from(test_key(seed).verifying_key().to_bytes())
}

/// A signed put following `preds`, with the correct Lamport clock.
fn put(db: &str, seed: u8, key: &str, value: &str, preds: &[&LogEntry]) -> LogEntry {
    op(db, seed, Operation::Put {
        key: key.to_string(),
        value: value.as_bytes().to_vec(),
    }, preds)
}

fn del(db: &str, seed: u8, key: &str, preds: &[&LogEntry]) -> LogEntry {
    op(db, seed, Operation::Delete { key: key.to_string() }, preds)
}

fn op(db: &str, seed: u8, op: Operation, preds: &[&LogEntry]) -> LogEntry {
    let clock = 1 + preds.iter().map(|p| p.clock).max().unwrap_or(0);
    let ids = preds.iter().map(|p| p.id().unwrap()).collect();
    LogEntry::new_signed(db, op, ids, clock, &test_key(seed)).unwrap()
}

fn id(entry: &LogEntry) -> EntryId {
    entry.id().unwrap()
}

#[derive(Default)]
struct MockInner {
    published: Vec<(String, Vec<u8>)>,
    subscribers: HashMap<String, mpsc::Sender<PubsubEvent>>,
    remote_blocks: HashMap<ContentId, Bytes>,
    provided: Vec<ContentId>,
    fetches: usize,
}

/// In-process stand-in for the network: records publishes, lets tests
/// inject pub/sub events, and serves "remote" blocks from a map.
#[derive(Default)]
struct MockNet {
    inner: Mutex<MockInner>,
}

impl MockNet {
    fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.inner.lock().unwrap().published.clone()
    }

    fn provided(&self) -> Vec<ContentId> {
        self.inner.lock().unwrap().provided.clone()
    }

    fn fetches(&self) -> usize {
        self.inner.lock().unwrap().fetches
    }

    fn is_subscribed(&self, topic: &str) -> bool {
        self.inner.lock().unwrap().subscribers.contains_key(topic)
    }

    /// Make `entry` fetchable from "the network".
    fn add_remote(&self, entry: &LogEntry) -> EntryId {
        let bytes = entry.encode().unwrap();
        let id = EntryId::from_data(&bytes);
        self.add_remote_bytes(id.into(), Bytes::from(bytes));
        id
    }

    fn add_remote_bytes(&self, id: ContentId, bytes: Bytes) {
        self.inner.lock().unwrap().remote_blocks.insert(id, bytes);
    }

    /// Deliver `event` to the subscriber of `topic`.
    async fn inject(&self, topic: &str, event: PubsubEvent) {
        let tx = self
            .inner
            .lock()
            .unwrap()
            .subscribers
            .get(topic)
            .cloned()
            .expect("topic subscribed");
        tx.send(event).await.unwrap();
    }
}

#[async_trait::async_trait]
impl Broadcast for MockNet {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), NetError> {
        self.inner
            .lock()
            .unwrap()
            .published
            .push((topic.to_string(), data));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, NetError> {
        let (tx, rx) = mpsc::channel(64);
        self.inner
            .lock()
            .unwrap()
            .subscribers
            .insert(topic.to_string(), tx);
        Ok(Subscription::new(topic, rx))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), NetError> {
        self.inner.lock().unwrap().subscribers.remove(topic);
        Ok(())
    }
}

#[async_trait::async_trait]
impl BlockExchange for MockNet {
    async fn fetch(&self, id: ContentId, _hint: Option<PeerId>) -> Result<Option<Bytes>, NetError> {
        let mut inner = self.inner.lock().unwrap();
        inner.fetches += 1;
        Ok(inner.remote_blocks.get(&id).cloned())
    }

    async fn provide(&self, id: ContentId) -> Result<(), NetError> {
        self.inner.lock().unwrap().provided.push(id);
        Ok(())
    }
}
