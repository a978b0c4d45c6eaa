use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;
use weft_net::{PeerId, PubsubEvent};
use weft_store::{BlockStore, FileStore, MemoryStore};
use weft_types::{ContentId, DbAddress, DbType, EntryId, FaultKind};

use super::{MockNet, id, node_id, put, test_identity};
use crate::access::AccessPolicy;
use crate::database::{Database, DbState, OpenOptions};
use crate::entry::Operation;
use crate::error::LogDbError;
use crate::message::DbMessage;
use crate::replicator::{FetchRetry, MAX_WALK};

const WAIT: Duration = Duration::from_secs(5);

fn address() -> DbAddress {
    DbAddress::new("/weft", "orders")
}

fn fast_retry() -> FetchRetry {
    FetchRetry {
        attempts: 2,
        first_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

async fn open_with(
    options: OpenOptions,
    seed: u8,
    blocks: Arc<dyn BlockStore>,
) -> (Database, Arc<MockNet>) {
    let net = Arc::new(MockNet::default());
    let db = Database::open(options, &test_identity(seed), blocks, net.clone(), net.clone())
        .await
        .unwrap();
    (db, net)
}

async fn open_memory(options: OpenOptions) -> (Database, Arc<MockNet>) {
    open_with(options, 1, Arc::new(MemoryStore::unbounded())).await
}

fn heads_message(heads: Vec<EntryId>) -> PubsubEvent {
    PubsubEvent::Message {
        topic: address().topic(),
        source: PeerId::random(),
        data: DbMessage::Heads {
            address: address(),
            heads,
        }
        .encode()
        .unwrap(),
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition within timeout");
}

// =========================================================================
// Local reads and writes
// =========================================================================

#[tokio::test]
async fn test_put_then_get() {
    let (db, _net) = open_memory(OpenOptions::new(address())).await;
    assert_eq!(db.state(), DbState::Open);

    db.put("order-1", "shipped").await.unwrap();
    assert_eq!(db.get("order-1").await.unwrap(), Some(b"shipped".to_vec()));
    assert_eq!(db.get("order-2").await.unwrap(), None);
}

#[tokio::test]
async fn test_put_chains_entries() {
    let (db, _net) = open_memory(OpenOptions::new(address())).await;
    let first = db.put("k", "1").await.unwrap();
    let second = db.put("k", "2").await.unwrap();

    assert_eq!(db.heads().await, vec![second]);
    assert_eq!(db.get("k").await.unwrap(), Some(b"2".to_vec()));

    let events = db.events().await.unwrap();
    let ids: Vec<EntryId> = events.iter().map(|(i, _)| *i).collect();
    assert_eq!(ids, vec![first, second]);
}

#[tokio::test]
async fn test_put_stores_block_announces_and_provides() {
    let blocks = Arc::new(MemoryStore::unbounded());
    let (db, net) = open_with(OpenOptions::new(address()), 1, blocks.clone()).await;
    let entry_id = db.put("order-1", "shipped").await.unwrap();

    assert!(blocks.contains(entry_id.into()).await.unwrap());
    assert_eq!(net.provided(), vec![ContentId::from(entry_id)]);

    let (topic, data) = net.published().last().cloned().unwrap();
    assert_eq!(topic, "/weft/orders");
    assert_eq!(
        DbMessage::decode(&data).unwrap(),
        DbMessage::Heads {
            address: address(),
            heads: vec![entry_id],
        }
    );
}

#[tokio::test]
async fn test_concurrent_puts_are_serialized() {
    let (db, _net) = open_memory(OpenOptions::new(address())).await;
    let db = Arc::new(db);

    let mut tasks = Vec::new();
    for i in 0..10 {
        let db = db.clone();
        tasks.push(tokio::spawn(async move {
            db.put(format!("k{i}"), "v").await.unwrap()
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    // Every append saw the previous one as its only head.
    assert_eq!(db.heads().await.len(), 1);
    let events = db.events().await.unwrap();
    assert_eq!(events.len(), 10);
}

#[tokio::test]
async fn test_events_db_rejects_delete() {
    let (db, _net) = open_memory(OpenOptions::new(address())).await;
    db.put("k", "v").await.unwrap();
    let err = db.delete("k").await.unwrap_err();
    assert!(matches!(err, LogDbError::Unsupported("delete")));
    assert_eq!(db.get("k").await.unwrap(), Some(b"v".to_vec()));
}

#[tokio::test]
async fn test_keyvalue_delete() {
    let options = OpenOptions::new(address()).db_type(DbType::KeyValue);
    let (db, _net) = open_memory(options).await;
    db.put("k", "v").await.unwrap();
    db.delete("k").await.unwrap();

    assert_eq!(db.get("k").await.unwrap(), None);
    let events = db.events().await.unwrap();
    assert!(matches!(events[1].1, Operation::Delete { .. }));
}

// =========================================================================
// Access policy
// =========================================================================

#[tokio::test]
async fn test_open_denied_for_non_writer() {
    let policy = AccessPolicy::new([node_id(2).to_string()]).unwrap();
    let net = Arc::new(MockNet::default());
    let result = Database::open(
        OpenOptions::new(address()).policy(policy),
        &test_identity(1),
        Arc::new(MemoryStore::unbounded()),
        net.clone(),
        net.clone(),
    )
    .await;

    let err = result.err().expect("open must fail");
    assert_eq!(err.kind(), FaultKind::Access);
    assert!(!net.is_subscribed("/weft/orders"));
}

#[tokio::test]
async fn test_read_only_open_for_non_writer() {
    let policy = AccessPolicy::new([node_id(2).to_string()]).unwrap();
    let options = OpenOptions::new(address()).policy(policy).read_only(true);
    let (db, _net) = open_memory(options).await;

    assert!(!db.is_writable());
    assert!(matches!(db.put("k", "v").await, Err(LogDbError::ReadOnly(_))));
    assert_eq!(db.get("k").await.unwrap(), None);
}

#[tokio::test]
async fn test_read_only_flag_blocks_writer() {
    let options = OpenOptions::new(address()).read_only(true);
    let (db, _net) = open_memory(options).await;
    assert!(!db.is_writable());
    assert_eq!(
        db.put("k", "v").await.unwrap_err().kind(),
        FaultKind::Access
    );
}

// =========================================================================
// Remote merge
// =========================================================================

#[tokio::test]
async fn test_remote_heads_are_fetched_and_merged() {
    let options = OpenOptions::new(address()).fetch_retry(fast_retry());
    let (db, net) = open_memory(options).await;
    let mut updates = db.updates();

    let a = put("orders", 2, "order-1", "packed", &[]);
    let b = put("orders", 2, "order-1", "shipped", &[&a]);
    net.add_remote(&a);
    net.add_remote(&b);

    net.inject("/weft/orders", heads_message(vec![id(&b)])).await;
    let update = tokio::time::timeout(WAIT, updates.recv()).await.unwrap().unwrap();

    assert_eq!(update.applied, 2);
    assert_eq!(update.heads, vec![id(&b)]);
    assert_eq!(db.get("order-1").await.unwrap(), Some(b"shipped".to_vec()));
}

#[tokio::test]
async fn test_merged_entries_are_stored_locally() {
    let blocks = Arc::new(MemoryStore::unbounded());
    let options = OpenOptions::new(address()).fetch_retry(fast_retry());
    let (db, net) = open_with(options, 1, blocks.clone()).await;
    let mut updates = db.updates();

    let a = put("orders", 2, "k", "v", &[]);
    net.add_remote(&a);
    net.inject("/weft/orders", heads_message(vec![id(&a)])).await;
    tokio::time::timeout(WAIT, updates.recv()).await.unwrap().unwrap();

    assert!(blocks.contains(id(&a).into()).await.unwrap());
}

#[tokio::test]
async fn test_local_write_after_merge_follows_remote_head() {
    let options = OpenOptions::new(address()).fetch_retry(fast_retry());
    let (db, net) = open_memory(options).await;
    let mut updates = db.updates();

    let a = put("orders", 2, "k", "remote", &[]);
    net.add_remote(&a);
    net.inject("/weft/orders", heads_message(vec![id(&a)])).await;
    tokio::time::timeout(WAIT, updates.recv()).await.unwrap().unwrap();

    let local = db.put("k", "local").await.unwrap();
    assert_eq!(db.heads().await, vec![local]);
    assert_eq!(db.get("k").await.unwrap(), Some(b"local".to_vec()));
}

/// A history longer than one walk's fetch budget still syncs from a single
/// announcement.
#[tokio::test]
async fn test_history_longer_than_walk_limit_syncs() {
    let options = OpenOptions::new(address()).fetch_retry(fast_retry());
    let (db, net) = open_memory(options).await;

    let mut tip = put("orders", 2, "seq", "0", &[]);
    net.add_remote(&tip);
    for n in 1..MAX_WALK + 5 {
        tip = put("orders", 2, "seq", &n.to_string(), &[&tip]);
        net.add_remote(&tip);
    }
    net.inject("/weft/orders", heads_message(vec![id(&tip)])).await;

    let expected = (MAX_WALK + 4).to_string().into_bytes();
    tokio::time::timeout(Duration::from_secs(120), async {
        while db.get("seq").await.unwrap() != Some(expected.clone()) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("long history merged");
    assert_eq!(db.heads().await, vec![id(&tip)]);
    assert_eq!(net.fetches(), MAX_WALK + 5);
}

#[tokio::test]
async fn test_unavailable_entry_is_given_up() {
    let options = OpenOptions::new(address()).fetch_retry(fast_retry());
    let (db, net) = open_memory(options).await;

    let ghost = EntryId::from_data(b"never published");
    net.inject("/weft/orders", heads_message(vec![ghost])).await;

    let n = net.clone();
    wait_for(move || n.fetches() >= 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(net.fetches(), 2);
    assert!(db.heads().await.is_empty());
    assert_eq!(db.state(), DbState::Open);
}

#[tokio::test]
async fn test_forged_entry_is_discarded() {
    let options = OpenOptions::new(address()).fetch_retry(fast_retry());
    let (db, net) = open_memory(options).await;

    let mut forged = put("orders", 2, "k", "evil", &[]);
    forged.signature_r[5] ^= 0x01;
    let forged_id = net.add_remote(&forged);

    net.inject("/weft/orders", heads_message(vec![forged_id])).await;
    let n = net.clone();
    wait_for(move || n.fetches() >= 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(db.get("k").await.unwrap(), None);
    assert!(db.heads().await.is_empty());
}

#[tokio::test]
async fn test_mismatched_block_is_discarded() {
    let options = OpenOptions::new(address()).fetch_retry(fast_retry());
    let (db, net) = open_memory(options).await;

    let wanted = EntryId::from_data(b"wanted");
    net.add_remote_bytes(wanted.into(), Bytes::from_static(b"something else"));
    net.inject("/weft/orders", heads_message(vec![wanted])).await;

    let n = net.clone();
    wait_for(move || n.fetches() >= 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(db.heads().await.is_empty());
}

#[tokio::test]
async fn test_entry_of_other_database_is_discarded() {
    let options = OpenOptions::new(address()).fetch_retry(fast_retry());
    let (db, net) = open_memory(options).await;

    let foreign = put("invoices", 2, "k", "v", &[]);
    net.add_remote(&foreign);
    net.inject("/weft/orders", heads_message(vec![id(&foreign)])).await;

    let n = net.clone();
    wait_for(move || n.fetches() >= 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(db.heads().await.is_empty());
}

#[tokio::test]
async fn test_non_writer_entries_hidden_after_merge() {
    let policy = AccessPolicy::new([node_id(1).to_string()]).unwrap();
    let options = OpenOptions::new(address())
        .policy(policy)
        .fetch_retry(fast_retry());
    let (db, net) = open_memory(options).await;
    let mut updates = db.updates();

    let intruder = put("orders", 2, "k", "theirs", &[]);
    net.add_remote(&intruder);
    net.inject("/weft/orders", heads_message(vec![id(&intruder)])).await;
    let update = tokio::time::timeout(WAIT, updates.recv()).await.unwrap().unwrap();

    assert_eq!(update.applied, 1);
    assert_eq!(db.get("k").await.unwrap(), None);
    assert!(db.events().await.unwrap().is_empty());
    assert_eq!(db.heads().await, vec![id(&intruder)]);
}

#[tokio::test]
async fn test_garbage_message_is_ignored() {
    let (db, net) = open_memory(OpenOptions::new(address())).await;
    net.inject(
        "/weft/orders",
        PubsubEvent::Message {
            topic: address().topic(),
            source: PeerId::random(),
            data: vec![0xff; 4],
        },
    )
    .await;
    db.put("k", "v").await.unwrap();
    assert_eq!(db.get("k").await.unwrap(), Some(b"v".to_vec()));
}

#[tokio::test]
async fn test_peer_joined_triggers_announcement() {
    let (db, net) = open_memory(OpenOptions::new(address())).await;
    let entry_id = db.put("k", "v").await.unwrap();
    let before = net.published().len();

    net.inject(
        "/weft/orders",
        PubsubEvent::PeerJoined {
            peer: PeerId::random(),
        },
    )
    .await;

    let n = net.clone();
    wait_for(move || n.published().len() > before).await;
    let (_, data) = net.published().last().cloned().unwrap();
    assert_eq!(
        DbMessage::decode(&data).unwrap(),
        DbMessage::Heads {
            address: address(),
            heads: vec![entry_id],
        }
    );
}

#[tokio::test]
async fn test_stale_peer_gets_our_heads() {
    let (db, net) = open_memory(OpenOptions::new(address())).await;
    db.put("k", "v").await.unwrap();
    let before = net.published().len();

    // A peer announcing nothing is behind us.
    net.inject("/weft/orders", heads_message(vec![])).await;
    let n = net.clone();
    wait_for(move || n.published().len() > before).await;
}

// =========================================================================
// Persistence and lifecycle
// =========================================================================

#[tokio::test]
async fn test_reopen_restores_state_from_disk() {
    let dir = TempDir::new().unwrap();
    let blocks: Arc<dyn BlockStore> = Arc::new(FileStore::new(dir.path().join("blocks")).unwrap());
    let options = OpenOptions::new(address()).data_dir(dir.path());

    let (db, _net) = open_with(options.clone(), 1, blocks.clone()).await;
    db.put("a", "1").await.unwrap();
    let last = db.put("b", "2").await.unwrap();
    db.close().await;
    assert!(dir.path().join("orders").join("heads").exists());

    let (db, _net) = open_with(options, 1, blocks).await;
    assert_eq!(db.heads().await, vec![last]);
    assert_eq!(db.get("a").await.unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get("b").await.unwrap(), Some(b"2".to_vec()));
    assert_eq!(db.events().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_reopen_without_blocks_starts_partial() {
    let dir = TempDir::new().unwrap();
    let options = OpenOptions::new(address()).data_dir(dir.path());

    let (db, _net) = open_with(options.clone(), 1, Arc::new(MemoryStore::unbounded())).await;
    db.put("a", "1").await.unwrap();
    db.close().await;

    // The heads file survives but the blocks were in memory.
    let (db, _net) = open_with(options, 1, Arc::new(MemoryStore::unbounded())).await;
    assert_eq!(db.state(), DbState::Open);
    assert_eq!(db.get("a").await.unwrap(), None);
}

#[tokio::test]
async fn test_close_is_idempotent_and_final() {
    let (db, net) = open_memory(OpenOptions::new(address())).await;
    assert!(net.is_subscribed("/weft/orders"));

    db.close().await;
    assert_eq!(db.state(), DbState::Closed);
    assert!(!net.is_subscribed("/weft/orders"));
    db.close().await;

    assert!(matches!(
        db.put("k", "v").await,
        Err(LogDbError::NotOpen(DbState::Closed))
    ));
    assert!(matches!(
        db.get("k").await,
        Err(LogDbError::NotOpen(DbState::Closed))
    ));
}

#[tokio::test]
async fn test_close_waits_for_in_flight_put() {
    let (db, _net) = open_memory(OpenOptions::new(address())).await;
    let db = Arc::new(db);

    let writer = {
        let db = db.clone();
        tokio::spawn(async move { db.put("k", "v").await })
    };
    tokio::task::yield_now().await;
    db.close().await;

    // Either the put finished before close took the append lock, or it saw
    // the database closing. It never half-applies.
    match writer.await.unwrap() {
        Ok(_) => assert_eq!(db.heads().await.len(), 1),
        Err(e) => {
            assert!(matches!(e, LogDbError::NotOpen(_)));
            assert!(db.heads().await.is_empty());
        }
    }
}
