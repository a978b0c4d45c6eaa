//! Integration test: write allow-lists across replicas.

use std::sync::Arc;
use std::time::Duration;

use weft_integration_tests::{MemoryNetwork, ReplicaCluster, identity};
use weft_logdb::{AccessPolicy, Database, LogDbError, OpenOptions};
use weft_store::MemoryStore;
use weft_types::{DbAddress, DbType, FaultKind};

const WAIT: Duration = Duration::from_secs(10);

fn allow(indices: &[usize]) -> AccessPolicy {
    AccessPolicy::new(indices.iter().map(|&i| identity(i).node_id().to_string())).unwrap()
}

/// Entries from an author outside the allow-list replicate but stay hidden.
#[tokio::test]
async fn test_outsider_entries_stored_but_hidden() {
    let mut c = ReplicaCluster::with_type(0, DbType::KeyValue).await;
    c.add_replica(allow(&[0, 1]), false).await;
    c.add_replica(allow(&[0, 1]), false).await;
    // The outsider believes anyone may write.
    let outsider = c.add_replica(AccessPolicy::default(), false).await;

    c.db(outsider).put("price", "0").await.unwrap();
    c.db(0).put("owner", "alice").await.unwrap();

    assert!(c.wait_converged(WAIT).await, "replicas did not converge");
    for i in 0..2 {
        assert_eq!(c.db(i).get("price").await.unwrap(), None, "replica {i}");
        assert_eq!(c.db(i).get("owner").await.unwrap(), Some(b"alice".to_vec()));
    }
    // The outsider's own view follows its own policy.
    assert_eq!(c.db(outsider).get("price").await.unwrap(), Some(b"0".to_vec()));
    assert_eq!(c.db(outsider).get("owner").await.unwrap(), Some(b"alice".to_vec()));
    c.close().await;
}

/// A read-only replica follows writers but cannot write itself.
#[tokio::test]
async fn test_read_only_replica_follows() {
    let mut c = ReplicaCluster::with_type(0, DbType::KeyValue).await;
    c.add_replica(allow(&[0]), false).await;
    let reader = c.add_replica(allow(&[0]), true).await;
    assert!(!c.db(reader).is_writable());

    c.db(0).put("config", "v2").await.unwrap();
    assert!(c.wait_for_value(reader, "config", Some(b"v2"), WAIT).await);

    let err = c.db(reader).put("config", "v3").await.unwrap_err();
    assert_eq!(err.kind(), FaultKind::Access);
    c.close().await;
}

/// Opening for writing without being allow-listed fails.
#[tokio::test]
async fn test_open_without_write_access_fails() {
    let net = MemoryNetwork::new();
    let me = identity(5);
    let store = Arc::new(MemoryStore::unbounded());
    let member = net.join(me.peer_id(), store.clone());

    let options =
        OpenOptions::new(DbAddress::new("/weft", "locked")).policy(allow(&[0]));
    let result = Database::open(options, &me, store, member.clone(), member).await;
    assert!(matches!(result, Err(LogDbError::Access(_))));
}
