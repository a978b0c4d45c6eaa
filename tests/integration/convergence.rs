//! Integration test: replicas converge over gossip.
//!
//! Every scenario runs N replicas of one database on a [`MemoryNetwork`] and
//! checks that they end with the same heads and the same visible values.

use std::time::Duration;

use weft_integration_tests::ReplicaCluster;
use weft_logdb::{AccessPolicy, Operation};
use weft_types::DbType;

const WAIT: Duration = Duration::from_secs(10);

/// A write on one replica becomes visible on the others.
#[tokio::test]
async fn test_put_reaches_every_replica() {
    let c = ReplicaCluster::new(3).await;
    c.db(0).put("order-1", "shipped").await.unwrap();

    for i in 1..3 {
        assert!(
            c.wait_for_value(i, "order-1", Some(b"shipped"), WAIT).await,
            "replica {i} never saw order-1"
        );
    }
    assert!(c.wait_converged(WAIT).await);
    c.close().await;
}

/// Distinct keys written on different replicas all end up everywhere.
#[tokio::test]
async fn test_writes_from_every_replica_merge() {
    let c = ReplicaCluster::new(4).await;
    for i in 0..4 {
        c.db(i).put(format!("key-{i}"), format!("from-{i}")).await.unwrap();
    }

    assert!(c.wait_converged(WAIT).await, "replicas did not converge");
    for reader in 0..4 {
        for writer in 0..4 {
            let value = c.db(reader).get(&format!("key-{writer}")).await.unwrap();
            assert_eq!(
                value,
                Some(format!("from-{writer}").into_bytes()),
                "replica {reader} reading key-{writer}"
            );
        }
    }
    c.close().await;
}

/// Concurrent writes to one key resolve to the same winner everywhere.
#[tokio::test]
async fn test_concurrent_writes_pick_one_winner() {
    let c = ReplicaCluster::new(3).await;
    let (a, b, d) = tokio::join!(
        c.db(0).put("color", "red"),
        c.db(1).put("color", "green"),
        c.db(2).put("color", "blue"),
    );
    a.unwrap();
    b.unwrap();
    d.unwrap();

    assert!(c.wait_converged(WAIT).await, "replicas did not converge");
    let winner = c.db(0).get("color").await.unwrap();
    assert!(winner.is_some());
    for i in 1..3 {
        assert_eq!(c.db(i).get("color").await.unwrap(), winner, "replica {i}");
    }
    c.close().await;
}

/// A later write that has seen the earlier one always wins.
#[tokio::test]
async fn test_causal_overwrite_wins() {
    let c = ReplicaCluster::new(2).await;
    c.db(0).put("status", "pending").await.unwrap();
    assert!(c.wait_for_value(1, "status", Some(b"pending"), WAIT).await);

    c.db(1).put("status", "shipped").await.unwrap();
    assert!(c.wait_for_value(0, "status", Some(b"shipped"), WAIT).await);
    c.close().await;
}

/// Deletes replicate like puts.
#[tokio::test]
async fn test_delete_replicates() {
    let c = ReplicaCluster::new(2).await;
    c.db(0).put("session", "abc").await.unwrap();
    assert!(c.wait_for_value(1, "session", Some(b"abc"), WAIT).await);

    c.db(1).delete("session").await.unwrap();
    assert!(c.wait_for_value(0, "session", None, WAIT).await);
    c.close().await;
}

/// A replica that opens late catches up through head announcements.
#[tokio::test]
async fn test_late_joiner_catches_up() {
    let mut c = ReplicaCluster::new(2).await;
    for n in 0..5 {
        c.db(n % 2).put(format!("k{n}"), format!("v{n}")).await.unwrap();
    }
    assert!(c.wait_converged(WAIT).await);

    let late = c.add_replica(AccessPolicy::default(), false).await;
    for n in 0..5 {
        assert!(
            c.wait_for_value(late, &format!("k{n}"), Some(format!("v{n}").as_bytes()), WAIT)
                .await,
            "late replica missing k{n}"
        );
    }
    assert!(c.wait_converged(WAIT).await);
    c.close().await;
}

/// Event logs list the same entries in the same order on every replica.
#[tokio::test]
async fn test_event_logs_agree_on_order() {
    let c = ReplicaCluster::with_type(3, DbType::Events).await;
    for round in 0..3 {
        for i in 0..3 {
            c.db(i).put(format!("e-{round}-{i}"), "x").await.unwrap();
        }
    }

    assert!(c.wait_converged(WAIT).await, "replicas did not converge");
    let reference = c.db(0).events().await.unwrap();
    assert_eq!(reference.len(), 9);
    for i in 1..3 {
        assert_eq!(c.db(i).events().await.unwrap(), reference, "replica {i}");
    }
    assert!(
        reference
            .iter()
            .all(|(_, op)| matches!(op, Operation::Put { .. }))
    );
    c.close().await;
}

/// Heads keep moving while replicas chain on each other's writes.
#[tokio::test]
async fn test_ping_pong_chain() {
    let c = ReplicaCluster::new(2).await;
    for n in 0..10 {
        let writer = n % 2;
        let reader = 1 - writer;
        let value = format!("v{n}");
        c.db(writer).put("counter", value.clone()).await.unwrap();
        assert!(
            c.wait_for_value(reader, "counter", Some(value.as_bytes()), WAIT).await,
            "step {n}"
        );
    }

    assert!(c.wait_converged(WAIT).await);
    assert_eq!(c.db(0).heads().await.len(), 1);
    c.close().await;
}
