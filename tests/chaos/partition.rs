//! Chaos test: network partitions.
//!
//! Replicas keep writing while cut off from each other. After the network
//! heals they must agree on heads and on every value.

use std::time::Duration;

use weft_integration_tests::{Lcg, ReplicaCluster};

const WAIT: Duration = Duration::from_secs(20);
const KEYS: usize = 6;

async fn assert_same_view(c: &ReplicaCluster) {
    for k in 0..KEYS {
        let key = format!("k{k}");
        let reference = c.db(0).get(&key).await.unwrap();
        for i in 1..c.len() {
            assert_eq!(c.db(i).get(&key).await.unwrap(), reference, "{key} on replica {i}");
        }
    }
}

/// Two halves write conflicting values while split, then heal.
#[tokio::test]
async fn test_split_brain_then_heal() {
    let c = ReplicaCluster::new(4).await;
    c.db(0).put("k0", "before").await.unwrap();
    assert!(c.wait_converged(WAIT).await);

    // Replicas 2 and 3 drop off; 0 and 1 stay connected.
    c.partition(2);
    c.partition(3);

    c.db(0).put("k0", "left").await.unwrap();
    c.db(2).put("k0", "right").await.unwrap();
    c.db(3).put("k1", "only-right").await.unwrap();
    assert!(c.wait_for_value(1, "k0", Some(b"left"), WAIT).await);
    assert_eq!(c.db(1).get("k1").await.unwrap(), None);

    c.heal(2);
    c.heal(3);
    assert!(c.wait_converged(WAIT).await, "replicas did not converge after heal");
    assert_same_view(&c).await;
    assert_eq!(c.db(0).get("k1").await.unwrap(), Some(b"only-right".to_vec()));
    let winner = c.db(0).get("k0").await.unwrap();
    assert!(winner == Some(b"left".to_vec()) || winner == Some(b"right".to_vec()));
    c.close().await;
}

/// Random writes under random partitions converge once everyone is back.
#[tokio::test]
async fn test_random_partitions_converge() {
    let replicas = 5;
    let c = ReplicaCluster::new(replicas).await;
    let mut rng = Lcg::new(0x5eed);

    for round in 0..8 {
        let cut = rng.next_below(replicas);
        c.partition(cut);

        for _ in 0..6 {
            let writer = rng.next_below(replicas);
            let key = format!("k{}", rng.next_below(KEYS));
            let value = format!("r{round}-w{writer}");
            if rng.next_below(5) == 0 {
                c.db(writer).delete(key).await.unwrap();
            } else {
                c.db(writer).put(key, value).await.unwrap();
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        c.heal(cut);
    }

    assert!(c.wait_converged(WAIT).await, "replicas did not converge");
    assert_same_view(&c).await;
    c.close().await;
}

/// A replica that was down for a long stretch catches up on all of it.
#[tokio::test]
async fn test_long_outage_catch_up() {
    let c = ReplicaCluster::new(3).await;
    c.partition(2);

    for n in 0..40 {
        c.db(n % 2).put(format!("k{}", n % KEYS), format!("v{n}")).await.unwrap();
    }
    assert!(c.wait_converged(WAIT).await);
    assert_eq!(c.db(2).heads().await, Vec::new());

    c.heal(2);
    assert!(c.wait_converged(WAIT).await, "replica 2 did not catch up");
    assert_same_view(&c).await;
    c.close().await;
}
