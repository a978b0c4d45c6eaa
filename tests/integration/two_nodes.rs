//! Integration test: two full nodes over libp2p on loopback.
//!
//! Node A opens `orders` and writes; node B bootstraps from A's dialable
//! address, opens the same database and must read A's write.

use std::time::Duration;

use tempfile::TempDir;
use weft_logdb::FetchRetry;
use weft_net::NetConfig;
use weft_node::{DatabaseConfig, NodeConfig, WeftNode};
use weft_types::DbType;

const WAIT: Duration = Duration::from_secs(30);

fn node_config(dir: &TempDir, db_type: DbType, bootstrap: Vec<String>) -> NodeConfig {
    NodeConfig {
        data_dir: dir.path().to_path_buf(),
        memory: true,
        network: NetConfig {
            bootstrap,
            ..NetConfig::local()
        },
        database: DatabaseConfig {
            name: "orders".to_string(),
            db_type,
            ..Default::default()
        },
        fetch_retry: FetchRetry {
            attempts: 4,
            first_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        },
        ..Default::default()
    }
}

async fn wait_for(node: &WeftNode, key: &str, expected: &[u8]) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if let Ok(Some(value)) = node.get(key).await
            && value == expected
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

/// A write on A is readable on B after B bootstraps from A.
#[tokio::test]
async fn test_order_replicates_to_bootstrapped_node() {
    let dir_a = TempDir::new().unwrap();
    let mut a = WeftNode::start(node_config(&dir_a, DbType::Events, vec![]))
        .await
        .unwrap();
    a.put("order-1", "shipped").await.unwrap();
    assert_eq!(a.get("order-1").await.unwrap(), Some(b"shipped".to_vec()));

    let bootstrap = a.dialable_address().unwrap().to_string();
    let dir_b = TempDir::new().unwrap();
    let mut b = WeftNode::start(node_config(&dir_b, DbType::Events, vec![bootstrap]))
        .await
        .unwrap();
    assert_eq!(a.db_address(), b.db_address());

    assert!(
        wait_for(&b, "order-1", b"shipped").await,
        "node B never saw order-1"
    );

    b.stop().await;
    a.stop().await;
}

/// Writes on both nodes end up on both nodes.
#[tokio::test]
async fn test_writes_flow_both_ways() {
    let dir_a = TempDir::new().unwrap();
    let mut a = WeftNode::start(node_config(&dir_a, DbType::KeyValue, vec![]))
        .await
        .unwrap();
    let bootstrap = a.dialable_address().unwrap().to_string();

    let dir_b = TempDir::new().unwrap();
    let mut b = WeftNode::start(node_config(&dir_b, DbType::KeyValue, vec![bootstrap]))
        .await
        .unwrap();

    a.put("from-a", "1").await.unwrap();
    b.put("from-b", "2").await.unwrap();

    assert!(wait_for(&b, "from-a", b"1").await, "B missing A's write");
    assert!(wait_for(&a, "from-b", b"2").await, "A missing B's write");

    b.stop().await;
    a.stop().await;
}
