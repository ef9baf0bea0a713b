use std::time::Duration;
use cluster::{ConnectionConfig, RemotePeer, ReplicationConfig};
use server::{Node, RpcClient};
use storage::{BatchOp, RangeOptions, Storage, StorageConfig};

fn config(id: &str, peers: Vec<String>) -> ReplicationConfig {
    ReplicationConfig {
        node_id: Some(id.to_string()),
        host: "127.0.0.1".to_string(),
        port: 0,
        peers,
        connections: ConnectionConfig {
            interval: Duration::from_millis(100),
            floor: Duration::from_millis(10),
            tick: Duration::from_millis(50),
            tmax: Some(Duration::from_secs(2)),
            decay_factor: 10,
        },
        ..Default::default()
    }
}

async fn start(id: &str, peers: &[&Node]) -> Node {
    let seeds = peers.iter().map(|n| n.local_addr().to_string()).collect();
    Node::start(config(id, seeds), Storage::new()).await.unwrap()
}

/// Poll until every node reports `expected` for `key` or the deadline passes
async fn converged(nodes: &[&Node], key: &[u8], expected: Option<&[u8]>) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let mut all = true;
        for node in nodes {
            if node.get(key).await.unwrap().as_deref() != expected {
                all = false;
            }
        }
        if all {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_nodes_converge_and_propagate_delete() {
    let a = start("node-a", &[]).await;
    let b = start("node-b", &[&a]).await;
    let c = start("node-c", &[&a, &b]).await;

    a.put(b"foo1", b"100").await.unwrap();
    a.batch(vec![BatchOp::put("foo2", "200"), BatchOp::put("foo3", "300")]).await.unwrap();
    b.batch(vec![
        BatchOp::put("bar1", "100"),
        BatchOp::put("bar2", "200"),
        BatchOp::put("bar3", "300"),
    ]).await.unwrap();
    c.batch(vec![
        BatchOp::put("bazz1", "100"),
        BatchOp::put("bazz2", "200"),
        BatchOp::put("bazz3", "300"),
    ]).await.unwrap();

    let nodes = [&a, &b, &c];
    let expected: [(&str, &str); 9] = [
        ("foo1", "100"), ("foo2", "200"), ("foo3", "300"),
        ("bar1", "100"), ("bar2", "200"), ("bar3", "300"),
        ("bazz1", "100"), ("bazz2", "200"), ("bazz3", "300"),
    ];
    for (key, value) in expected {
        assert!(
            converged(&nodes, key.as_bytes(), Some(value.as_bytes())).await,
            "{} did not converge",
            key
        );
    }

    b.delete(b"bar2").await.unwrap();
    assert!(converged(&nodes, b"bar2", None).await, "delete of bar2 did not propagate");

    for node in nodes {
        assert_eq!(node.store().clock(b"bar2").await.unwrap(), 2);
        assert_eq!(node.get(b"bar1").await.unwrap(), Some(b"100".to_vec()));
    }

    a.close();
    b.close();
    c.close();
}

#[tokio::test]
async fn test_rpc_surface() {
    let node = start("solo", &[]).await;
    let addr = node.local_addr().to_string();
    let mut client = RpcClient::connect(&addr, Duration::from_secs(1)).await.unwrap();

    assert_eq!(client.version().await.unwrap(), cluster::PROTOCOL_VERSION);
    assert_eq!(client.identify().await.unwrap(), "solo");

    client.put(b"k1", b"v1").await.unwrap();
    client.put(b"k2", b"v2").await.unwrap();
    client.delete(b"k2").await.unwrap();
    assert_eq!(client.get(b"k1").await.unwrap(), Some(b"v1".to_vec()));
    assert_eq!(client.get(b"k2").await.unwrap(), None);

    // writes over RPC are logged like local ones
    assert_eq!(node.store().clock(b"k2").await.unwrap(), 2);
    assert!(client.put(&[0xff, b'x'], b"v").await.is_err());

    node.put(b"k3", b"v3").await.unwrap();
    let records = client.read_range(&RangeOptions {
        gte: Some(b"k".to_vec()),
        lt: Some(b"l".to_vec()),
        reverse: true,
        ..Default::default()
    }).await.unwrap();
    let keys: Vec<_> = records.iter().map(|r| r.key.clone().unwrap()).collect();
    assert_eq!(keys, vec![b"k3".to_vec(), b"k1".to_vec()]);

    let only_keys = client.read_range(&RangeOptions::prefix(b"k").keys_only().with_limit(1)).await.unwrap();
    assert_eq!(only_keys.len(), 1);
    assert_eq!(only_keys[0].value, None);

    let stats = client.stats().await.unwrap();
    assert_eq!(stats["node_id"], "solo");
    assert!(stats["total_rpc_calls"].as_u64().unwrap() >= 8);

    node.close();
}

#[tokio::test]
async fn test_close_is_idempotent_and_stops_listener() {
    let node = start("closing", &[]).await;
    let addr = node.local_addr().to_string();

    node.close();
    node.close();
    assert!(node.is_closed());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(RpcClient::connect(&addr, Duration::from_millis(200)).await.is_err());
}

#[tokio::test]
async fn test_restart_recovers_data_and_clocks() {
    let dir = tempfile::tempdir().unwrap();
    let wal = dir.path().join("ripple.wal");

    let node = Node::start(config("durable", vec![]), Storage::with_config(StorageConfig::with_wal(&wal)).unwrap())
        .await
        .unwrap();
    node.put(b"k", b"v1").await.unwrap();
    node.close();
    drop(node);

    let storage = Storage::with_config(StorageConfig::with_wal(&wal)).unwrap();
    let node = Node::start(config("durable", vec![]), storage).await.unwrap();
    assert_eq!(node.get(b"k").await.unwrap(), Some(b"v1".to_vec()));

    node.put(b"k", b"v2").await.unwrap();
    assert_eq!(node.store().clock(b"k").await.unwrap(), 2);
    assert_eq!(node.store().log_entries("durable").await.unwrap().len(), 2);
    node.close();
}
