use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use log::info;
use storage::{BatchOp, RangeOptions};

use crate::error::Result;
use crate::store::ReplicatedStore;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Known peers, in two independent views.
///
/// Peer *ids* live in the peers namespace of the store and are learned
/// through `addPeer` calls; they name the logs worth pulling. Peer
/// *addresses* are the reachable servers the scheduler dials, seeded from
/// configuration and grown by multicast discovery.
#[derive(Clone)]
pub struct PeerRegistry {
    store: ReplicatedStore,
    self_addr: String,
    addresses: Arc<RwLock<BTreeSet<String>>>,
}

impl PeerRegistry {
    pub fn new(store: ReplicatedStore, self_addr: String, seeds: &[String]) -> Self {
        let addresses = seeds.iter()
            .filter(|addr| **addr != self_addr)
            .cloned()
            .collect();
        PeerRegistry {
            store,
            self_addr,
            addresses: Arc::new(RwLock::new(addresses)),
        }
    }

    /// Upsert `id` with the current timestamp.
    ///
    /// Peer bookkeeping is node-local and bypasses the replication log.
    pub async fn add_peer(&self, id: &str) -> Result<()> {
        let ns = self.store.namespaces();
        let op = BatchOp::put(ns.peer_key(id), now_ms().to_string());
        self.store.storage().batch(vec![op]).await?;
        Ok(())
    }

    /// Milliseconds timestamp of the last `add_peer` for `id`
    pub async fn last_seen(&self, id: &str) -> Option<u64> {
        let raw = self.store.storage().get(&self.store.namespaces().peer_key(id)).await?;
        std::str::from_utf8(&raw).ok()?.parse().ok()
    }

    /// Every known peer id except this node's own
    pub async fn list_peers(&self) -> Result<Vec<String>> {
        let ns = self.store.namespaces();
        let records = self.store.range(&RangeOptions::prefix(&ns.peers).keys_only()).await?;
        Ok(records.into_iter()
            .filter_map(|r| r.key)
            .filter_map(|key| ns.strip(&ns.peers, &key).map(str::to_string))
            .filter(|id| id != self.store.node_id())
            .collect())
    }

    /// Record a reachable address. Returns true if it was not known yet.
    pub async fn discovered(&self, addr: &str) -> bool {
        if addr == self.self_addr {
            return false;
        }
        let added = self.addresses.write().await.insert(addr.to_string());
        if added {
            info!("Discovered peer at {}", addr);
        }
        added
    }

    pub async fn addresses(&self) -> Vec<String> {
        self.addresses.read().await.iter().cloned().collect()
    }

    pub fn self_addr(&self) -> &str {
        &self.self_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicationConfig;
    use crate::velocity::SharedVelocity;
    use storage::Storage;

    async fn registry(seeds: &[String]) -> PeerRegistry {
        let store = ReplicatedStore::open(
            Storage::new(),
            "self".to_string(),
            &ReplicationConfig::default(),
            SharedVelocity::new(),
        ).await.unwrap();
        PeerRegistry::new(store, "127.0.0.1:9000".to_string(), seeds)
    }

    #[tokio::test]
    async fn test_list_peers_excludes_self() {
        let peers = registry(&[]).await;
        peers.add_peer("self").await.unwrap();
        peers.add_peer("b").await.unwrap();
        peers.add_peer("a").await.unwrap();
        peers.add_peer("a").await.unwrap();

        assert_eq!(peers.list_peers().await.unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert!(peers.last_seen("a").await.unwrap() > 0);
        assert_eq!(peers.last_seen("zzz").await, None);
    }

    #[tokio::test]
    async fn test_peer_records_are_not_logged() {
        let peers = registry(&[]).await;
        peers.add_peer("b").await.unwrap();

        assert!(peers.store.log_entries("self").await.unwrap().is_empty());
        assert_eq!(peers.store.velocity().velocity(), 0);
    }

    #[tokio::test]
    async fn test_discovery_adds_addresses_once() {
        let peers = registry(&["127.0.0.1:9001".to_string(), "127.0.0.1:9000".to_string()]).await;
        assert_eq!(peers.addresses().await, vec!["127.0.0.1:9001".to_string()]);

        assert!(peers.discovered("127.0.0.1:9002").await);
        assert!(!peers.discovered("127.0.0.1:9002").await);
        assert!(!peers.discovered("127.0.0.1:9000").await);
        assert_eq!(peers.addresses().await.len(), 2);
    }
}
