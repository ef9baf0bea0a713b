use async_trait::async_trait;
use log::{debug, info};
use storage::{RangeOptions, Record};

use crate::error::Result;
use crate::peers::PeerRegistry;
use crate::session::{Introduction, RemotePeer, PROTOCOL_VERSION};
use crate::store::ReplicatedStore;

/// The serving half of replication: what a node answers when a peer's
/// session calls into it. Transports decode requests and dispatch here.
#[derive(Clone)]
pub struct ReplicationService {
    store: ReplicatedStore,
    registry: PeerRegistry,
}

impl ReplicationService {
    pub fn new(store: ReplicatedStore, registry: PeerRegistry) -> Self {
        ReplicationService { store, registry }
    }

    pub fn store(&self) -> &ReplicatedStore {
        &self.store
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn version(&self) -> &'static str {
        PROTOCOL_VERSION
    }

    /// Register a calling peer. A non-zero hint means the caller has
    /// fresh writes; an idle node wakes up so it pulls them back.
    pub async fn add_peer(&self, intro: &Introduction) -> Result<()> {
        self.store.namespaces().validate_node_id(&intro.id)?;
        if self.registry.last_seen(&intro.id).await.is_none() {
            info!("First contact from peer {}", intro.id);
        }
        self.registry.add_peer(&intro.id).await?;
        if let Some(addr) = &intro.addr {
            self.registry.discovered(addr).await;
        }
        if intro.hint > 0 && self.store.velocity().wake() {
            debug!("Woken by peer {} (velocity hint {})", intro.id, intro.hint);
        }
        Ok(())
    }

    pub fn identify(&self) -> &str {
        self.store.node_id()
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.store.get(key).await
    }

    pub async fn read_range(&self, opts: &RangeOptions) -> Result<Vec<Record>> {
        self.store.range(opts).await
    }
}

/// In-process peer: calls go straight to the other node's service
#[async_trait]
impl RemotePeer for ReplicationService {
    async fn version(&mut self) -> Result<String> {
        Ok(ReplicationService::version(self).to_string())
    }

    async fn add_peer(&mut self, intro: &Introduction) -> Result<()> {
        ReplicationService::add_peer(self, intro).await
    }

    async fn identify(&mut self) -> Result<String> {
        Ok(ReplicationService::identify(self).to_string())
    }

    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        ReplicationService::get(self, key).await
    }

    async fn read_range(&mut self, opts: &RangeOptions) -> Result<Vec<Record>> {
        ReplicationService::read_range(self, opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicationConfig;
    use crate::velocity::SharedVelocity;
    use storage::Storage;

    async fn service() -> ReplicationService {
        let store = ReplicatedStore::open(
            Storage::new(),
            "node".to_string(),
            &ReplicationConfig::default(),
            SharedVelocity::new(),
        ).await.unwrap();
        let registry = PeerRegistry::new(store.clone(), "127.0.0.1:9000".to_string(), &[]);
        ReplicationService::new(store, registry)
    }

    #[tokio::test]
    async fn test_hint_wakes_idle_node() {
        let svc = service().await;

        let intro = |id: &str, hint| Introduction { id: id.to_string(), addr: None, hint };

        svc.add_peer(&intro("quiet", 0)).await.unwrap();
        assert_eq!(svc.store().velocity().velocity(), 0);

        svc.add_peer(&intro("busy", 7)).await.unwrap();
        assert_eq!(svc.store().velocity().velocity(), 1);
        assert_eq!(svc.store().velocity().earned(), 0);
        assert_eq!(svc.registry().list_peers().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_introduction_records_dial_back_address() {
        let svc = service().await;
        svc.add_peer(&Introduction {
            id: "other".to_string(),
            addr: Some("127.0.0.1:9001".to_string()),
            hint: 0,
        }).await.unwrap();

        assert_eq!(svc.registry().addresses().await, vec!["127.0.0.1:9001".to_string()]);
    }
}
