//! One outbound replication run against one peer.
//!
//! Stages run strictly in order: connect, version check, introduce,
//! identify, discover candidate origins, pull each origin's log newer than
//! our cursor, fetch values for entries that would win, then apply
//! everything in one local batch. Any failure aborts the session; nothing
//! is committed before the final apply.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, info};
use storage::{RangeOptions, Record};

use crate::config::IdentifyHook;
use crate::error::{ReplicationError, Result};
use crate::events::{EventBus, NodeEvent};
use crate::versioned_log::{decide_remote, Decision, LogEntry, OpType};
use crate::peers::PeerRegistry;
use crate::store::{RemoteMutation, ReplicatedStore};

/// Sessions abort unless both ends report exactly this string
pub const PROTOCOL_VERSION: &str = "ripple/1";

/// What a session tells the remote node about us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Introduction {
    pub id: String,
    /// Address our RPC server announces, so the remote can dial back
    pub addr: Option<String>,
    /// Our earned write velocity
    pub hint: u64,
}

/// RPC surface a session needs from the remote node.
#[async_trait]
pub trait RemotePeer: Send {
    async fn version(&mut self) -> Result<String>;
    async fn add_peer(&mut self, intro: &Introduction) -> Result<()>;
    async fn identify(&mut self) -> Result<String>;
    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    async fn read_range(&mut self, opts: &RangeOptions) -> Result<Vec<Record>>;
}

/// Opens connections to peers by address.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Peer: RemotePeer + 'static;

    async fn connect(&self, addr: &str) -> Result<Self::Peer>;
}

/// Everything a session needs from the local node.
#[derive(Clone)]
pub struct SessionContext {
    pub store: ReplicatedStore,
    pub registry: PeerRegistry,
    pub identify: Option<IdentifyHook>,
    pub tmax: Option<Duration>,
    pub events: EventBus,
}

pub struct ReplicationSession<'a, C: Connector> {
    ctx: &'a SessionContext,
    connector: &'a C,
    addr: String,
}

impl<'a, C: Connector> ReplicationSession<'a, C> {
    pub fn new(ctx: &'a SessionContext, connector: &'a C, addr: impl Into<String>) -> Self {
        ReplicationSession { ctx, connector, addr: addr.into() }
    }

    /// Run the session to completion or until `tmax` expires. Returns the
    /// number of remote entries applied.
    pub async fn run(self) -> Result<usize> {
        match self.ctx.tmax {
            Some(tmax) => tokio::time::timeout(tmax, self.stages())
                .await
                .map_err(|_| ReplicationError::Timeout(self.addr.clone()))?,
            None => self.stages().await,
        }
    }

    /// Run the session and report the outcome on the event bus instead of
    /// returning it.
    pub async fn run_reported(self) -> Option<usize> {
        let events = self.ctx.events.clone();
        let addr = self.addr.clone();
        events.emit(NodeEvent::SessionStart(addr.clone()));
        match self.run().await {
            Ok(applied) => {
                events.emit(NodeEvent::SessionComplete { addr, applied });
                Some(applied)
            }
            Err(ReplicationError::Timeout(addr)) => {
                info!("Session with {} timed out", addr);
                events.emit(NodeEvent::Timeout(addr));
                None
            }
            Err(e) => {
                events.session_failed(addr, e);
                None
            }
        }
    }

    async fn stages(&self) -> Result<usize> {
        let store = &self.ctx.store;
        let ns = store.namespaces();

        let mut peer = self.connector.connect(&self.addr).await?;
        self.ctx.events.emit(NodeEvent::Connect(self.addr.clone()));

        let remote_version = peer.version().await?;
        if remote_version != PROTOCOL_VERSION {
            return Err(ReplicationError::VersionMismatch {
                local: PROTOCOL_VERSION.to_string(),
                remote: remote_version,
            });
        }

        peer.add_peer(&Introduction {
            id: store.node_id().to_string(),
            addr: Some(self.ctx.registry.self_addr().to_string()),
            hint: store.velocity().earned(),
        }).await?;

        let remote_id = peer.identify().await?;
        ns.validate_node_id(&remote_id)?;
        if let Some(hook) = &self.ctx.identify {
            if !hook.accept(&remote_id) {
                return Err(ReplicationError::PeerRejected(remote_id));
            }
        }
        if remote_id == store.node_id() {
            debug!("{} is this node, skipping", self.addr);
            return Ok(0);
        }
        self.ctx.registry.add_peer(&remote_id).await?;

        let mut origins: BTreeSet<String> = peer
            .read_range(&RangeOptions::prefix(&ns.peers).keys_only())
            .await?
            .into_iter()
            .filter_map(|r| r.key)
            .filter_map(|key| ns.strip(&ns.peers, &key).map(str::to_string))
            .filter(|id| ns.is_valid_node_id(id))
            .collect();
        origins.insert(remote_id);
        origins.remove(store.node_id());

        let cursors = store.history().await?;
        let mut candidates = Vec::new();
        let mut consumed = Vec::new();

        for origin in origins {
            let scan = ns.log_scan(&origin, cursors.get(&origin).map(Vec::as_slice));
            let records = peer.read_range(&scan).await?;

            let mut newest = None;
            let mut seen = HashSet::new();
            for record in records {
                let (Some(key), Some(value)) = (record.key, record.value) else {
                    return Err(ReplicationError::Protocol("log record without key or value".to_string()));
                };
                if !scan.contains(&key) {
                    return Err(ReplicationError::Protocol("log record outside requested range".to_string()));
                }
                let entry = LogEntry::decode(&value)?;
                if entry.origin != origin {
                    debug!("Ignoring {} entry listed under {} by {}", entry.origin, origin, self.addr);
                    continue;
                }
                if newest.is_none() {
                    newest = Some(key);
                }
                // reverse scan: the first entry per key is that origin's newest
                if seen.insert(entry.key.clone()) {
                    candidates.push(entry);
                }
            }

            if let Some(cursor) = newest {
                debug!("Pulled {} keys of {} from {}", seen.len(), origin, self.addr);
                consumed.push((origin, cursor));
            }
        }

        let mutations = self.fetch_winners(&mut peer, candidates).await?;
        if mutations.is_empty() && consumed.is_empty() {
            return Ok(0);
        }

        let applied = store.apply_remote(mutations, consumed).await?;
        if applied > 0 {
            info!("Applied {} entries from {}", applied, self.addr);
        }
        Ok(applied)
    }

    /// Fetch current remote values for candidates that could beat local state.
    ///
    /// Ties are fetched too when a resolver is configured, since it needs
    /// both values. The final decision is made again at apply time.
    async fn fetch_winners(
        &self,
        peer: &mut C::Peer,
        candidates: Vec<LogEntry>,
    ) -> Result<Vec<RemoteMutation>> {
        let store = &self.ctx.store;
        let optimistic = store.has_resolver().then_some(|| true);
        let mut fetched: HashMap<Vec<u8>, Option<Vec<u8>>> = HashMap::new();
        let mut mutations = Vec::new();

        for entry in candidates {
            let local = store.index_entry(&entry.key).await?;
            if let Decision::Reject = decide_remote(local.as_ref(), &entry, optimistic) {
                continue;
            }

            let value = match entry.op {
                OpType::Delete => None,
                OpType::Put => match fetched.get(&entry.key) {
                    Some(value) => value.clone(),
                    None => {
                        let value = peer.get(&entry.key).await?;
                        fetched.insert(entry.key.clone(), value.clone());
                        value
                    }
                },
            };
            mutations.push(RemoteMutation { entry, value });
        }

        Ok(mutations)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Arc;
    use async_trait::async_trait;
    use storage::Storage;

    use super::*;
    use crate::config::ReplicationConfig;
    use crate::service::ReplicationService;
    use crate::velocity::SharedVelocity;

    /// Routes addresses to in-process services
    #[derive(Clone, Default)]
    pub struct InProcessConnector {
        pub nodes: Arc<std::sync::Mutex<HashMap<String, ReplicationService>>>,
    }

    impl InProcessConnector {
        pub fn register(&self, addr: &str, service: ReplicationService) {
            self.nodes.lock().unwrap().insert(addr.to_string(), service);
        }
    }

    #[async_trait]
    impl Connector for InProcessConnector {
        type Peer = ReplicationService;

        async fn connect(&self, addr: &str) -> Result<ReplicationService> {
            self.nodes.lock().unwrap().get(addr).cloned().ok_or_else(|| {
                ReplicationError::Transport(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    addr.to_string(),
                ))
            })
        }
    }

    pub async fn test_node(id: &str, addr: &str, config: &ReplicationConfig) -> SessionContext {
        let store = ReplicatedStore::open(Storage::new(), id.to_string(), config, SharedVelocity::new())
            .await
            .unwrap();
        let registry = PeerRegistry::new(store.clone(), addr.to_string(), &config.peers);
        SessionContext {
            store,
            registry,
            identify: config.identify.clone(),
            tmax: config.connections.tmax,
            events: EventBus::default(),
        }
    }

    pub fn service_of(ctx: &SessionContext) -> ReplicationService {
        ReplicationService::new(ctx.store.clone(), ctx.registry.clone())
    }
}
