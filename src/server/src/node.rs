use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use log::{info, warn};
use storage::{BatchOp, RangeOptions, Record, Storage};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use cluster::{
    resolve_node_id, ConnectionScheduler, EventBus, MulticastDiscovery, NodeEvent, PeerRegistry,
    ReplicatedStore, ReplicationConfig, ReplicationService, Result, SessionContext, SharedVelocity,
};

use crate::client::TcpConnector;
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::server::RpcServer;

/// A running replica: the replicating store, its RPC server, the
/// connection scheduler and, when enabled, multicast discovery.
pub struct Node {
    store: ReplicatedStore,
    registry: PeerRegistry,
    events: EventBus,
    metrics: Metrics,
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Node {
    /// Bind the RPC listener and start every background task.
    ///
    /// A configured port of 0 binds an ephemeral port; the address actually
    /// announced to peers is `host:<bound port>`.
    pub async fn start(config: ReplicationConfig, storage: Storage) -> std::result::Result<Self, ServerError> {
        if config.host.is_empty() {
            return Err(ServerError::InvalidConfig("host must not be empty".to_string()));
        }
        let node_id = resolve_node_id(config.node_id.as_deref(), config.data_dir.as_deref())?;

        let listener = TcpListener::bind(config.address()).await?;
        let local_addr = listener.local_addr()?;
        let announce = format!("{}:{}", config.host, local_addr.port());

        let store = ReplicatedStore::open(storage, node_id.clone(), &config, SharedVelocity::new()).await?;
        let registry = PeerRegistry::new(store.clone(), announce.clone(), &config.peers);
        let events = EventBus::default();
        let metrics = Metrics::new();
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        info!("Node {} starting on {} ({} seed peers)", node_id, announce, config.peers.len());

        let mut tasks = Vec::new();

        let observer_metrics = metrics.clone();
        let mut observed = events.subscribe();
        let mut observer_shutdown = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = observed.recv() => match event {
                        Ok(event) => observer_metrics.observe(&event),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Metrics observer skipped {} events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    _ = observer_shutdown.recv() => return,
                }
            }
        }));

        let service = ReplicationService::new(store.clone(), registry.clone());
        let server = RpcServer::new(service, metrics.clone(), events.clone());
        let server_shutdown = shutdown_tx.clone();
        tasks.push(tokio::spawn(async move {
            server.run(listener, server_shutdown).await;
        }));

        let ctx = Arc::new(SessionContext {
            store: store.clone(),
            registry: registry.clone(),
            identify: config.identify.clone(),
            tmax: config.connections.tmax,
            events: events.clone(),
        });
        let scheduler = ConnectionScheduler::new(
            ctx,
            Arc::new(TcpConnector::default()),
            config.connections.clone(),
            config.multiplier,
        );
        let scheduler_shutdown = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(scheduler.run(scheduler_shutdown)));

        if config.multicast.enabled {
            let discovery = MulticastDiscovery::new(config.multicast.clone(), announce.clone(), registry.clone());
            let discovery_shutdown = shutdown_tx.subscribe();
            let discovery_events = events.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = discovery.run(discovery_shutdown).await {
                    discovery_events.error(e.into());
                }
            }));
        }

        Ok(Node {
            store,
            registry,
            events,
            metrics,
            local_addr,
            shutdown_tx,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        })
    }

    pub fn node_id(&self) -> &str {
        self.store.node_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn store(&self) -> &ReplicatedStore {
        &self.store
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.store.get(key).await
    }

    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.store.put(key, value).await
    }

    pub async fn delete(&self, key: &[u8]) -> Result<()> {
        self.store.delete(key).await
    }

    pub async fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        self.store.batch(ops).await
    }

    pub async fn range(&self, opts: &RangeOptions) -> Result<Vec<Record>> {
        self.store.range(opts).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the listener, the timers and every in-flight session.
    ///
    /// Idempotent, and returns without waiting for sessions to unwind.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing node {}", self.store.node_id());
        let _ = self.shutdown_tx.send(());

        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.close();
    }
}
