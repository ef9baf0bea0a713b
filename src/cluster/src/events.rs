use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::ReplicationError;

/// Lifecycle and error notifications published by a node.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// The RPC listener is bound
    Listening(String),
    /// A remote peer opened an inbound connection
    Connection(String),
    /// The scheduler started an outbound session
    SessionStart(String),
    /// An outbound session connected to a peer
    Connect(String),
    /// An outbound session finished and applied `applied` remote entries
    SessionComplete { addr: String, applied: usize },
    /// An outbound session was cut off by `tmax`
    Timeout(String),
    /// An outbound session aborted
    SessionFailed { addr: String, error: Arc<ReplicationError> },
    /// A background failure outside any session, such as discovery
    Error(Arc<ReplicationError>),
}

/// Fan-out channel for [`NodeEvent`]s. Publishing never blocks and never
/// fails; events sent while nobody listens are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: NodeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn session_failed(&self, addr: String, err: ReplicationError) {
        log::info!("Session with {} failed: {}", addr, err);
        self.emit(NodeEvent::SessionFailed { addr, error: Arc::new(err) });
    }

    pub fn error(&self, err: ReplicationError) {
        log::info!("Replication error: {}", err);
        self.emit(NodeEvent::Error(Arc::new(err)));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
