use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use cluster::{NodeEvent, ReplicatedStore};
use serde_json::json;

/// Node metrics
#[derive(Clone)]
pub struct Metrics {
    pub active_connections: Arc<AtomicUsize>,
    pub total_connections: Arc<AtomicUsize>,
    pub total_rpc_calls: Arc<AtomicUsize>,
    pub sessions_started: Arc<AtomicUsize>,
    pub sessions_completed: Arc<AtomicUsize>,
    pub sessions_failed: Arc<AtomicUsize>,
    pub sessions_timed_out: Arc<AtomicUsize>,
    pub background_errors: Arc<AtomicUsize>,
    pub entries_applied: Arc<AtomicUsize>,
    pub start_time: std::time::Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            active_connections: Arc::new(AtomicUsize::new(0)),
            total_connections: Arc::new(AtomicUsize::new(0)),
            total_rpc_calls: Arc::new(AtomicUsize::new(0)),
            sessions_started: Arc::new(AtomicUsize::new(0)),
            sessions_completed: Arc::new(AtomicUsize::new(0)),
            sessions_failed: Arc::new(AtomicUsize::new(0)),
            sessions_timed_out: Arc::new(AtomicUsize::new(0)),
            background_errors: Arc::new(AtomicUsize::new(0)),
            entries_applied: Arc::new(AtomicUsize::new(0)),
            start_time: std::time::Instant::now(),
        }
    }

    /// Fold one node event into the counters. Every started session ends
    /// in exactly one of completed, timed out or failed.
    pub fn observe(&self, event: &NodeEvent) {
        match event {
            NodeEvent::SessionStart(_) => {
                self.sessions_started.fetch_add(1, Ordering::SeqCst);
            }
            NodeEvent::SessionComplete { applied, .. } => {
                self.sessions_completed.fetch_add(1, Ordering::SeqCst);
                self.entries_applied.fetch_add(*applied, Ordering::SeqCst);
            }
            NodeEvent::Timeout(_) => {
                self.sessions_timed_out.fetch_add(1, Ordering::SeqCst);
            }
            NodeEvent::SessionFailed { .. } => {
                self.sessions_failed.fetch_add(1, Ordering::SeqCst);
            }
            NodeEvent::Error(_) => {
                self.background_errors.fetch_add(1, Ordering::SeqCst);
            }
            NodeEvent::Listening(_) | NodeEvent::Connection(_) | NodeEvent::Connect(_) => {}
        }
    }

    pub async fn to_json(&self, store: &ReplicatedStore) -> String {
        let velocity = store.velocity().lock().clone();
        json!({
            "node_id": store.node_id(),
            "active_connections": self.active_connections.load(Ordering::SeqCst),
            "total_connections": self.total_connections.load(Ordering::SeqCst),
            "total_rpc_calls": self.total_rpc_calls.load(Ordering::SeqCst),
            "sessions_started": self.sessions_started.load(Ordering::SeqCst),
            "sessions_completed": self.sessions_completed.load(Ordering::SeqCst),
            "sessions_failed": self.sessions_failed.load(Ordering::SeqCst),
            "sessions_timed_out": self.sessions_timed_out.load(Ordering::SeqCst),
            "background_errors": self.background_errors.load(Ordering::SeqCst),
            "entries_applied": self.entries_applied.load(Ordering::SeqCst),
            "write_velocity": velocity.velocity(),
            "keys_total": store.storage().keys_count().await,
            "uptime_seconds": self.start_time.elapsed().as_secs(),
        })
        .to_string()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use cluster::ReplicationError;

    #[test]
    fn test_observe_counts_each_outcome_once() {
        let metrics = Metrics::new();
        for addr in ["a", "b", "c"] {
            metrics.observe(&NodeEvent::SessionStart(addr.into()));
        }
        metrics.observe(&NodeEvent::Connect("a".into()));
        metrics.observe(&NodeEvent::SessionComplete { addr: "a".into(), applied: 3 });
        metrics.observe(&NodeEvent::Timeout("b".into()));
        metrics.observe(&NodeEvent::SessionFailed {
            addr: "c".into(),
            error: Arc::new(ReplicationError::Protocol("bad frame".into())),
        });
        metrics.observe(&NodeEvent::Error(Arc::new(ReplicationError::Protocol("discovery".into()))));

        assert_eq!(metrics.sessions_started.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.sessions_completed.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.entries_applied.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.sessions_timed_out.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.sessions_failed.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.background_errors.load(Ordering::SeqCst), 1);
    }
}
