pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod identity;
pub mod keys;
pub mod peers;
pub mod scheduler;
pub mod sequence;
pub mod service;
pub mod session;
pub mod store;
pub mod velocity;
pub mod versioned_log;

// Re-exports for convenience
pub use config::{ConflictResolver, ConnectionConfig, IdentifyHook, MulticastConfig, ReplicationConfig};
pub use discovery::MulticastDiscovery;
pub use error::{ReplicationError, Result};
pub use events::{EventBus, NodeEvent};
pub use identity::resolve_node_id;
pub use keys::Namespaces;
pub use peers::PeerRegistry;
pub use scheduler::{interval_for, ConnectionScheduler, PeerSelector, RandomSelector};
pub use sequence::Sequence;
pub use service::ReplicationService;
pub use session::{Connector, Introduction, RemotePeer, ReplicationSession, SessionContext, PROTOCOL_VERSION};
pub use store::{RemoteMutation, ReplicatedStore};
pub use velocity::{SharedVelocity, WriteVelocity};
pub use versioned_log::{IndexEntry, LogEntry, OpType};
