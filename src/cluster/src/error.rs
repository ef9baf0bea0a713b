use storage::StorageError;

/// Errors raised by the replication engine.
///
/// Transport, version, protocol and timeout errors abort the current session
/// only; the scheduler simply tries again later. Storage errors are returned
/// to whoever issued the write.
#[derive(Debug)]
pub enum ReplicationError {
    /// Connection refused, reset or broken mid-stream
    Transport(std::io::Error),
    /// A node id that cannot be embedded in log keys
    InvalidNodeId(String),
    /// Configuration the store cannot work with
    InvalidConfig(String),
    /// The peer speaks a different protocol version
    VersionMismatch { local: String, remote: String },
    /// Underlying store failure
    Storage(StorageError),
    /// Malformed or unexpected remote response
    Protocol(String),
    /// The identify hook refused the peer
    PeerRejected(String),
    /// The session ran past its `tmax`
    Timeout(String),
}

impl std::fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationError::Transport(e) => write!(f, "Transport error: {}", e),
            ReplicationError::InvalidNodeId(id) => write!(f, "Invalid node id: {:?}", id),
            ReplicationError::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
            ReplicationError::VersionMismatch { local, remote } => {
                write!(f, "Version mismatch: local {} remote {}", local, remote)
            }
            ReplicationError::Storage(e) => write!(f, "Storage error: {}", e),
            ReplicationError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            ReplicationError::PeerRejected(id) => write!(f, "Peer rejected: {}", id),
            ReplicationError::Timeout(addr) => write!(f, "Session timed out: {}", addr),
        }
    }
}

impl std::error::Error for ReplicationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReplicationError::Transport(e) => Some(e),
            ReplicationError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ReplicationError {
    fn from(err: std::io::Error) -> Self {
        ReplicationError::Transport(err)
    }
}

impl From<StorageError> for ReplicationError {
    fn from(err: StorageError) -> Self {
        ReplicationError::Storage(err)
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(err: serde_json::Error) -> Self {
        ReplicationError::Protocol(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReplicationError>;
