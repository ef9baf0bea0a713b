use cluster::ReplicationError;
use storage::StorageError;

/// Error type for starting and running a node
#[derive(Debug)]
pub enum ServerError {
    InvalidConfig(String),
    IoError(std::io::Error),
    Replication(ReplicationError),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
            ServerError::IoError(e) => write!(f, "IO error: {}", e),
            ServerError::Replication(e) => write!(f, "Replication error: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::IoError(e) => Some(e),
            ServerError::Replication(e) => Some(e),
            ServerError::InvalidConfig(_) => None,
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::IoError(err)
    }
}

impl From<ReplicationError> for ServerError {
    fn from(err: ReplicationError) -> Self {
        ServerError::Replication(err)
    }
}

impl From<StorageError> for ServerError {
    fn from(err: StorageError) -> Self {
        ServerError::Replication(ReplicationError::Storage(err))
    }
}
