// Core modules
pub mod types;
pub mod config;
pub mod error;
pub mod storage;

// Support modules
pub mod wal;

// Re-export main types for convenience
pub use types::{BatchOp, RangeOptions, Record, prefix_upper_bound};
pub use config::StorageConfig;
pub use error::StorageError;
pub use storage::Storage;
