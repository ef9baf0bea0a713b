pub mod client;
pub mod error;
pub mod message;
pub mod metrics;
pub mod node;
pub mod opcodes;
pub mod server;

// Re-export commonly used types
pub use client::{RpcClient, TcpConnector};
pub use error::ServerError;
pub use message::Message;
pub use metrics::Metrics;
pub use node::Node;
pub use opcodes::*;
pub use server::RpcServer;
