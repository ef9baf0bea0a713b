use std::time::Duration;
use async_trait::async_trait;
use storage::{RangeOptions, Record};
use tokio::net::TcpStream;
use cluster::{Connector, Introduction, RemotePeer, ReplicationError, Result};

use crate::message::{encode_introduction, Message};
use crate::opcodes::*;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// One RPC connection to a node. Calls are strictly request/response and
/// run one at a time.
pub struct RpcClient {
    stream: TcpStream,
}

impl RpcClient {
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ReplicationError::Transport(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {} timed out", addr),
            )))??;
        stream.set_nodelay(true)?;
        Ok(RpcClient { stream })
    }

    async fn call(&mut self, request: Message) -> Result<Message> {
        request.send_async(&mut self.stream).await?;
        let response = Message::receive_async(&mut self.stream).await?;
        if response.code == OP_ERROR {
            return Err(ReplicationError::Protocol(String::from_utf8_lossy(&response.value).to_string()));
        }
        Ok(response)
    }

    async fn call_expecting(&mut self, request: Message, code: u16) -> Result<Message> {
        let response = self.call(request).await?;
        if response.code != code {
            return Err(unexpected(response.code));
        }
        Ok(response)
    }

    async fn call_for_string(&mut self, request: Message) -> Result<String> {
        let response = self.call_expecting(request, OP_VALUE).await?;
        String::from_utf8(response.value)
            .map_err(|_| ReplicationError::Protocol("reply is not UTF-8".to_string()))
    }

    /// Write through the remote node's replicating store
    pub async fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.call_expecting(Message::new(OP_PUT, key, value), OP_ACK).await?;
        Ok(())
    }

    pub async fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.call_expecting(Message::new(OP_DEL, key, Vec::new()), OP_ACK).await?;
        Ok(())
    }

    /// Remote node's metrics as JSON
    pub async fn stats(&mut self) -> Result<serde_json::Value> {
        let raw = self.call_for_string(Message::empty(OP_STATS)).await?;
        Ok(serde_json::from_str(&raw)?)
    }
}

fn unexpected(code: u16) -> ReplicationError {
    ReplicationError::Protocol(format!("unexpected reply code {}", code))
}

#[async_trait]
impl RemotePeer for RpcClient {
    async fn version(&mut self) -> Result<String> {
        self.call_for_string(Message::empty(OP_VERSION)).await
    }

    async fn add_peer(&mut self, intro: &Introduction) -> Result<()> {
        self.call_expecting(encode_introduction(intro), OP_ACK).await?;
        Ok(())
    }

    async fn identify(&mut self) -> Result<String> {
        self.call_for_string(Message::empty(OP_IDENTIFY)).await
    }

    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let response = self.call(Message::new(OP_GET, key, Vec::new())).await?;
        match response.code {
            OP_VALUE => Ok(Some(response.value)),
            OP_NOT_FOUND => Ok(None),
            code => Err(unexpected(code)),
        }
    }

    async fn read_range(&mut self, opts: &RangeOptions) -> Result<Vec<Record>> {
        let request = Message::new(OP_READ_STREAM, Vec::new(), serde_json::to_vec(opts)?);
        let mut response = self.call(request).await?;

        let mut records = Vec::new();
        loop {
            match response.code {
                OP_RECORD => records.push(Record {
                    key: opts.keys.then_some(response.key),
                    value: opts.values.then_some(response.value),
                }),
                OP_STREAM_END => return Ok(records),
                code => return Err(unexpected(code)),
            }
            response = Message::receive_async(&mut self.stream).await?;
        }
    }
}

/// Dials peers over TCP
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        TcpConnector { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Peer = RpcClient;

    async fn connect(&self, addr: &str) -> Result<RpcClient> {
        RpcClient::connect(addr, self.connect_timeout).await
    }
}
