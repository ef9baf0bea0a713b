use std::sync::atomic::Ordering;
use log::{debug, info};
use storage::RangeOptions;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use cluster::{EventBus, NodeEvent, ReplicationService};

use crate::message::{decode_introduction, Message};
use crate::metrics::Metrics;
use crate::opcodes::*;

/// Accept loop answering peers' replication RPCs and clients' writes.
pub struct RpcServer {
    service: ReplicationService,
    metrics: Metrics,
    events: EventBus,
}

impl RpcServer {
    pub fn new(service: ReplicationService, metrics: Metrics, events: EventBus) -> Self {
        RpcServer { service, metrics, events }
    }

    /// Serve connections on `listener` until `shutdown` fires. Dropping
    /// out of this loop closes the listening socket.
    pub async fn run(&self, listener: TcpListener, shutdown_tx: broadcast::Sender<()>) {
        let mut shutdown_rx = shutdown_tx.subscribe();
        if let Ok(addr) = listener.local_addr() {
            info!("RPC server listening on {}", addr);
            self.events.emit(NodeEvent::Listening(addr.to_string()));
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let _ = stream.set_nodelay(true);
                            let service = self.service.clone();
                            let metrics = self.metrics.clone();
                            let mut client_shutdown_rx = shutdown_tx.subscribe();

                            debug!("New connection from {}", peer_addr);
                            self.events.emit(NodeEvent::Connection(peer_addr.to_string()));
                            metrics.total_connections.fetch_add(1, Ordering::SeqCst);
                            metrics.active_connections.fetch_add(1, Ordering::SeqCst);

                            tokio::spawn(async move {
                                let result = handle_client(stream, &service, &metrics, &mut client_shutdown_rx).await;
                                metrics.active_connections.fetch_sub(1, Ordering::SeqCst);

                                if let Err(e) = result {
                                    info!("Connection closed from {}: {}", peer_addr, e);
                                } else {
                                    debug!("Connection closed from {}", peer_addr);
                                }
                            });
                        }
                        Err(e) => {
                            info!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("RPC server stopped");
                    return;
                }
            }
        }
    }
}

async fn handle_client<S>(
    mut stream: S,
    service: &ReplicationService,
    metrics: &Metrics,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            result = Message::receive_async(&mut stream) => {
                match result {
                    Ok(message) => {
                        metrics.total_rpc_calls.fetch_add(1, Ordering::SeqCst);
                        process_message(&message, service, metrics, &mut stream).await?;
                    }
                    Err(e) => {
                        if e.kind() == std::io::ErrorKind::UnexpectedEof {
                            return Ok(());
                        }
                        return Err(e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                return Ok(());
            }
        }
    }
}

async fn process_message<S>(
    message: &Message,
    service: &ReplicationService,
    metrics: &Metrics,
    stream: &mut S,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let store = service.store();
    match message.code {
        OP_VERSION => {
            Message::value(service.version()).send_async(stream).await?;
        }
        OP_ADD_PEER => {
            let response = match decode_introduction(message) {
                Ok(intro) => match service.add_peer(&intro).await {
                    Ok(()) => Message::empty(OP_ACK),
                    Err(e) => Message::error(e),
                },
                Err(e) => Message::error(e),
            };
            response.send_async(stream).await?;
        }
        OP_IDENTIFY => {
            Message::value(service.identify()).send_async(stream).await?;
        }
        OP_GET => {
            let response = match service.get(&message.key).await {
                Ok(Some(value)) => Message::value(value),
                Ok(None) => Message::empty(OP_NOT_FOUND),
                Err(e) => Message::error(e),
            };
            response.send_async(stream).await?;
        }
        OP_READ_STREAM => {
            let opts: RangeOptions = match serde_json::from_slice(&message.value) {
                Ok(opts) => opts,
                Err(e) => {
                    return Message::error(format!("invalid range options: {}", e)).send_async(stream).await;
                }
            };
            match service.read_range(&opts).await {
                Ok(records) => {
                    for record in records {
                        Message::new(
                            OP_RECORD,
                            record.key.unwrap_or_default(),
                            record.value.unwrap_or_default(),
                        ).send_async(stream).await?;
                    }
                    Message::empty(OP_STREAM_END).send_async(stream).await?;
                }
                Err(e) => Message::error(e).send_async(stream).await?,
            }
        }
        OP_PUT => {
            let response = match store.put(&message.key, &message.value).await {
                Ok(()) => Message::empty(OP_ACK),
                Err(e) => Message::error(e),
            };
            response.send_async(stream).await?;
        }
        OP_DEL => {
            let response = match store.delete(&message.key).await {
                Ok(()) => Message::empty(OP_ACK),
                Err(e) => Message::error(e),
            };
            response.send_async(stream).await?;
        }
        OP_STATS => {
            Message::value(metrics.to_json(store).await).send_async(stream).await?;
        }
        code => {
            info!("Unknown operation: {}", code);
            Message::error(format!("unknown operation {}", code)).send_async(stream).await?;
        }
    }
    Ok(())
}
