use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use log::{debug, info, warn};

use crate::config::MulticastConfig;
use crate::peers::PeerRegistry;

/// Largest datagram we bother reading; announcements are `host:port`
const MAX_DATAGRAM: usize = 512;

/// Parse an announcement payload. Only `host:port` with a valid port counts.
pub fn parse_announcement(payload: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    let (host, port) = text.rsplit_once(':')?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return None;
    }
    Some(text.to_string())
}

/// UDP multicast presence: periodically announce our RPC address to the
/// group and add every other announced address to the registry.
pub struct MulticastDiscovery {
    config: MulticastConfig,
    announce: String,
    registry: PeerRegistry,
}

impl MulticastDiscovery {
    pub fn new(config: MulticastConfig, announce: String, registry: PeerRegistry) -> Self {
        MulticastDiscovery { config, announce, registry }
    }

    /// Run until `shutdown` fires.
    ///
    /// The group port can be bound by only one process per host without
    /// address reuse; when it is taken this node still announces itself
    /// but does not listen.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> std::io::Result<()> {
        let group: Ipv4Addr = self.config.group.parse().map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid multicast group {}", self.config.group),
            )
        })?;
        let target = SocketAddr::V4(SocketAddrV4::new(group, self.config.port));

        let sender = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        sender.set_multicast_loop_v4(true)?;

        let listener = match self.listen(group).await {
            Ok(socket) => Some(socket),
            Err(e) => {
                warn!("Multicast listen on {}:{} unavailable: {}", group, self.config.port, e);
                None
            }
        };
        info!("Multicast discovery on {} (announcing {})", target, self.announce);

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = sender.send_to(self.announce.as_bytes(), target).await {
                        debug!("Multicast announce failed: {}", e);
                    }
                }
                received = recv(listener.as_ref(), &mut buf) => {
                    match received {
                        Ok(n) => self.on_datagram(&buf[..n]).await,
                        Err(e) => debug!("Multicast receive failed: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    async fn listen(&self, group: Ipv4Addr) -> std::io::Result<UdpSocket> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.config.port)).await?;
        socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        Ok(socket)
    }

    async fn on_datagram(&self, payload: &[u8]) {
        match parse_announcement(payload) {
            Some(addr) if addr != self.announce => {
                self.registry.discovered(&addr).await;
            }
            Some(_) => {}
            None => debug!("Ignoring malformed announcement ({} bytes)", payload.len()),
        }
    }
}

async fn recv(socket: Option<&UdpSocket>, buf: &mut [u8]) -> std::io::Result<usize> {
    match socket {
        Some(socket) => socket.recv_from(buf).await.map(|(n, _)| n),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_announcement() {
        assert_eq!(parse_announcement(b"127.0.0.1:9000"), Some("127.0.0.1:9000".to_string()));
        assert_eq!(parse_announcement(b"node-a.local:4001\n"), Some("node-a.local:4001".to_string()));
        assert_eq!(parse_announcement(b"127.0.0.1"), None);
        assert_eq!(parse_announcement(b":9000"), None);
        assert_eq!(parse_announcement(b"host:99999"), None);
        assert_eq!(parse_announcement(&[0xff, 0xfe]), None);
    }

    #[tokio::test]
    async fn test_datagrams_register_other_nodes_only() {
        use crate::config::ReplicationConfig;
        use crate::store::ReplicatedStore;
        use crate::velocity::SharedVelocity;

        let store = ReplicatedStore::open(
            storage::Storage::new(),
            "self".to_string(),
            &ReplicationConfig::default(),
            SharedVelocity::new(),
        ).await.unwrap();
        let registry = PeerRegistry::new(store, "10.0.0.1:9000".to_string(), &[]);
        let discovery = MulticastDiscovery::new(
            MulticastConfig::default(),
            "10.0.0.1:9000".to_string(),
            registry.clone(),
        );

        discovery.on_datagram(b"10.0.0.1:9000").await;
        discovery.on_datagram(b"garbage").await;
        assert!(registry.addresses().await.is_empty());

        discovery.on_datagram(b"10.0.0.2:9000").await;
        discovery.on_datagram(b"10.0.0.2:9000").await;
        assert_eq!(registry.addresses().await, vec!["10.0.0.2:9000".to_string()]);
    }
}
