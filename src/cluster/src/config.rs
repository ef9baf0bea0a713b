use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};

/// Tie-breaker consulted when a remote entry has the same clock as the
/// local one. Receives `(local_value, remote_value)`; a missing value means
/// the key is currently deleted on that side. Returns true if the remote
/// value should win.
#[derive(Clone)]
pub struct ConflictResolver(Arc<dyn Fn(Option<&[u8]>, Option<&[u8]>) -> bool + Send + Sync>);

impl ConflictResolver {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Option<&[u8]>, Option<&[u8]>) -> bool + Send + Sync + 'static,
    {
        ConflictResolver(Arc::new(f))
    }

    pub fn remote_wins(&self, local: Option<&[u8]>, remote: Option<&[u8]>) -> bool {
        (self.0)(local, remote)
    }
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConflictResolver")
    }
}

/// Gate applied to a peer's identity before any data is pulled from it.
#[derive(Clone)]
pub struct IdentifyHook(Arc<dyn Fn(&str) -> bool + Send + Sync>);

impl IdentifyHook {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        IdentifyHook(Arc::new(f))
    }

    pub fn accept(&self, peer_id: &str) -> bool {
        (self.0)(peer_id)
    }
}

impl std::fmt::Debug for IdentifyHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IdentifyHook")
    }
}

/// Outbound connection tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Connect interval at zero-ish velocity
    #[serde(with = "millis")]
    pub interval: Duration,
    /// Lower bound for the connect interval
    #[serde(with = "millis")]
    pub floor: Duration,
    /// Period of the velocity decay loop
    #[serde(with = "millis")]
    pub tick: Duration,
    /// Hard cap on one session's wall-clock time
    #[serde(with = "opt_millis")]
    pub tmax: Option<Duration>,
    /// Flat ticks per unit of velocity before velocity drops by one
    pub decay_factor: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            interval: Duration::from_millis(500),
            floor: Duration::from_millis(25),
            tick: Duration::from_millis(1000),
            tmax: Some(Duration::from_millis(5000)),
            decay_factor: 2,
        }
    }
}

/// UDP multicast peer discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MulticastConfig {
    pub enabled: bool,
    pub group: String,
    pub port: u16,
    #[serde(with = "millis")]
    pub interval: Duration,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        MulticastConfig {
            enabled: false,
            group: "224.0.0.1".to_string(),
            port: 4001,
            interval: Duration::from_millis(1000),
        }
    }
}

/// Replication configuration, handed explicitly to every component
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub node_id: Option<String>,
    pub host: String,
    pub port: u16,
    /// Seed peers in `host:port` form
    pub peers: Vec<String>,
    pub multicast: MulticastConfig,
    /// Scales how strongly write velocity shortens the connect interval
    pub multiplier: f64,
    pub connections: ConnectionConfig,
    /// Keep superseded log entries (append-only log)
    pub retain_log: bool,
    /// Leading byte of every internal key; application keys may not start with it
    pub separator: u8,
    pub data_dir: Option<String>,
    #[serde(skip)]
    pub resolver: Option<ConflictResolver>,
    #[serde(skip)]
    pub identify: Option<IdentifyHook>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            node_id: None,
            host: "127.0.0.1".to_string(),
            port: 9000,
            peers: Vec::new(),
            multicast: MulticastConfig::default(),
            multiplier: 1.0,
            connections: ConnectionConfig::default(),
            retain_log: true,
            separator: crate::keys::DEFAULT_SEPARATOR,
            data_dir: None,
            resolver: None,
            identify: None,
        }
    }
}

impl ReplicationConfig {
    /// Address this node listens on and announces
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_identify(mut self, hook: IdentifyHook) -> Self {
        self.identify = Some(hook);
        self
    }

    /// Load from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
    }

    /// Create config from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = match std::env::var("RIPPLE_CONFIG") {
            Ok(path) => match Self::from_file(&path) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!("Failed to load config file '{}': {}, using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        };

        if let Ok(id) = std::env::var("RIPPLE_NODE_ID") {
            config.node_id = Some(id);
        }
        if let Ok(host) = std::env::var("RIPPLE_HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse("RIPPLE_PORT") {
            config.port = port;
        }

        let peers_str = std::env::var("RIPPLE_PEERS").unwrap_or_default();
        if !peers_str.is_empty() {
            config.peers = peers_str.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(v) = std::env::var("RIPPLE_MULTICAST") {
            config.multicast.enabled = v == "1" || v.to_lowercase() == "true";
        }
        if let Ok(group) = std::env::var("RIPPLE_MULTICAST_GROUP") {
            config.multicast.group = group;
        }
        if let Some(port) = env_parse("RIPPLE_MULTICAST_PORT") {
            config.multicast.port = port;
        }
        if let Some(multiplier) = env_parse("RIPPLE_MULTIPLIER") {
            config.multiplier = multiplier;
        }

        if let Some(ms) = env_parse::<u64>("RIPPLE_CONNECT_INTERVAL_MS") {
            config.connections.interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("RIPPLE_CONNECT_TMAX_MS") {
            config.connections.tmax = if ms == 0 { None } else { Some(Duration::from_millis(ms)) };
        }
        if let Some(ms) = env_parse::<u64>("RIPPLE_TICK_MS") {
            config.connections.tick = Duration::from_millis(ms);
        }

        if let Ok(v) = std::env::var("RIPPLE_RETAIN_LOG") {
            config.retain_log = v == "1" || v.to_lowercase() == "true";
        }
        if let Ok(dir) = std::env::var("RIPPLE_DATA_DIR") {
            config.data_dir = Some(dir);
        }
        if let Some(separator) = env_parse("RIPPLE_SEPARATOR") {
            config.separator = separator;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("Invalid {} '{}', ignoring", name, raw);
            None
        }
    }
}

mod millis {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod opt_millis {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        // 0 stands for "no cap" since TOML has no null
        s.serialize_u64(d.map(|d| d.as_millis() as u64).unwrap_or(0))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok((ms > 0).then(|| Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ripple.toml");
        std::fs::write(&path, r#"
            node_id = "node-a"
            port = 9100
            peers = ["127.0.0.1:9101", "127.0.0.1:9102"]
            multiplier = 10.0
            retain_log = false

            [connections]
            interval = 200
            tmax = 0

            [multicast]
            enabled = true
        "#).unwrap();

        let config = ReplicationConfig::from_file(&path).unwrap();
        assert_eq!(config.node_id.as_deref(), Some("node-a"));
        assert_eq!(config.address(), "127.0.0.1:9100");
        assert_eq!(config.peers.len(), 2);
        assert!(!config.retain_log);
        assert_eq!(config.connections.interval, Duration::from_millis(200));
        assert_eq!(config.connections.tmax, None);
        assert_eq!(config.connections.tick, Duration::from_millis(1000));
        assert!(config.multicast.enabled);
        assert_eq!(config.multicast.port, 4001);
    }

    #[test]
    fn test_hooks_are_callable() {
        let config = ReplicationConfig::default()
            .with_resolver(ConflictResolver::new(|local, remote| remote > local))
            .with_identify(IdentifyHook::new(|id| id != "mallory"));

        let resolver = config.resolver.unwrap();
        assert!(resolver.remote_wins(Some(&b"a"[..]), Some(&b"b"[..])));
        assert!(!resolver.remote_wins(Some(&b"b"[..]), None));

        let identify = config.identify.unwrap();
        assert!(identify.accept("alice"));
        assert!(!identify.accept("mallory"));
    }
}
