use storage::RangeOptions;

use crate::error::{ReplicationError, Result};

/// Separator byte reserved for internal namespaces
pub const DEFAULT_SEPARATOR: u8 = 0xff;

/// Delimiter between origin, sequence and key inside a log key
pub const LOG_DELIMITER: u8 = b'!';

/// Reserved key prefixes for the replication metadata.
///
/// Built once from the separator byte and handed to every component, so
/// two nodes only interoperate when they agree on the separator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespaces {
    separator: u8,
    pub log: Vec<u8>,
    pub index: Vec<u8>,
    pub peers: Vec<u8>,
    pub history: Vec<u8>,
    pub meta: Vec<u8>,
}

impl Namespaces {
    pub fn new(separator: u8) -> Self {
        let ns = |name: &str| {
            let mut prefix = vec![separator];
            prefix.extend_from_slice(name.as_bytes());
            prefix.push(separator);
            prefix
        };
        Namespaces {
            separator,
            log: ns("__log__"),
            index: ns("__log_index__"),
            peers: ns("__peers__"),
            history: ns("__history__"),
            meta: ns("__meta__"),
        }
    }

    /// Node ids are embedded in log keys, so they may contain neither the
    /// log delimiter nor the separator byte.
    pub fn is_valid_node_id(&self, id: &str) -> bool {
        !id.is_empty() && !id.bytes().any(|b| b == LOG_DELIMITER || b == self.separator)
    }

    pub fn validate_node_id(&self, id: &str) -> Result<()> {
        if self.is_valid_node_id(id) {
            Ok(())
        } else {
            Err(ReplicationError::InvalidNodeId(id.to_string()))
        }
    }

    /// Application keys may not start with the separator byte
    pub fn is_reserved(&self, key: &[u8]) -> bool {
        key.first() == Some(&self.separator)
    }

    /// `log + origin + '!' + sequence + '!' + key`
    pub fn log_key(&self, origin: &str, sequence: &str, key: &[u8]) -> Vec<u8> {
        let mut out = self.log_origin_prefix(origin);
        out.extend_from_slice(sequence.as_bytes());
        out.push(LOG_DELIMITER);
        out.extend_from_slice(key);
        out
    }

    /// `log + origin + '!'`, the prefix shared by every entry of one node's log
    pub fn log_origin_prefix(&self, origin: &str) -> Vec<u8> {
        let mut out = self.log.clone();
        out.extend_from_slice(origin.as_bytes());
        out.push(LOG_DELIMITER);
        out
    }

    /// Reverse scan over one origin's log, strictly newer than `cursor`.
    pub fn log_scan(&self, origin: &str, cursor: Option<&[u8]>) -> RangeOptions {
        let prefix = self.log_origin_prefix(origin);
        let mut upper = prefix.clone();
        if let Some(last) = upper.last_mut() {
            *last += 1;
        }
        RangeOptions {
            gt: Some(cursor.map(<[u8]>::to_vec).unwrap_or(prefix)),
            lt: Some(upper),
            reverse: true,
            ..Default::default()
        }
    }

    pub fn index_key(&self, key: &[u8]) -> Vec<u8> {
        concat(&self.index, key)
    }

    pub fn peer_key(&self, id: &str) -> Vec<u8> {
        concat(&self.peers, id.as_bytes())
    }

    pub fn history_key(&self, id: &str) -> Vec<u8> {
        concat(&self.history, id.as_bytes())
    }

    pub fn meta_key(&self, name: &str) -> Vec<u8> {
        concat(&self.meta, name.as_bytes())
    }

    /// Strip `prefix` from `key`, returning the remainder as UTF-8
    pub fn strip<'a>(&self, prefix: &[u8], key: &'a [u8]) -> Option<&'a str> {
        key.strip_prefix(prefix).and_then(|rest| std::str::from_utf8(rest).ok())
    }
}

impl Default for Namespaces {
    fn default() -> Self {
        Self::new(DEFAULT_SEPARATOR)
    }
}

fn concat(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + suffix.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(suffix);
    out
}
