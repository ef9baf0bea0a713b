//! Per-key logical clocks and the versioned mutation log.
//!
//! Every mutation of an application key produces a [`LogEntry`] stored
//! twice: under the origin node's log (`log + origin ! sequence ! key`) and
//! under the key's index slot (`index + key`). The index always holds the
//! entry with the highest clock seen locally for that key.

use serde::{Deserialize, Serialize};
use storage::BatchOp;

use crate::error::{ReplicationError, Result};
use crate::keys::Namespaces;
use crate::sequence::Sequence;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Put,
    Delete,
}

/// One logical mutation of `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub key: Vec<u8>,
    #[serde(rename = "type")]
    pub op: OpType,
    pub clock: u64,
    pub sequence: Sequence,
    pub origin: String,
}

impl LogEntry {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Decode an entry read from the local store; failures there mean local corruption
    pub fn decode_local(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            ReplicationError::Storage(storage::StorageError::Corrupt(format!("log entry: {}", e)))
        })
    }

    /// Storage key of this entry inside its origin's log
    pub fn log_key(&self, ns: &Namespaces) -> Vec<u8> {
        ns.log_key(&self.origin, self.sequence.as_str(), &self.key)
    }
}

/// The index slot for a key holds the newest entry itself
pub type IndexEntry = LogEntry;

/// Outcome of comparing a remote entry against local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Install this entry (possibly with a bumped clock)
    Accept(LogEntry),
    Reject,
}

/// Build the entry for a local write of `key`, superseding `previous`.
pub fn next_local_entry(
    previous: Option<&IndexEntry>,
    key: &[u8],
    op: OpType,
    origin: &str,
    sequence: Sequence,
) -> LogEntry {
    LogEntry {
        key: key.to_vec(),
        op,
        clock: previous.map(|p| p.clock).unwrap_or(0) + 1,
        sequence,
        origin: origin.to_string(),
    }
}

/// Storage ops that install `entry` as the newest version of its key.
///
/// With `retain_log` off the previous log entry is deleted in the same
/// batch; otherwise the log is append-only.
pub fn supersede_ops(
    ns: &Namespaces,
    previous: Option<&IndexEntry>,
    entry: &LogEntry,
    retain_log: bool,
) -> Result<Vec<BatchOp>> {
    let mut ops = Vec::with_capacity(3);
    if let (Some(previous), false) = (previous, retain_log) {
        let old = previous.log_key(ns);
        if old != entry.log_key(ns) {
            ops.push(BatchOp::Delete { key: old });
        }
    }
    let encoded = entry.encode()?;
    ops.push(BatchOp::Put { key: entry.log_key(ns), value: encoded.clone() });
    ops.push(BatchOp::Put { key: ns.index_key(&entry.key), value: encoded });
    Ok(ops)
}

/// Last-writer-wins by logical clock.
///
/// A remote entry wins when there is no local entry or its clock is
/// higher. On a tie the optional `resolver` decides; if it picks the
/// remote value, the remote clock is bumped by one so that the winner also
/// dominates the losing version everywhere else. Without a resolver, ties
/// go to the greater `(origin, sequence)` pair so every node settles on
/// the same entry.
pub fn decide_remote<F>(local: Option<&IndexEntry>, remote: &LogEntry, resolver: Option<F>) -> Decision
where
    F: FnOnce() -> bool,
{
    match local {
        None => Decision::Accept(remote.clone()),
        Some(local) if remote.clock > local.clock => Decision::Accept(remote.clone()),
        Some(local) if remote.clock == local.clock => {
            if local.origin == remote.origin && local.sequence == remote.sequence {
                return Decision::Reject;
            }
            match resolver {
                Some(remote_wins) => {
                    if remote_wins() {
                        let mut winner = remote.clone();
                        winner.clock += 1;
                        Decision::Accept(winner)
                    } else {
                        Decision::Reject
                    }
                }
                None if (&remote.origin, &remote.sequence) > (&local.origin, &local.sequence) => {
                    Decision::Accept(remote.clone())
                }
                None => Decision::Reject,
            }
        }
        Some(_) => Decision::Reject,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, clock: u64, origin: &str, seq: &str) -> LogEntry {
        LogEntry {
            key: key.as_bytes().to_vec(),
            op: OpType::Put,
            clock,
            sequence: Sequence::parse(seq).unwrap(),
            origin: origin.to_string(),
        }
    }

    #[test]
    fn test_first_local_entry_starts_at_one() {
        let e = next_local_entry(None, b"k", OpType::Put, "n1", Sequence::first());
        assert_eq!(e.clock, 1);

        let e2 = next_local_entry(Some(&e), b"k", OpType::Delete, "n1", e.sequence.next());
        assert_eq!(e2.clock, 2);
        assert_eq!(e2.op, OpType::Delete);
    }

    #[test]
    fn test_entry_json_round_trip_keeps_wire_names() {
        let e = entry("k", 3, "n1", "12");
        let json = String::from_utf8(e.encode().unwrap()).unwrap();
        assert!(json.contains("\"type\":\"put\""));
        assert_eq!(LogEntry::decode(json.as_bytes()).unwrap(), e);
    }

    #[test]
    fn test_supersede_deletes_old_log_only_without_retention() {
        let ns = Namespaces::default();
        let old = entry("k", 1, "n1", "11");
        let new = entry("k", 2, "n1", "12");

        let compacting = supersede_ops(&ns, Some(&old), &new, false).unwrap();
        assert_eq!(compacting[0], BatchOp::Delete { key: old.log_key(&ns) });
        assert_eq!(compacting.len(), 3);

        let retaining = supersede_ops(&ns, Some(&old), &new, true).unwrap();
        assert_eq!(retaining.len(), 2);
        assert!(retaining.iter().all(|op| matches!(op, BatchOp::Put { .. })));
    }

    #[test]
    fn test_higher_clock_wins() {
        let local = entry("k", 2, "a", "11");
        assert_eq!(decide_remote::<fn() -> bool>(Some(&local), &entry("k", 3, "b", "11"), None),
            Decision::Accept(entry("k", 3, "b", "11")));
        assert_eq!(decide_remote::<fn() -> bool>(Some(&local), &entry("k", 1, "b", "11"), None),
            Decision::Reject);
        assert!(matches!(decide_remote::<fn() -> bool>(None, &local, None), Decision::Accept(_)));
    }

    #[test]
    fn test_tie_uses_resolver() {
        let local = entry("k", 2, "a", "11");
        let remote = entry("k", 2, "b", "11");

        assert_eq!(decide_remote(Some(&local), &remote, Some(|| false)), Decision::Reject);
        match decide_remote(Some(&local), &remote, Some(|| true)) {
            Decision::Accept(winner) => assert_eq!(winner.clock, 3),
            Decision::Reject => panic!("resolver picked remote"),
        }
    }

    #[test]
    fn test_tie_without_resolver_is_symmetric() {
        let a = entry("k", 2, "a", "15");
        let b = entry("k", 2, "b", "11");

        assert_eq!(decide_remote::<fn() -> bool>(Some(&a), &b, None), Decision::Accept(b.clone()));
        assert_eq!(decide_remote::<fn() -> bool>(Some(&b), &a, None), Decision::Reject);
    }

    #[test]
    fn test_same_entry_is_never_reapplied() {
        let local = entry("k", 2, "a", "11");
        assert_eq!(decide_remote(Some(&local), &local.clone(), Some(|| true)), Decision::Reject);
    }
}
