use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use log::{debug, info};
use storage::{BatchOp, RangeOptions, Record, Storage, StorageError};

use crate::config::{ConflictResolver, ReplicationConfig};
use crate::error::{ReplicationError, Result};
use crate::keys::{Namespaces, LOG_DELIMITER};
use crate::versioned_log::{decide_remote, next_local_entry, supersede_ops, Decision, IndexEntry, LogEntry, OpType};
use crate::sequence::Sequence;
use crate::velocity::SharedVelocity;

const SEQUENCE_META: &str = "sequence";

/// A remote log entry paired with the value fetched for it
#[derive(Debug, Clone)]
pub struct RemoteMutation {
    pub entry: LogEntry,
    /// Current remote value; `None` for deletes or when the remote no longer has it
    pub value: Option<Vec<u8>>,
}

/// Mutable state guarded by the single writer lock
struct WriterState {
    sequence: Option<Sequence>,
}

struct Inner {
    storage: Storage,
    ns: Namespaces,
    node_id: String,
    retain_log: bool,
    resolver: Option<ConflictResolver>,
    velocity: SharedVelocity,
    writer: Mutex<WriterState>,
}

/// Replicating facade over the ordered store.
///
/// Every mutation, whether issued locally or pulled from a peer, is expanded
/// into one atomic batch carrying the user ops, the new log and index
/// entries and the persisted sequence token. All mutations take the same
/// writer lock, which serializes the read-modify-write of each key's index.
#[derive(Clone)]
pub struct ReplicatedStore {
    inner: Arc<Inner>,
}

impl ReplicatedStore {
    /// Open the facade, restoring the last issued sequence token.
    pub async fn open(
        storage: Storage,
        node_id: String,
        config: &ReplicationConfig,
        velocity: SharedVelocity,
    ) -> Result<Self> {
        if config.separator == LOG_DELIMITER || config.separator.is_ascii_alphanumeric() {
            return Err(ReplicationError::InvalidConfig(format!(
                "separator {:#04x} collides with log key characters",
                config.separator
            )));
        }
        let ns = Namespaces::new(config.separator);
        ns.validate_node_id(&node_id)?;

        let sequence = match storage.get(&ns.meta_key(SEQUENCE_META)).await {
            Some(raw) => {
                let token = String::from_utf8(raw)
                    .ok()
                    .and_then(|s| Sequence::parse(&s))
                    .ok_or_else(|| StorageError::Corrupt("persisted sequence token".to_string()))?;
                info!("Resuming write sequence after {}", token);
                Some(token)
            }
            None => None,
        };

        Ok(ReplicatedStore {
            inner: Arc::new(Inner {
                storage,
                ns,
                node_id,
                retain_log: config.retain_log,
                resolver: config.resolver.clone(),
                velocity,
                writer: Mutex::new(WriterState { sequence }),
            }),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn namespaces(&self) -> &Namespaces {
        &self.inner.ns
    }

    /// Raw store, for internal namespaces that are not replicated
    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    pub fn velocity(&self) -> &SharedVelocity {
        &self.inner.velocity
    }

    /// Whether clock ties are handed to a conflict resolver
    pub fn has_resolver(&self) -> bool {
        self.inner.resolver.is_some()
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.storage.get(key).await)
    }

    pub async fn range(&self, opts: &RangeOptions) -> Result<Vec<Record>> {
        Ok(self.inner.storage.range(opts).await)
    }

    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.batch(vec![BatchOp::put(key, value)]).await
    }

    pub async fn delete(&self, key: &[u8]) -> Result<()> {
        self.batch(vec![BatchOp::delete(key)]).await
    }

    /// Apply user ops atomically together with their log entries.
    pub async fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        for op in &ops {
            if self.inner.ns.is_reserved(op.key()) {
                return Err(StorageError::InvalidKey(
                    format!("{:?} starts with the reserved separator", String::from_utf8_lossy(op.key()))
                ).into());
            }
        }

        let inner = &self.inner;
        let mut state = inner.writer.lock().await;
        let mut sequence = state.sequence.clone();
        let mut touched: HashMap<Vec<u8>, IndexEntry> = HashMap::new();
        let mut meta = Vec::with_capacity(ops.len() * 3 + 1);

        for op in &ops {
            let key = op.key();
            let previous = match touched.get(key) {
                Some(entry) => Some(entry.clone()),
                None => self.index_entry(key).await?,
            };
            let op_type = match op {
                BatchOp::Put { .. } => OpType::Put,
                BatchOp::Delete { .. } => OpType::Delete,
            };

            let next = Sequence::next_after(sequence.as_ref());
            let entry = next_local_entry(previous.as_ref(), key, op_type, &inner.node_id, next.clone());
            meta.extend(supersede_ops(&inner.ns, previous.as_ref(), &entry, inner.retain_log)?);
            touched.insert(key.to_vec(), entry);
            sequence = Some(next);
        }

        if let Some(seq) = &sequence {
            meta.push(BatchOp::put(inner.ns.meta_key(SEQUENCE_META), seq.as_str()));
        }

        let count = ops.len() as u64;
        let mut combined = ops;
        combined.extend(meta);
        inner.storage.batch(combined).await?;

        state.sequence = sequence;
        inner.velocity.record(count);
        Ok(())
    }

    /// Newest log entry known locally for `key`
    pub async fn index_entry(&self, key: &[u8]) -> Result<Option<IndexEntry>> {
        match self.inner.storage.get(&self.inner.ns.index_key(key)).await {
            Some(raw) => Ok(Some(LogEntry::decode_local(&raw)?)),
            None => Ok(None),
        }
    }

    /// Clock of `key`, 0 if it was never written
    pub async fn clock(&self, key: &[u8]) -> Result<u64> {
        Ok(self.index_entry(key).await?.map(|e| e.clock).unwrap_or(0))
    }

    /// Last consumed log key per origin node
    pub async fn history(&self) -> Result<HashMap<String, Vec<u8>>> {
        let ns = &self.inner.ns;
        let records = self.inner.storage.range(&RangeOptions::prefix(&ns.history)).await;
        Ok(records.into_iter()
            .filter_map(|r| {
                let key = r.key?;
                let id = ns.strip(&ns.history, &key)?.to_string();
                Some((id, r.value?))
            })
            .collect())
    }

    /// Every log entry this node holds for `origin`, oldest first
    pub async fn log_entries(&self, origin: &str) -> Result<Vec<LogEntry>> {
        let prefix = self.inner.ns.log_origin_prefix(origin);
        let records = self.inner.storage.range(&RangeOptions::prefix(&prefix)).await;
        records.into_iter()
            .filter_map(|r| r.value)
            .map(|v| LogEntry::decode_local(&v))
            .collect()
    }

    /// Apply pulled remote mutations in one atomic batch.
    ///
    /// Each mutation is re-checked against the index under the writer lock,
    /// so a local write that landed while values were being fetched is
    /// never overwritten by an older remote version. `cursors` are the
    /// history positions to record alongside. Returns the number of
    /// mutations accepted.
    pub async fn apply_remote(
        &self,
        mutations: Vec<RemoteMutation>,
        cursors: Vec<(String, Vec<u8>)>,
    ) -> Result<usize> {
        let inner = &self.inner;
        let _state = inner.writer.lock().await;

        let mut touched: HashMap<Vec<u8>, IndexEntry> = HashMap::new();
        let mut values: HashMap<Vec<u8>, Option<Vec<u8>>> = HashMap::new();
        let mut ops = Vec::new();
        let mut accepted = 0usize;

        for mutation in mutations {
            let RemoteMutation { entry, value } = mutation;
            if entry.op == OpType::Put && value.is_none() {
                debug!("Skipping {:?}: value no longer present on peer", String::from_utf8_lossy(&entry.key));
                continue;
            }

            let key = entry.key.clone();
            let local = match touched.get(&key) {
                Some(e) => Some(e.clone()),
                None => self.index_entry(&key).await?,
            };
            let local_value = match values.get(&key) {
                Some(v) => v.clone(),
                None => inner.storage.get(&key).await,
            };

            let resolver = inner.resolver.as_ref().map(|r| {
                let local_value = local_value.as_deref();
                let remote_value = value.as_deref();
                move || r.remote_wins(local_value, remote_value)
            });

            match decide_remote(local.as_ref(), &entry, resolver) {
                Decision::Accept(winner) => {
                    ops.extend(supersede_ops(&inner.ns, local.as_ref(), &winner, inner.retain_log)?);
                    match (&winner.op, &value) {
                        (OpType::Put, Some(v)) => ops.push(BatchOp::put(key.clone(), v.clone())),
                        _ => ops.push(BatchOp::delete(key.clone())),
                    }
                    let new_value = if winner.op == OpType::Put { value } else { None };
                    values.insert(key.clone(), new_value);
                    touched.insert(key, winner);
                    accepted += 1;
                }
                Decision::Reject => {}
            }
        }

        for (id, cursor) in cursors {
            ops.push(BatchOp::put(inner.ns.history_key(&id), cursor));
        }

        inner.storage.batch(ops).await.map_err(ReplicationError::from)?;
        inner.velocity.record(accepted as u64);
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store(id: &str, config: &ReplicationConfig) -> ReplicatedStore {
        ReplicatedStore::open(Storage::new(), id.to_string(), config, SharedVelocity::new())
            .await
            .unwrap()
    }

    fn remote(entry: LogEntry, value: Option<&str>) -> RemoteMutation {
        RemoteMutation { entry, value: value.map(|v| v.as_bytes().to_vec()) }
    }

    fn remote_entry(key: &str, clock: u64, origin: &str, seq: &str, op: OpType) -> LogEntry {
        LogEntry {
            key: key.as_bytes().to_vec(),
            op,
            clock,
            sequence: Sequence::parse(seq).unwrap(),
            origin: origin.to_string(),
        }
    }

    #[tokio::test]
    async fn test_clock_counts_mutations() {
        let store = open_store("n1", &ReplicationConfig::default()).await;
        for i in 0..5 {
            store.put(b"k", format!("{}", i).as_bytes()).await.unwrap();
        }
        store.delete(b"k").await.unwrap();

        assert_eq!(store.clock(b"k").await.unwrap(), 6);
        assert_eq!(store.get(b"k").await.unwrap(), None);
        assert_eq!(store.index_entry(b"k").await.unwrap().unwrap().op, OpType::Delete);
        assert_eq!(store.velocity().velocity(), 6);
    }

    #[tokio::test]
    async fn test_batch_with_repeated_key() {
        let store = open_store("n1", &ReplicationConfig::default()).await;
        store.batch(vec![BatchOp::put("a", "1"), BatchOp::put("a", "2"), BatchOp::put("b", "3")])
            .await
            .unwrap();

        assert_eq!(store.clock(b"a").await.unwrap(), 2);
        assert_eq!(store.clock(b"b").await.unwrap(), 1);
        assert_eq!(store.get(b"a").await.unwrap(), Some(b"2".to_vec()));

        let log = store.log_entries("n1").await.unwrap();
        assert_eq!(log.len(), 3);
        assert!(log.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }

    #[tokio::test]
    async fn test_compacting_log_keeps_one_entry_per_key() {
        let config = ReplicationConfig { retain_log: false, ..Default::default() };
        let store = open_store("n1", &config).await;
        store.put(b"k", b"1").await.unwrap();
        store.batch(vec![BatchOp::put("k", "2"), BatchOp::put("k", "3")]).await.unwrap();

        let log = store.log_entries("n1").await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].clock, 3);
    }

    #[tokio::test]
    async fn test_reserved_keys_are_rejected() {
        let store = open_store("n1", &ReplicationConfig::default()).await;
        let err = store.put(&[0xff, b'x'], b"v").await.unwrap_err();
        assert!(matches!(err, ReplicationError::Storage(StorageError::InvalidKey(_))));
        assert!(store.storage().is_empty().await);
    }

    #[tokio::test]
    async fn test_sequence_survives_reopen() {
        let storage = Storage::new();
        let config = ReplicationConfig::default();

        let store = ReplicatedStore::open(storage.clone(), "n1".into(), &config, SharedVelocity::new())
            .await
            .unwrap();
        store.put(b"a", b"1").await.unwrap();
        store.put(b"b", b"1").await.unwrap();
        let before = store.log_entries("n1").await.unwrap();

        let reopened = ReplicatedStore::open(storage, "n1".into(), &config, SharedVelocity::new())
            .await
            .unwrap();
        reopened.put(b"c", b"1").await.unwrap();
        let after = reopened.log_entries("n1").await.unwrap();

        assert_eq!(after.len(), 3);
        assert!(after[2].sequence > before[1].sequence);
        assert_eq!(after[2].key, b"c".to_vec());
    }

    #[tokio::test]
    async fn test_apply_remote_is_idempotent() {
        let store = open_store("local", &ReplicationConfig::default()).await;
        let entry = remote_entry("k", 4, "peer", "11", OpType::Put);
        let cursor = store.namespaces().log_key("peer", "11", b"k");

        let first = store.apply_remote(vec![remote(entry.clone(), Some("v"))], vec![("peer".into(), cursor.clone())])
            .await
            .unwrap();
        let second = store.apply_remote(vec![remote(entry, Some("v"))], vec![("peer".into(), cursor.clone())])
            .await
            .unwrap();

        assert_eq!((first, second), (1, 0));
        assert_eq!(store.clock(b"k").await.unwrap(), 4);
        assert_eq!(store.get(b"k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.history().await.unwrap().get("peer"), Some(&cursor));
        assert_eq!(store.log_entries("peer").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remote_delete_removes_value() {
        let store = open_store("local", &ReplicationConfig::default()).await;
        store.put(b"k", b"v").await.unwrap();

        let tombstone = remote_entry("k", 2, "peer", "11", OpType::Delete);
        let applied = store.apply_remote(vec![remote(tombstone, None)], vec![]).await.unwrap();

        assert_eq!(applied, 1);
        assert_eq!(store.get(b"k").await.unwrap(), None);
        assert_eq!(store.clock(b"k").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_older_remote_loses_and_tie_goes_to_resolver() {
        let config = ReplicationConfig::default()
            .with_resolver(ConflictResolver::new(|local, remote| remote > local));
        let store = open_store("local", &config).await;
        store.put(b"k", b"m").await.unwrap();
        store.put(b"k", b"m").await.unwrap();

        let older = remote_entry("k", 1, "peer", "11", OpType::Put);
        assert_eq!(store.apply_remote(vec![remote(older, Some("z"))], vec![]).await.unwrap(), 0);

        let tie_loses = remote_entry("k", 2, "peer", "12", OpType::Put);
        assert_eq!(store.apply_remote(vec![remote(tie_loses, Some("a"))], vec![]).await.unwrap(), 0);
        assert_eq!(store.get(b"k").await.unwrap(), Some(b"m".to_vec()));

        let tie_wins = remote_entry("k", 2, "peer", "13", OpType::Put);
        assert_eq!(store.apply_remote(vec![remote(tie_wins, Some("z"))], vec![]).await.unwrap(), 1);
        assert_eq!(store.get(b"k").await.unwrap(), Some(b"z".to_vec()));
        assert_eq!(store.clock(b"k").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_accepted_remote_counts_as_velocity() {
        let store = open_store("local", &ReplicationConfig::default()).await;
        let entries = vec![
            remote(remote_entry("a", 1, "peer", "11", OpType::Put), Some("1")),
            remote(remote_entry("b", 1, "peer", "12", OpType::Put), None),
        ];
        assert_eq!(store.apply_remote(entries, vec![]).await.unwrap(), 1);
        assert_eq!(store.velocity().earned(), 1);
    }

    #[tokio::test]
    async fn test_local_write_during_pull_is_not_overwritten() {
        let store = open_store("local", &ReplicationConfig::default()).await;

        // the session judged this entry a winner against an empty index...
        let pulled = remote_entry("k", 1, "peer", "11", OpType::Put);
        let local = store.index_entry(b"k").await.unwrap();
        assert!(matches!(decide_remote(local.as_ref(), &pulled, None::<fn() -> bool>), Decision::Accept(_)));

        // ...but local writes landed before the apply
        store.put(b"k", b"mine").await.unwrap();
        store.put(b"k", b"mine2").await.unwrap();

        assert_eq!(store.apply_remote(vec![remote(pulled, Some("theirs"))], vec![]).await.unwrap(), 0);
        assert_eq!(store.get(b"k").await.unwrap(), Some(b"mine2".to_vec()));
        assert_eq!(store.clock(b"k").await.unwrap(), 2);
        assert!(store.log_entries("peer").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_validates_id_and_separator() {
        let err = ReplicatedStore::open(Storage::new(), "a!z".into(), &ReplicationConfig::default(), SharedVelocity::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ReplicationError::InvalidNodeId(id) if id == "a!z"));

        let config = ReplicationConfig { separator: b'!', ..Default::default() };
        let err = ReplicatedStore::open(Storage::new(), "n1".into(), &config, SharedVelocity::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ReplicationError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_custom_separator() {
        let config = ReplicationConfig { separator: b'~', ..Default::default() };
        let store = open_store("n1", &config).await;

        assert!(store.put(b"~x", b"v").await.is_err());
        store.put(&[0xff, b'x'], b"v").await.unwrap();
        assert_eq!(store.clock(&[0xff, b'x']).await.unwrap(), 1);
        assert!(store.namespaces().log.starts_with(b"~"));
        assert_eq!(store.log_entries("n1").await.unwrap().len(), 1);
    }
}
