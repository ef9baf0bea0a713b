use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use log::{info, warn};

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::types::{BatchOp, RangeOptions, Record};
use crate::wal::Wal;

/// Ordered key-value engine.
///
/// Keys and values are raw bytes kept in a `BTreeMap`, so range scans come
/// back in lexicographic byte order. Every mutation goes through `batch`,
/// which appends one WAL record (when persistence is enabled) before the
/// ops become visible, making the whole batch all-or-nothing.
///
/// Cloning is cheap and every clone shares the same data.
#[derive(Clone)]
pub struct Storage {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
    wal: Option<Arc<Mutex<Wal>>>,
    compaction_threshold: usize,
}

impl Storage {
    /// Create a new in-memory storage (no persistence).
    pub fn new() -> Self {
        info!("Initializing in-memory storage");
        Storage {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            wal: None,
            compaction_threshold: 0,
        }
    }

    /// Create storage with configuration, replaying the WAL if one is configured.
    pub fn with_config(config: StorageConfig) -> Result<Self, StorageError> {
        let Some(path) = config.wal_path else {
            return Ok(Self::new());
        };

        let mut wal = Wal::new(&path)?;
        let mut data = BTreeMap::new();
        let batches = wal.read_records()?;
        for ops in &batches {
            apply_ops(&mut data, ops);
        }
        info!("Recovered {} keys from {} WAL records at {}", data.len(), batches.len(), path);

        Ok(Storage {
            data: Arc::new(RwLock::new(data)),
            wal: Some(Arc::new(Mutex::new(wal))),
            compaction_threshold: config.compaction_threshold,
        })
    }

    /// Whether mutations are persisted to a WAL
    pub fn is_persistent(&self) -> bool {
        self.wal.is_some()
    }

    /// Get a value by key.
    pub async fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.read().await.get(key).cloned()
    }

    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.batch(vec![BatchOp::put(key, value)]).await
    }

    pub async fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.batch(vec![BatchOp::delete(key)]).await
    }

    /// Apply a batch of ops atomically.
    ///
    /// The write lock is held across the WAL append so readers never observe
    /// a batch that failed to persist, and concurrent batches land in the
    /// WAL in the same order they are applied in memory.
    pub async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut data = self.data.write().await;

        let needs_compaction = if let Some(wal) = &self.wal {
            let mut wal = wal.lock()
                .map_err(|_| StorageError::Corrupt("WAL lock poisoned".to_string()))?;
            wal.append(&ops)?;
            self.compaction_threshold > 0 && wal.records() >= self.compaction_threshold
        } else {
            false
        };

        apply_ops(&mut data, &ops);

        if needs_compaction {
            let snapshot: Vec<(Vec<u8>, Vec<u8>)> = data.iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if let Some(wal) = &self.wal {
                match wal.lock() {
                    Ok(mut wal) => {
                        if let Err(e) = wal.compact(&snapshot) {
                            warn!("WAL compaction of {:?} failed: {}", wal.path(), e);
                        }
                    }
                    Err(_) => warn!("WAL lock poisoned, skipping compaction"),
                }
            }
        }

        Ok(())
    }

    /// Ordered range scan.
    pub async fn range(&self, opts: &RangeOptions) -> Vec<Record> {
        let lower = match (&opts.gt, &opts.gte) {
            (Some(gt), _) => Bound::Excluded(gt.clone()),
            (None, Some(gte)) => Bound::Included(gte.clone()),
            (None, None) => Bound::Unbounded,
        };
        let upper = match (&opts.lt, &opts.lte) {
            (Some(lt), _) => Bound::Excluded(lt.clone()),
            (None, Some(lte)) => Bound::Included(lte.clone()),
            (None, None) => Bound::Unbounded,
        };

        if bounds_are_empty(&lower, &upper) {
            return Vec::new();
        }

        let limit = opts.limit.unwrap_or(usize::MAX);
        let data = self.data.read().await;
        let iter = data.range::<Vec<u8>, _>((lower, upper));

        let to_record = |(k, v): (&Vec<u8>, &Vec<u8>)| Record {
            key: opts.keys.then(|| k.clone()),
            value: opts.values.then(|| v.clone()),
        };

        if opts.reverse {
            iter.rev().take(limit).map(to_record).collect()
        } else {
            iter.take(limit).map(to_record).collect()
        }
    }

    /// Count all keys.
    pub async fn keys_count(&self) -> usize {
        self.data.read().await.len()
    }

    /// Check if the storage has any data at all.
    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_ops(data: &mut BTreeMap<Vec<u8>, Vec<u8>>, ops: &[BatchOp]) {
    for op in ops {
        match op {
            BatchOp::Put { key, value } => {
                data.insert(key.clone(), value.clone());
            }
            BatchOp::Delete { key } => {
                data.remove(key);
            }
        }
    }
}

// BTreeMap::range panics on inverted or empty-exclusive bounds
fn bounds_are_empty(lower: &Bound<Vec<u8>>, upper: &Bound<Vec<u8>>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l > u,
        (Bound::Included(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u)) => l >= u,
        (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
        _ => false,
    }
}
