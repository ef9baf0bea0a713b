use std::path::Path;

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub wal_path: Option<String>,
    /// Number of WAL records after which the log is rewritten as a snapshot (0 = never)
    pub compaction_threshold: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            wal_path: None,
            compaction_threshold: 10000,
        }
    }
}

impl StorageConfig {
    /// Create config with WAL enabled at the given path
    pub fn with_wal<P: AsRef<Path>>(path: P) -> Self {
        StorageConfig {
            wal_path: Some(path.as_ref().to_string_lossy().to_string()),
            ..Default::default()
        }
    }

    /// Create config for in-memory only storage
    pub fn in_memory() -> Self {
        StorageConfig {
            wal_path: None,
            compaction_threshold: 0,
        }
    }

    pub fn with_compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("RIPPLE_DATA_DIR") {
            let persist = std::env::var("RIPPLE_PERSIST")
                .map(|v| v == "1" || v.to_lowercase() == "true")
                .unwrap_or(true);
            if persist {
                config.wal_path = Some(format!("{}/ripple.wal", dir));
            }
        }

        if let Ok(threshold) = std::env::var("RIPPLE_COMPACTION_THRESHOLD") {
            match threshold.parse() {
                Ok(n) => config.compaction_threshold = n,
                Err(e) => log::warn!("Invalid RIPPLE_COMPACTION_THRESHOLD '{}': {}", threshold, e),
            }
        }

        config
    }
}
