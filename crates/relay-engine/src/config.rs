use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use relay_store::{RetentionPolicy, SyncMode, WalConfig};
use relay_types::EventType;

use crate::error::{RelayError, RelayResult};

/// Tuning for a [`RelayCoordinator`](crate::RelayCoordinator).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Number of delivery workers.
    pub workers: usize,
    /// Delivery attempts per record before it is marked exhausted.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Relative jitter applied to each backoff delay, in `[0, 1)`.
    pub jitter: f64,
    /// How often the dispatcher scans for pending and due work.
    pub poll_interval_ms: u64,
    pub submit_timeout_ms: u64,
    /// How long shutdown waits for in-flight submissions before cancelling.
    pub shutdown_grace_ms: u64,
    /// Route all events of one source record key to the same worker and
    /// hold later events until earlier ones resolve.
    pub ordered_per_key: bool,
    /// Query the target before re-writing after an ambiguous outcome.
    pub verify_ambiguous: bool,
    /// Event types to subscribe to. Empty means all.
    pub event_types: Vec<EventType>,
    pub retention_interval_ms: u64,
    pub retention: RetentionPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 8,
            base_backoff_ms: 500,
            max_backoff_ms: 60_000,
            jitter: 0.2,
            poll_interval_ms: 250,
            submit_timeout_ms: 10_000,
            shutdown_grace_ms: 5_000,
            ordered_per_key: false,
            verify_ambiguous: true,
            event_types: Vec::new(),
            retention_interval_ms: 60_000,
            retention: RetentionPolicy::keep_all(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> RelayResult<()> {
        let invalid = |msg: &str| Err(RelayError::InvalidConfig(msg.to_string()));
        if self.workers == 0 {
            return invalid("workers must be at least 1");
        }
        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1");
        }
        if self.base_backoff_ms == 0 {
            return invalid("base_backoff_ms must be positive");
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return invalid("max_backoff_ms must not be below base_backoff_ms");
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return invalid("jitter must be in [0, 1)");
        }
        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be positive");
        }
        if self.submit_timeout_ms == 0 {
            return invalid("submit_timeout_ms must be positive");
        }
        if !self.retention.is_keep_all() && self.retention_interval_ms == 0 {
            return invalid("retention_interval_ms must be positive when retention is set");
        }
        Ok(())
    }

    pub fn from_toml_str(s: &str) -> RelayResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| RelayError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_millis(self.retention_interval_ms)
    }
}

/// Where and how the delivery ledger is persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Write-ahead log path. `None` keeps the delivery ledger in memory.
    pub wal_path: Option<PathBuf>,
    pub sync_mode: SyncMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            wal_path: Some(PathBuf::from("relay.wal")),
            sync_mode: SyncMode::EveryWrite,
        }
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self {
            wal_path: None,
            sync_mode: SyncMode::EveryWrite,
        }
    }

    pub fn wal(path: impl AsRef<Path>) -> Self {
        Self {
            wal_path: Some(path.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    pub fn wal_config(&self) -> WalConfig {
        WalConfig {
            sync_mode: self.sync_mode,
        }
    }
}
