//! Store configuration.
//!
//! Every section has serde defaults and can be overridden from `UNIVRS_*`
//! environment variables.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, StoreError};
use crate::sqlite::schema::SyncStrategy;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub sqlite: SqliteConfig,
    pub bus: BusConfig,
    pub queue: QueueConfig,
    pub sweep: SweepConfig,
    pub receiver: ReceiverConfig,
}

impl StoreConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides to existing configuration.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("UNIVRS_SQLITE_URL") {
            self.sqlite.url = val;
        }
        if let Some(val) = env_parse("UNIVRS_SQLITE_MAX_CONNECTIONS")? {
            self.sqlite.max_connections = val;
        }
        if let Some(val) = env_parse("UNIVRS_SQLITE_COMMAND_TIMEOUT_SECS")? {
            self.sqlite.command_timeout_secs = val;
        }
        if let Some(val) = env_parse("UNIVRS_SQLITE_BUSY_TIMEOUT_SECS")? {
            self.sqlite.busy_timeout_secs = val;
        }
        if let Ok(val) = std::env::var("UNIVRS_SQLITE_SCHEMA") {
            self.sqlite.schema = val;
        }
        if let Some(val) = env_parse("UNIVRS_SQLITE_SYNC_STRATEGY")? {
            self.sqlite.sync_strategy = val;
        }
        if let Some(val) = env_parse("UNIVRS_BUS_CAPACITY")? {
            self.bus.capacity = val;
        }
        if let Some(val) = env_parse("UNIVRS_BUS_HANDLER_TIMEOUT_MS")? {
            self.bus.handler_timeout_ms = val;
        }
        if let Some(val) = env_parse("UNIVRS_QUEUE_RECHECK_INTERVAL_MS")? {
            self.queue.recheck_interval_ms = val;
        }
        if let Some(val) = env_parse("UNIVRS_SWEEP_INTERVAL_SECS")? {
            self.sweep.interval_secs = val;
        }
        self.validate()
    }

    /// Reject values that would make the store unusable.
    pub fn validate(&self) -> Result<()> {
        if self.sqlite.max_connections == 0 {
            return Err(StoreError::Config(
                "sqlite.max_connections must be at least 1".to_string(),
            ));
        }
        if self.sqlite.command_timeout_secs == 0 {
            return Err(StoreError::Config(
                "sqlite.command_timeout_secs must be non-zero".to_string(),
            ));
        }
        if self.bus.capacity == 0 {
            return Err(StoreError::Config("bus.capacity must be non-zero".to_string()));
        }
        if self.sweep.interval_secs == 0 {
            return Err(StoreError::Config(
                "sweep.interval_secs must be non-zero".to_string(),
            ));
        }
        if self.sweep.batch_size == 0 {
            return Err(StoreError::Config("sweep.batch_size must be non-zero".to_string()));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| StoreError::Config(format!("{} has invalid value {:?}", name, raw))),
        Err(_) => Ok(None),
    }
}

/// SQL connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// sqlx connection URL, e.g. `sqlite:data/collections.db`.
    pub url: String,
    pub max_connections: u32,
    /// Fixed per-command timeout, independent of caller cancellation.
    pub command_timeout_secs: u64,
    pub busy_timeout_secs: u64,
    /// Schema namespace (attached database name).
    pub schema: String,
    pub sync_strategy: SyncStrategy,
}

impl SqliteConfig {
    /// Per-command timeout as a [`Duration`].
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// SQLite busy timeout as a [`Duration`].
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:collections.db".to_string(),
            max_connections: 5,
            command_timeout_secs: 180,
            busy_timeout_secs: 30,
            schema: "main".to_string(),
            sync_strategy: SyncStrategy::UntilSuccess,
        }
    }
}

/// Pub/sub bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-channel broadcast buffer.
    pub capacity: usize,
    /// Upper bound on a single handler invocation.
    pub handler_timeout_ms: u64,
}

impl BusConfig {
    /// Handler timeout as a [`Duration`].
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            handler_timeout_ms: 5_000,
        }
    }
}

/// Blocking queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Waiters re-poll the queue at least this often, covering dropped
    /// notifications from lagged or remote buses.
    pub recheck_interval_ms: u64,
}

impl QueueConfig {
    /// Re-poll interval as a [`Duration`].
    pub fn recheck_interval(&self) -> Duration {
        Duration::from_millis(self.recheck_interval_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            recheck_interval_ms: 1_000,
        }
    }
}

/// Active expiration sweeper settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_secs: u64,
    /// Maximum identifiers purged per batch.
    pub batch_size: u32,
    /// Maximum batches per sweep run.
    pub max_batches_per_run: u32,
}

impl SweepConfig {
    /// Sweep interval as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            batch_size: 1000,
            max_batches_per_run: 100,
        }
    }
}

/// Background receiver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub error_capacity: usize,
    /// Pause after a source failure before polling again.
    pub error_backoff_ms: u64,
}

impl ReceiverConfig {
    /// Backoff after a source error as a [`Duration`].
    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            error_capacity: 64,
            error_backoff_ms: 250,
        }
    }
}
