use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunables for the sync engine. Every field has a default, so a partial
/// JSON document is enough to override a single knob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Items are dropped once their retry count reaches this ceiling.
    pub max_retries: u32,
    /// Periodic drain while online.
    pub tick_interval_ms: u64,
    pub draft_debounce_ms: u64,
    pub max_attachments: usize,
    /// Delay before the background refresh that follows an optimistic change.
    pub revalidate_delay_ms: u64,
    pub cache_stale_after_ms: u64,
    pub cache_capacity: usize,
    pub max_outbox_entries: usize,
    /// Reachability probe interval; `None` leaves connectivity to the host.
    pub probe_interval_ms: Option<u64>,
    /// Dropped-item notices kept for the UI banner.
    pub recent_failures_kept: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            max_retries: 5,
            tick_interval_ms: 60_000,
            draft_debounce_ms: 500,
            max_attachments: 3,
            revalidate_delay_ms: 1_500,
            cache_stale_after_ms: 5 * 60 * 1_000,
            cache_capacity: 1_000,
            max_outbox_entries: 500,
            probe_interval_ms: None,
            recent_failures_kept: 20,
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_backoff_ms == 0 {
            return Err(ConfigError::Invalid("base_backoff_ms must be > 0".into()));
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(ConfigError::Invalid(
                "max_backoff_ms must be >= base_backoff_ms".into(),
            ));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be > 0".into()));
        }
        if self.tick_interval_ms < 1_000 {
            return Err(ConfigError::Invalid(
                "tick_interval_ms should be at least 1000ms".into(),
            ));
        }
        if self.max_outbox_entries == 0 {
            return Err(ConfigError::Invalid("max_outbox_entries must be > 0".into()));
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::Invalid("cache_capacity must be > 0".into()));
        }
        if matches!(self.probe_interval_ms, Some(ms) if ms < 1_000) {
            return Err(ConfigError::Invalid(
                "probe_interval_ms should be at least 1000ms".into(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn draft_debounce(&self) -> Duration {
        Duration::from_millis(self.draft_debounce_ms)
    }

    pub fn revalidate_delay(&self) -> Duration {
        Duration::from_millis(self.revalidate_delay_ms)
    }

    pub fn cache_stale_after(&self) -> Duration {
        Duration::from_millis(self.cache_stale_after_ms)
    }

    pub fn probe_interval(&self) -> Option<Duration> {
        self.probe_interval_ms.map(Duration::from_millis)
    }
}
