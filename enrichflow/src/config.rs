//! Engine timing and retention settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::errors::EnrichflowError;

const fn default_poll_interval_ms() -> u64 {
    10_000
}

const fn default_coordinator_interval_ms() -> u64 {
    15_000
}

const fn default_recent_items_limit() -> usize {
    20
}

const fn default_stale_after_secs() -> u64 {
    300
}

/// Settings shared by stage workers and the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker sleep between eligibility polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Coordinator supervision interval.
    #[serde(default = "default_coordinator_interval_ms")]
    pub coordinator_interval_ms: u64,
    /// Length of the rolling recent-items log.
    #[serde(default = "default_recent_items_limit")]
    pub recent_items_limit: usize,
    /// Transient runs without updates for this long report `failed`.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            coordinator_interval_ms: default_coordinator_interval_ms(),
            recent_items_limit: default_recent_items_limit(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl EngineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`EnrichflowError::Config`] for malformed JSON or invalid values.
    pub fn from_json_str(json: &str) -> Result<Self, EnrichflowError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| EnrichflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the worker poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = duration_ms(interval);
        self
    }

    /// Sets the coordinator interval.
    #[must_use]
    pub fn with_coordinator_interval(mut self, interval: Duration) -> Self {
        self.coordinator_interval_ms = duration_ms(interval);
        self
    }

    /// Sets the recent-items limit.
    #[must_use]
    pub fn with_recent_items_limit(mut self, limit: usize) -> Self {
        self.recent_items_limit = limit;
        self
    }

    /// Sets the staleness window.
    #[must_use]
    pub fn with_stale_after(mut self, window: Duration) -> Self {
        self.stale_after_secs = window.as_secs();
        self
    }

    /// Worker poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Coordinator interval.
    #[must_use]
    pub fn coordinator_interval(&self) -> Duration {
        Duration::from_millis(self.coordinator_interval_ms)
    }

    /// Staleness window.
    #[must_use]
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.stale_after_secs).unwrap_or(i64::MAX))
    }

    /// Checks the settings.
    ///
    /// # Errors
    ///
    /// Returns [`EnrichflowError::Config`] for zero intervals or a zero
    /// recent-items limit.
    pub fn validate(&self) -> Result<(), EnrichflowError> {
        if self.poll_interval_ms == 0 {
            return Err(EnrichflowError::Config("poll_interval_ms must be > 0".into()));
        }
        if self.coordinator_interval_ms == 0 {
            return Err(EnrichflowError::Config(
                "coordinator_interval_ms must be > 0".into(),
            ));
        }
        if self.recent_items_limit == 0 {
            return Err(EnrichflowError::Config(
                "recent_items_limit must be > 0".into(),
            ));
        }
        if self.coordinator_interval_ms < self.poll_interval_ms {
            warn!(
                poll_interval_ms = self.poll_interval_ms,
                coordinator_interval_ms = self.coordinator_interval_ms,
                "Coordinator interval is shorter than the worker poll interval"
            );
        }
        Ok(())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
