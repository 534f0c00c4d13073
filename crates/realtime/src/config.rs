//! Manager configuration.
//!
//! Loaded from an optional JSON file; every field falls back to its
//! default so partial files are accepted.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// Default wait before each retry attempt, in milliseconds.
pub const DEFAULT_BACKOFF_MS: [u64; 9] = [0, 100, 500, 1000, 3000, 6000, 10000, 20000, 30000];

/// Default capacity of the manager's event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Configuration for a [`RealtimeManager`](crate::RealtimeManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Ascending backoff table. Its length is the retry budget.
    pub backoff_ms: Vec<u64>,
    /// Ask the transport to refresh its session token before each attempt.
    pub refresh_auth: bool,
    /// Buffer size of the event channel returned by `take_events`.
    pub event_capacity: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            backoff_ms: DEFAULT_BACKOFF_MS.to_vec(),
            refresh_auth: true,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl RealtimeConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: RealtimeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the config from disk. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("no realtime config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&data)?;
        debug!(
            retries = config.max_retries(),
            "loaded realtime config from {:?}", path
        );
        Ok(config)
    }

    /// Checks that the backoff table is non-empty and ascending.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_ms.is_empty() {
            return Err(ConfigError::EmptyBackoff);
        }
        if let Some(index) = self
            .backoff_ms
            .windows(2)
            .position(|pair| pair[1] < pair[0])
        {
            return Err(ConfigError::BackoffNotAscending { index: index + 1 });
        }
        Ok(())
    }

    /// Number of retry attempts per resubscribe sequence.
    pub fn max_retries(&self) -> u32 {
        self.backoff_ms.len() as u32
    }

    /// Returns the wait before the given attempt (1-based), or `None` once
    /// the table is exhausted.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        let index = attempt.checked_sub(1)? as usize;
        self.backoff_ms
            .get(index)
            .map(|&ms| Duration::from_millis(ms))
    }
}
