//! Client configuration
//!
//! Settings load from JSON; every field has a default so a partial file is
//! enough.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::ShardLocation;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    ParseError(String),
}

/// Backoff settings for transient store failures.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicyConfig {
    /// Retries after the first attempt.
    pub retry_count: u32,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub delta_backoff_ms: u64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            retry_count: 5,
            min_backoff_ms: 100,
            max_backoff_ms: 30_000,
            delta_backoff_ms: 100,
        }
    }
}

impl RetryPolicyConfig {
    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn delta_backoff(&self) -> Duration {
        Duration::from_millis(self.delta_backoff_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a cached mapping stays usable after it was last refreshed.
    /// Zero keeps entries until they are replaced or evicted.
    pub mapping_time_to_live_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mapping_time_to_live_ms: 300_000,
        }
    }
}

impl CacheConfig {
    pub fn mapping_time_to_live(&self) -> Option<Duration> {
        match self.mapping_time_to_live_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShardMapManagerConfig {
    pub retry: RetryPolicyConfig,
    pub cache: CacheConfig,
}

impl ShardMapManagerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }
}

/// Where the global store lives and who is connecting to it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoreCredentials {
    pub location: ShardLocation,
    pub application_name: String,
}

impl StoreCredentials {
    pub fn new(location: ShardLocation) -> Self {
        Self {
            location,
            application_name: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ShardMapManagerConfig::default();
        assert_eq!(config.retry.retry_count, 5);
        assert_eq!(config.retry.max_backoff(), Duration::from_secs(30));
        assert_eq!(config.cache.mapping_time_to_live(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ShardMapManagerConfig::from_json_str(r#"{"retry": {"retry_count": 1}, "cache": {"mapping_time_to_live_ms": 0}}"#).unwrap();
        assert_eq!(config.retry.retry_count, 1);
        assert_eq!(config.retry.min_backoff_ms, 100);
        assert_eq!(config.cache.mapping_time_to_live(), None);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"retry": {{"delta_backoff_ms": 7}}}}"#).unwrap();
        let config = ShardMapManagerConfig::load(file.path()).unwrap();
        assert_eq!(config.retry.delta_backoff_ms, 7);

        assert!(matches!(
            ShardMapManagerConfig::from_json_str("not json"),
            Err(ConfigError::ParseError(_))
        ));
    }
}
