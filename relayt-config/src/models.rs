use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Composed configuration for one Relayt process.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub trakt: TraktConfig,
    #[serde(default)]
    pub tuning: Tuning,
}

impl Config {
    /// Reject configurations that cannot possibly start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trakt.client_id.trim().is_empty() {
            return Err(ConfigError::Missing("trakt.client_id"));
        }
        if self.trakt.client_secret.trim().is_empty() {
            return Err(ConfigError::Missing("trakt.client_secret"));
        }
        match self.storage.backend {
            StorageBackend::Postgres if self.storage.database_url.is_none() => {
                Err(ConfigError::Missing("storage.database_url"))
            }
            StorageBackend::Redis if self.storage.redis_url.is_none() => {
                Err(ConfigError::Missing("storage.redis_url"))
            }
            StorageBackend::Filesystem if self.storage.data_dir.is_none() => {
                Err(ConfigError::Missing("storage.data_dir"))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "defaults::host")]
    pub host: String,
    #[serde(default = "defaults::port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: defaults::host(),
            port: defaults::port(),
        }
    }
}

/// Which storage backend owns persistence.
///
/// Only `postgres` supports the durable retry queue; the orchestrator
/// disables the retry worker on the other two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Postgres,
    Redis,
    Filesystem,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "defaults::backend")]
    pub backend: StorageBackend,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: defaults::backend(),
            database_url: None,
            redis_url: None,
            data_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraktConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "defaults::redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "defaults::api_base")]
    pub api_base: String,
}

impl Default for TraktConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: defaults::redirect_uri(),
            api_base: defaults::api_base(),
        }
    }
}

/// Every recognized tunable, with the documented defaults.
///
/// Durations are written as humantime strings in TOML (`"30s"`, `"5m"`).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tuning {
    /// Percent at which pause/stop becomes a completion.
    #[serde(default = "defaults::progress_threshold")]
    pub progress_threshold: i32,
    #[serde(default = "defaults::base_backoff", with = "humantime_duration")]
    pub base_backoff: Duration,
    #[serde(
        default = "defaults::backoff_ceiling",
        with = "humantime_duration"
    )]
    pub backoff_ceiling: Duration,
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: i32,
    #[serde(
        default = "defaults::retry_poll_interval",
        with = "humantime_duration"
    )]
    pub retry_poll_interval: Duration,
    #[serde(default = "defaults::retry_batch")]
    pub retry_batch: i64,
    /// Probe interval while the upstream looks healthy or freshly down.
    #[serde(default = "defaults::health_short", with = "humantime_duration")]
    pub health_short_interval: Duration,
    /// Probe interval during an extended outage.
    #[serde(default = "defaults::health_long", with = "humantime_duration")]
    pub health_long_interval: Duration,
    /// Downtime after which probes widen to the long interval.
    #[serde(
        default = "defaults::health_extended_threshold",
        with = "humantime_duration"
    )]
    pub health_extended_threshold: Duration,
    /// Hard cap per user; oldest evicted FIFO on overflow.
    #[serde(default = "defaults::queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "defaults::fallback_capacity")]
    pub fallback_capacity: usize,
    #[serde(
        default = "defaults::request_timeout",
        with = "humantime_duration"
    )]
    pub request_timeout: Duration,
    #[serde(default = "defaults::drain_batch")]
    pub drain_batch: i64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            progress_threshold: defaults::progress_threshold(),
            base_backoff: defaults::base_backoff(),
            backoff_ceiling: defaults::backoff_ceiling(),
            max_attempts: defaults::max_attempts(),
            retry_poll_interval: defaults::retry_poll_interval(),
            retry_batch: defaults::retry_batch(),
            health_short_interval: defaults::health_short(),
            health_long_interval: defaults::health_long(),
            health_extended_threshold: defaults::health_extended_threshold(),
            queue_capacity: defaults::queue_capacity(),
            fallback_capacity: defaults::fallback_capacity(),
            request_timeout: defaults::request_timeout(),
            drain_batch: defaults::drain_batch(),
        }
    }
}

mod defaults {
    use std::time::Duration;

    use super::StorageBackend;

    pub fn host() -> String {
        "0.0.0.0".to_string()
    }

    pub fn port() -> u16 {
        8127
    }

    pub fn backend() -> StorageBackend {
        StorageBackend::Postgres
    }

    pub fn redirect_uri() -> String {
        "urn:ietf:wg:oauth:2.0:oob".to_string()
    }

    pub fn api_base() -> String {
        "https://api.trakt.tv".to_string()
    }

    pub fn progress_threshold() -> i32 {
        90
    }

    pub fn base_backoff() -> Duration {
        Duration::from_secs(30)
    }

    pub fn backoff_ceiling() -> Duration {
        Duration::from_secs(30 * 60)
    }

    pub fn max_attempts() -> i32 {
        5
    }

    pub fn retry_poll_interval() -> Duration {
        Duration::from_secs(15)
    }

    pub fn retry_batch() -> i64 {
        50
    }

    pub fn health_short() -> Duration {
        Duration::from_secs(5 * 60)
    }

    pub fn health_long() -> Duration {
        Duration::from_secs(60 * 60)
    }

    pub fn health_extended_threshold() -> Duration {
        Duration::from_secs(20 * 60)
    }

    pub fn queue_capacity() -> usize {
        1000
    }

    pub fn fallback_capacity() -> usize {
        100
    }

    pub fn request_timeout() -> Duration {
        Duration::from_secs(10)
    }

    pub fn drain_batch() -> i64 {
        25
    }
}

/// Serde adapter for humantime duration strings.
mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
