//! # Configuration Management
//!
//! Bus, cache, lock and keep-alive settings. Every field has a default so a
//! partial TOML file or a handful of environment overrides is enough.
//!
//! ```rust
//! use tasker_bus::config::BusConfig;
//! use std::time::Duration;
//!
//! let config = BusConfig::default();
//! assert_eq!(config.publish_wait_timeout(), Duration::from_secs(10));
//! assert_eq!(config.keepalive.probe_interval(), Duration::from_secs(90));
//! ```

mod loader;

pub use loader::{ConfigLoader, CONFIG_PATH_ENV, ENV_PREFIX};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{BusError, BusResult};

/// Notification payload limit of PostgreSQL `NOTIFY`
pub const PG_NOTIFY_MAX_PAYLOAD: usize = 8000;

/// Top-level configuration for a [`crate::bus::Bus`] and its backends
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    /// Channel the bus listens on for replies and local dispatch
    pub default_channel: Option<String>,
    /// Prefix used when generating a default channel name
    pub channel_prefix: String,
    /// Default `publish_wait` timeout
    pub publish_wait_timeout_ms: u64,
    /// Serialized envelope size above which payloads go through the cache.
    /// When unset, the backend's own notification limit applies.
    pub overflow_threshold_bytes: Option<usize>,
    /// Lifetime of overflow entries nobody picked up
    pub overflow_ttl_seconds: u64,
    pub keepalive: KeepaliveConfig,
    pub cache: CacheConfig,
    pub lock: LockConfig,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_channel: None,
            channel_prefix: "tasker_bus".to_string(),
            publish_wait_timeout_ms: 10_000,
            overflow_threshold_bytes: None,
            overflow_ttl_seconds: 60,
            keepalive: KeepaliveConfig::default(),
            cache: CacheConfig::default(),
            lock: LockConfig::default(),
            database_url: None,
            redis_url: None,
        }
    }
}

impl BusConfig {
    /// Load configuration from the default locations (see [`ConfigLoader`])
    pub fn load() -> BusResult<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from an explicit TOML file plus environment overrides
    pub fn load_from(path: impl AsRef<std::path::Path>) -> BusResult<Self> {
        ConfigLoader::new().with_file(path.as_ref()).load()
    }

    pub fn with_default_channel(mut self, channel: impl Into<String>) -> Self {
        self.default_channel = Some(channel.into());
        self
    }

    pub fn with_overflow_threshold(mut self, bytes: usize) -> Self {
        self.overflow_threshold_bytes = Some(bytes);
        self
    }

    pub fn with_publish_wait_timeout(mut self, timeout: Duration) -> Self {
        self.publish_wait_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Resolve the default channel, generating a unique one when not configured
    pub fn resolve_default_channel(&self) -> String {
        match &self.default_channel {
            Some(channel) if !channel.is_empty() => channel.clone(),
            _ => format!("{}_{}", self.channel_prefix, Uuid::new_v4().simple()),
        }
    }

    pub fn publish_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_wait_timeout_ms)
    }

    pub fn overflow_ttl(&self) -> Duration {
        Duration::from_secs(self.overflow_ttl_seconds)
    }

    /// Validate the configuration
    pub fn validate(&self) -> BusResult<()> {
        if self.channel_prefix.is_empty() && self.default_channel.is_none() {
            return Err(BusError::configuration(
                "channel_prefix cannot be empty when default_channel is unset",
            ));
        }
        if self.publish_wait_timeout_ms == 0 {
            return Err(BusError::configuration(
                "publish_wait_timeout_ms must be greater than zero",
            ));
        }
        if let Some(threshold) = self.overflow_threshold_bytes {
            if threshold == 0 {
                return Err(BusError::configuration(
                    "overflow_threshold_bytes must be greater than zero",
                ));
            }
        }
        self.keepalive.validate()?;
        self.lock.validate()
    }
}

/// Liveness probing and reconnect policy for subscription receive loops
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Idle time after which the receive loop pings the backend
    pub probe_interval_seconds: u64,
    /// Overrides `probe_interval_seconds` when set; mostly for tests
    pub probe_interval_ms: Option<u64>,
    pub reconnect_max_attempts: u32,
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            probe_interval_seconds: 90,
            probe_interval_ms: None,
            reconnect_max_attempts: 5,
            reconnect_initial_backoff_ms: 250,
            reconnect_max_backoff_ms: 10_000,
        }
    }
}

impl KeepaliveConfig {
    pub fn probe_interval(&self) -> Duration {
        match self.probe_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs(self.probe_interval_seconds),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_max_attempts,
            initial_backoff: Duration::from_millis(self.reconnect_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.reconnect_max_backoff_ms),
        }
    }

    fn validate(&self) -> BusResult<()> {
        if self.probe_interval().is_zero() {
            return Err(BusError::configuration(
                "keepalive probe interval must be greater than zero",
            ));
        }
        if self.reconnect_initial_backoff_ms > self.reconnect_max_backoff_ms {
            return Err(BusError::configuration(
                "reconnect_initial_backoff_ms cannot exceed reconnect_max_backoff_ms",
            ));
        }
        Ok(())
    }
}

/// Exponential backoff used while a subscription is reconnecting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ReconnectPolicy {
    /// Backoff before the given (zero-based) attempt, doubling up to the cap
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Cache store settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Interval of the background expiry sweep; 0 disables it
    pub sweep_interval_seconds: u64,
    /// Key prefix for the Redis cache provider
    pub redis_key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: 60,
            redis_key_prefix: "tasker_bus:cache:".to_string(),
        }
    }
}

impl CacheConfig {
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_seconds > 0).then(|| Duration::from_secs(self.sweep_interval_seconds))
    }
}

/// Lock manager settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LockConfig {
    /// Expiry of Redis lock tokens, bounding how long a crashed holder blocks others
    pub redis_lock_ttl_seconds: u64,
    /// Poll interval of blocking acquisition on backends without a blocking primitive
    pub retry_interval_ms: u64,
    pub redis_key_prefix: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            redis_lock_ttl_seconds: 30,
            retry_interval_ms: 50,
            redis_key_prefix: "tasker_bus:lock:".to_string(),
        }
    }
}

impl LockConfig {
    pub fn redis_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.redis_lock_ttl_seconds)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    fn validate(&self) -> BusResult<()> {
        if self.redis_lock_ttl_seconds == 0 {
            return Err(BusError::configuration(
                "redis_lock_ttl_seconds must be greater than zero",
            ));
        }
        if self.retry_interval_ms == 0 {
            return Err(BusError::configuration(
                "lock retry_interval_ms must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BusConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.overflow_threshold_bytes, None);
        assert_eq!(config.overflow_ttl(), Duration::from_secs(60));
        assert_eq!(config.cache.sweep_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_default_channel_resolution() {
        let generated = BusConfig::default().resolve_default_channel();
        assert!(generated.starts_with("tasker_bus_"));
        assert_ne!(generated, BusConfig::default().resolve_default_channel());

        let fixed = BusConfig::default().with_default_channel("node_a");
        assert_eq!(fixed.resolve_default_channel(), "node_a");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = BusConfig::default();
        config.publish_wait_timeout_ms = 0;
        assert!(config.validate().is_err());

        let config = BusConfig::default().with_overflow_threshold(0);
        assert!(config.validate().is_err());

        let mut config = BusConfig::default();
        config.keepalive.reconnect_initial_backoff_ms = 20_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconnect_backoff_doubles_and_caps() {
        let policy = KeepaliveConfig::default().reconnect_policy();
        assert_eq!(policy.backoff_for(0), Duration::from_millis(250));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff_for(10), Duration::from_secs(10));
        assert_eq!(policy.backoff_for(64), Duration::from_secs(10));
    }

    #[test]
    fn test_probe_interval_override() {
        let keepalive = KeepaliveConfig {
            probe_interval_ms: Some(50),
            ..KeepaliveConfig::default()
        };
        assert_eq!(keepalive.probe_interval(), Duration::from_millis(50));
    }
}
