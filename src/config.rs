//! Cache configuration
//!
//! Read once at construction; there is no hot reload.
//!
//! | Variable | Field |
//! |---|---|
//! | `REDIS_URL` | `redis_url` |
//! | `CACHE_ENABLED` | `enabled` |
//! | `CACHE_REMOTE_ENABLED` | `remote_enabled` |
//! | `CACHE_FALLBACK_TO_LOCAL` | `fallback_to_local` |
//! | `CACHE_DEFAULT_TTL_SECS` | `default_strategy` (as `Custom`) |
//! | `CACHE_COMMAND_TIMEOUT_MS` | `command_timeout` |
//! | `CACHE_BREAKER_FAILURE_THRESHOLD` | `breaker.failure_threshold` |
//! | `CACHE_BREAKER_SUCCESS_THRESHOLD` | `breaker.success_threshold` |
//! | `CACHE_BREAKER_TIMEOUT_MS` | `breaker.timeout` |
//! | `CACHE_BREAKER_WINDOW_MS` | `breaker.window_size` |
//! | `CACHE_BREAKER_VOLUME_THRESHOLD` | `breaker.volume_threshold` |
//! | `CACHE_INVALIDATION_CHANNEL` | `invalidation.channel` |

use crate::cache_service::CacheStrategy;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::invalidation::InvalidationConfig;
use std::str::FromStr;
use std::time::Duration;

/// Name of the breaker guarding the remote store
pub const REMOTE_BREAKER_NAME: &str = "redis-cache";

/// Cache service configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Master switch; when `false` every read misses and every write is skipped
    pub enabled: bool,
    /// Use the remote store; when `false` the Local Store is the only backend
    pub remote_enabled: bool,
    pub redis_url: String,
    /// TTL used when a write names no strategy
    pub default_strategy: CacheStrategy,
    /// Switch to the Local Store while the remote store is failing
    pub fallback_to_local: bool,
    /// Bound on every remote command, including connect
    pub command_timeout: Duration,
    /// Local Store sweep period
    pub sweep_interval: Duration,
    /// How often to probe the remote store while in fallback mode
    pub recovery_interval: Duration,
    pub breaker: CircuitBreakerConfig,
    pub invalidation: InvalidationConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            remote_enabled: true,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            default_strategy: CacheStrategy::MediumTerm,
            fallback_to_local: true,
            command_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60),
            recovery_interval: Duration::from_secs(5),
            breaker: CircuitBreakerConfig::named(REMOTE_BREAKER_NAME),
            invalidation: InvalidationConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Local Store only, no remote tier
    pub fn local_only() -> Self {
        Self {
            remote_enabled: false,
            ..Self::default()
        }
    }

    /// Defaults overridden by environment variables
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable name
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a value cannot be parsed or the result is invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = lookup("REDIS_URL") {
            config.redis_url = url;
        }
        if let Some(enabled) = parse_bool(&lookup, "CACHE_ENABLED")? {
            config.enabled = enabled;
        }
        if let Some(enabled) = parse_bool(&lookup, "CACHE_REMOTE_ENABLED")? {
            config.remote_enabled = enabled;
        }
        if let Some(fallback) = parse_bool(&lookup, "CACHE_FALLBACK_TO_LOCAL")? {
            config.fallback_to_local = fallback;
        }
        if let Some(secs) = parse::<u64>(&lookup, "CACHE_DEFAULT_TTL_SECS")? {
            config.default_strategy = CacheStrategy::Custom(Duration::from_secs(secs));
        }
        if let Some(ms) = parse::<u64>(&lookup, "CACHE_COMMAND_TIMEOUT_MS")? {
            config.command_timeout = Duration::from_millis(ms);
        }
        if let Some(threshold) = parse(&lookup, "CACHE_BREAKER_FAILURE_THRESHOLD")? {
            config.breaker.failure_threshold = threshold;
        }
        if let Some(threshold) = parse(&lookup, "CACHE_BREAKER_SUCCESS_THRESHOLD")? {
            config.breaker.success_threshold = threshold;
        }
        if let Some(ms) = parse::<u64>(&lookup, "CACHE_BREAKER_TIMEOUT_MS")? {
            config.breaker.timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "CACHE_BREAKER_WINDOW_MS")? {
            config.breaker.window_size = Duration::from_millis(ms);
        }
        if let Some(threshold) = parse(&lookup, "CACHE_BREAKER_VOLUME_THRESHOLD")? {
            config.breaker.volume_threshold = threshold;
        }
        if let Some(channel) = lookup("CACHE_INVALIDATION_CHANNEL") {
            config.invalidation.channel = channel;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the service cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };

        if self.default_strategy.to_duration().is_zero() {
            return invalid("default_strategy", "TTL must be greater than zero");
        }
        if self.command_timeout.is_zero() {
            return invalid("command_timeout", "must be greater than zero");
        }
        if self.sweep_interval.is_zero() {
            return invalid("sweep_interval", "must be greater than zero");
        }
        if self.recovery_interval.is_zero() {
            return invalid("recovery_interval", "must be greater than zero");
        }
        if self.breaker.failure_threshold == 0 {
            return invalid("breaker.failure_threshold", "must be at least 1");
        }
        if self.breaker.success_threshold == 0 {
            return invalid("breaker.success_threshold", "must be at least 1");
        }
        if self.breaker.window_size.is_zero() {
            return invalid("breaker.window_size", "must be greater than zero");
        }
        if self.invalidation.channel.is_empty() {
            return invalid("invalidation.channel", "must not be empty");
        }
        Ok(())
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
                name: name.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<bool>, ConfigError> {
    lookup(name)
        .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                name: name.to_string(),
                value: raw.clone(),
                reason: "expected a boolean".to_string(),
            }),
        })
        .transpose()
}
