//! Circuit Breaker Registry
//!
//! Process-wide map from breaker name to a shared [`CircuitBreaker`]. Created once at
//! startup and handed around as `Arc<CircuitBreakerRegistry>`; the first lookup of a
//! name creates the breaker, every later lookup returns that same instance.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Partial breaker configuration merged over the registry defaults
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitBreakerOverrides {
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    pub timeout: Option<Duration>,
    pub window_size: Option<Duration>,
    pub volume_threshold: Option<u32>,
}

impl CircuitBreakerOverrides {
    fn apply(&self, name: &str, defaults: &CircuitBreakerConfig) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            name: name.to_string(),
            failure_threshold: self.failure_threshold.unwrap_or(defaults.failure_threshold),
            success_threshold: self.success_threshold.unwrap_or(defaults.success_threshold),
            timeout: self.timeout.unwrap_or(defaults.timeout),
            window_size: self.window_size.unwrap_or(defaults.window_size),
            volume_threshold: self.volume_threshold.unwrap_or(defaults.volume_threshold),
        }
    }
}

/// Keyed store of named breakers
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry whose breakers start from `defaults`
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            breakers: DashMap::new(),
        }
    }

    /// Get the breaker for `name`, creating it on first use
    ///
    /// `overrides` only matter on the first call for a name; an existing breaker
    /// is returned unchanged.
    pub fn get(&self, name: &str, overrides: Option<&CircuitBreakerOverrides>) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }

        let entry = self.breakers.entry(name.to_string()).or_insert_with(|| {
            let config = overrides
                .cloned()
                .unwrap_or_default()
                .apply(name, &self.defaults);
            debug!(breaker = %name, "Registering circuit breaker");
            Arc::new(CircuitBreaker::new(config))
        });
        Arc::clone(entry.value())
    }

    /// Get the breaker named `config.name`, creating it from the full `config` on first use
    pub fn get_with_config(&self, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let entry = self
            .breakers
            .entry(config.name.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(config)));
        Arc::clone(entry.value())
    }

    pub fn get_all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Stats of every breaker, keyed by name
    pub fn get_all_stats(&self) -> BTreeMap<String, CircuitBreakerStats> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    /// Reset every breaker; returns how many were reset
    pub fn reset_all(&self) -> usize {
        let breakers = self.get_all();
        for breaker in &breakers {
            breaker.reset();
        }
        info!(count = breakers.len(), "Reset all circuit breakers");
        breakers.len()
    }

    /// Forget a breaker; holders of the `Arc` keep using their instance
    pub fn remove(&self, name: &str) -> bool {
        self.breakers.remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;

    #[test]
    fn test_get_returns_same_instance() {
        let registry = CircuitBreakerRegistry::default();
        let first = registry.get("redis", None);
        let second = registry.get("redis", None);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_overrides_merge_over_defaults() {
        let defaults = CircuitBreakerConfig {
            failure_threshold: 9,
            ..CircuitBreakerConfig::default()
        };
        let registry = CircuitBreakerRegistry::new(defaults);
        let overrides = CircuitBreakerOverrides {
            volume_threshold: Some(1),
            timeout: Some(Duration::from_millis(250)),
            ..CircuitBreakerOverrides::default()
        };

        let breaker = registry.get("api", Some(&overrides));
        let config = breaker.config();
        assert_eq!(config.name, "api");
        assert_eq!(config.failure_threshold, 9);
        assert_eq!(config.volume_threshold, 1);
        assert_eq!(config.timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_overrides_ignored_for_existing_breaker() {
        let registry = CircuitBreakerRegistry::default();
        let original = registry.get("db", None);
        let overrides = CircuitBreakerOverrides {
            failure_threshold: Some(1),
            ..CircuitBreakerOverrides::default()
        };
        let again = registry.get("db", Some(&overrides));
        assert!(Arc::ptr_eq(&original, &again));
        assert_eq!(again.config().failure_threshold, 5);
    }

    #[tokio::test]
    async fn test_reset_all_and_stats() {
        let registry = CircuitBreakerRegistry::default();
        let overrides = CircuitBreakerOverrides {
            failure_threshold: Some(1),
            volume_threshold: Some(1),
            ..CircuitBreakerOverrides::default()
        };
        let breaker = registry.get("flaky", Some(&overrides));
        registry.get("healthy", None);

        let _ = breaker
            .execute(|| async { Err::<(), _>("down") })
            .await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let stats = registry.get_all_stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats["flaky"].state, CircuitState::Open);

        assert_eq!(registry.reset_all(), 2);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_remove() {
        let registry = CircuitBreakerRegistry::default();
        registry.get("a", None);
        registry.get("b", None);
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert_eq!(registry.len(), 1);
    }
}
