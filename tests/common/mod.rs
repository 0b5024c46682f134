//! Common utilities for integration tests
//!
//! - `FlakyStore`: an in-process "remote" whose failures can be switched on and off
//! - Service builders for local-only and remote-with-fallback setups
//! - Test data generators

#![allow(dead_code)]

use anyhow::{Result, bail};
use resilient_cache::{
    CacheConfig, CacheService, CacheServiceBuilder, CacheStore, CircuitBreakerConfig, KeyTtl, LocalStore,
    MessageStream, async_trait,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Get Redis URL from environment or use default
pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// Create a test key with unique suffix
pub fn test_key(name: &str) -> String {
    format!("test_{}_{}", name, rand::random::<u32>())
}

/// Remote stand-in backed by a `LocalStore`
///
/// While `failing` is set every call errors like a dropped connection. `calls`
/// counts every attempted call, so tests can prove the breaker skipped one.
#[derive(Default)]
pub struct FlakyStore {
    inner: LocalStore,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The data held "remotely"
    pub fn data(&self) -> &LocalStore {
        &self.inner
    }

    fn attempt(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.attempt()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration, tags: &[String]) -> Result<()> {
        self.attempt()?;
        self.inner.set(key, value, ttl, tags).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.attempt()?;
        self.inner.delete(key).await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        self.attempt()?;
        self.inner.delete_many(keys).await
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        self.attempt()?;
        self.inner.get_many(keys).await
    }

    async fn set_many(&self, entries: &[(String, Vec<u8>)], ttl: Duration) -> Result<()> {
        self.attempt()?;
        self.inner.set_many(entries, ttl).await
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        self.attempt()?;
        self.inner.scan(pattern).await
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize> {
        self.attempt()?;
        self.inner.delete_pattern(pattern).await
    }

    async fn delete_tag(&self, tag: &str) -> Result<usize> {
        self.attempt()?;
        self.inner.delete_tag(tag).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.attempt()?;
        self.inner.exists(key).await
    }

    async fn increment(&self, key: &str, amount: i64) -> Result<i64> {
        self.attempt()?;
        self.inner.increment(key, amount).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.attempt()?;
        self.inner.expire(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.attempt()?;
        self.inner.ttl(key).await
    }

    async fn flush(&self) -> Result<()> {
        self.attempt()?;
        self.inner.flush().await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        self.attempt()?;
        self.inner.publish(channel, message).await
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        self.inner.subscribe(channel).await
    }

    async fn ping(&self) -> Result<()> {
        self.attempt()
    }

    fn name(&self) -> &'static str {
        "Flaky"
    }
}

/// Breaker that opens after 3 failures and probes after 1s
pub fn fast_breaker() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 3,
        success_threshold: 2,
        volume_threshold: 3,
        timeout: Duration::from_millis(1000),
        window_size: Duration::from_secs(60),
        ..CircuitBreakerConfig::named("test-remote")
    }
}

/// Local Store only
pub async fn setup_local_cache() -> CacheService {
    CacheServiceBuilder::new()
        .config(CacheConfig::local_only())
        .build()
        .await
        .unwrap()
}

/// `remote` as the primary tier with the given fallback policy
pub async fn setup_remote_cache(remote: Arc<FlakyStore>, fallback_to_local: bool) -> CacheService {
    let config = CacheConfig {
        fallback_to_local,
        breaker: fast_breaker(),
        recovery_interval: Duration::from_millis(500),
        ..CacheConfig::default()
    };
    CacheServiceBuilder::new()
        .config(config)
        .with_remote(remote)
        .build()
        .await
        .unwrap()
}

/// Generate test data of various types
pub mod test_data {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct User {
        pub id: u64,
        pub name: String,
        pub email: String,
    }

    impl User {
        pub fn new(id: u64) -> Self {
            Self {
                id,
                name: format!("User {}", id),
                email: format!("user{}@example.com", id),
            }
        }
    }

    /// Generate JSON test data
    pub fn json_user(id: u64) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": format!("User {}", id),
            "email": format!("user{}@example.com", id),
        })
    }
}

/// Wait for a condition with timeout
pub async fn wait_for<F>(mut condition: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> bool,
{
    use tokio::time::{Duration, Instant, sleep};

    let start = Instant::now();
    let timeout = Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }

    false
}
