//! Cache Service - Unified Cache Operations
//!
//! Routes every operation to the remote store (through the circuit breaker) or to the
//! Local Store, depending on the current [`CacheMode`]. No cache fault ever reaches the
//! caller: reads degrade to a miss, writes to `false`, counts to `0`. Each fault is
//! counted in [`CacheStatistics::errors`] and logged.
//!
//! ```text
//! get/set/... → mode?
//!   remote   → CircuitBreaker::execute → RedisStore   (error → fallback to local)
//!   local    → LocalStore
//!   disabled → miss / no-op
//! ```
//!
//! While in fallback mode a background probe pings the remote store every
//! `recovery_interval`; the first successful ping switches back to `remote`.

use crate::backends::LocalStore;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::codecs::JsonCodec;
use crate::config::CacheConfig;
use crate::invalidation::{AtomicInvalidationStats, InvalidationEnvelope, InvalidationMessage, InvalidationStats};
use crate::keys::full_key;
use crate::pubsub::Subscription;
use crate::registry::CircuitBreakerRegistry;
use crate::traits::{CacheCodec, CacheStore, KeyTtl};
use anyhow::Result;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Cache strategies for different data types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStrategy {
    /// Real-time data - 10 seconds TTL
    RealTime,
    /// Short-term data - 5 minutes TTL
    ShortTerm,
    /// Medium-term data - 1 hour TTL
    MediumTerm,
    /// Long-term data - 3 hours TTL
    LongTerm,
    /// Custom TTL
    Custom(Duration),
    /// Default strategy (5 minutes)
    Default,
}

impl CacheStrategy {
    /// Convert strategy to duration
    pub fn to_duration(&self) -> Duration {
        match self {
            Self::RealTime => Duration::from_secs(10),
            Self::ShortTerm => Duration::from_secs(300),  // 5 minutes
            Self::MediumTerm => Duration::from_secs(3600), // 1 hour
            Self::LongTerm => Duration::from_secs(10800),  // 3 hours
            Self::Custom(duration) => *duration,
            Self::Default => Duration::from_secs(300),
        }
    }
}

/// Which backend is currently authoritative
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    Remote,
    Local,
    Disabled,
}

impl CacheMode {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Remote,
            1 => Self::Local,
            _ => Self::Disabled,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Remote => 0,
            Self::Local => 1,
            Self::Disabled => 2,
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Remote => "remote",
            Self::Local => "local",
            Self::Disabled => "disabled",
        })
    }
}

/// Cumulative counters since start or the last reset
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    /// `hits / (hits + misses)`, `0.0` before the first read
    pub hit_rate: f64,
    pub mode: CacheMode,
}

/// Options for writes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// TTL preset; the service default when `None`
    pub strategy: Option<CacheStrategy>,
    pub namespace: Option<String>,
    pub tags: Vec<String>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    #[must_use]
    pub fn ttl(self, ttl: Duration) -> Self {
        self.strategy(CacheStrategy::Custom(ttl))
    }

    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
}

impl CacheCounters {
    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(u64::try_from(n).unwrap_or(u64::MAX), Ordering::Relaxed);
    }
}

/// The store an operation runs against
struct Target<'a> {
    store: &'a dyn CacheStore,
    /// Remote calls go through the breaker
    remote: bool,
}

struct ServiceInner<C> {
    config: CacheConfig,
    local: Arc<LocalStore>,
    remote: Option<Arc<dyn CacheStore>>,
    breaker: Arc<CircuitBreaker>,
    registry: Arc<CircuitBreakerRegistry>,
    codec: C,
    mode: AtomicU8,
    counters: CacheCounters,
    /// Origin id stamped on outgoing invalidation messages
    instance_id: String,
    invalidation_stats: Arc<AtomicInvalidationStats>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    listener: Mutex<Option<Subscription>>,
}

/// Cache Service - the only cache surface business code sees
///
/// Cheap to clone; clones share stores, breaker, statistics and mode.
/// Build one with [`CacheServiceBuilder`](crate::CacheServiceBuilder).
pub struct CacheService<C: CacheCodec = JsonCodec> {
    inner: Arc<ServiceInner<C>>,
}

impl<C: CacheCodec> Clone for CacheService<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: CacheCodec + 'static> CacheService<C> {
    pub(crate) fn from_parts(
        config: CacheConfig,
        local: Arc<LocalStore>,
        remote: Option<Arc<dyn CacheStore>>,
        registry: Arc<CircuitBreakerRegistry>,
        codec: C,
    ) -> Self {
        let breaker = registry.get_with_config(config.breaker.clone());
        let mode = if !config.enabled {
            CacheMode::Disabled
        } else if remote.is_some() {
            CacheMode::Remote
        } else {
            CacheMode::Local
        };
        let (shutdown_tx, _) = broadcast::channel(1);

        info!(
            mode = %mode,
            remote = remote.as_ref().map_or("none", |r| r.name()),
            codec = codec.name(),
            breaker = %breaker.name(),
            "Cache Service initialized"
        );

        Self {
            inner: Arc::new(ServiceInner {
                config,
                local,
                remote,
                breaker,
                registry,
                codec,
                mode: AtomicU8::new(mode.as_u8()),
                counters: CacheCounters::default(),
                instance_id: uuid::Uuid::new_v4().to_string(),
                invalidation_stats: Arc::new(AtomicInvalidationStats::default()),
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Spawn the sweeper, recovery probe and invalidation listener
    pub(crate) fn start_background(&self) {
        let inner = &self.inner;
        let mut tasks = inner.tasks.lock();
        tasks.push(inner.local.spawn_sweeper(inner.config.sweep_interval));

        let Some(remote) = inner.remote.as_ref() else {
            return;
        };
        if !inner.config.enabled {
            return;
        }
        tasks.push(self.spawn_recovery_probe());

        if inner.config.invalidation.listen {
            let subscription = self.spawn_invalidation_listener(Arc::clone(remote));
            *inner.listener.lock() = Some(subscription);
        }
    }

    fn spawn_recovery_probe(&self) -> JoinHandle<()> {
        let weak: Weak<ServiceInner<C>> = Arc::downgrade(&self.inner);
        let every = self.inner.config.recovery_interval;
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.recv() => break,
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.mode() == CacheMode::Local {
                    inner.probe_remote().await;
                }
            }
            debug!("Recovery probe stopped");
        })
    }

    fn spawn_invalidation_listener(&self, remote: Arc<dyn CacheStore>) -> Subscription {
        let local = Arc::clone(&self.inner.local);
        let stats = Arc::clone(&self.inner.invalidation_stats);
        let instance_id = self.inner.instance_id.clone();
        let config = &self.inner.config.invalidation;

        let handler = move |payload: String| {
            let local = Arc::clone(&local);
            let stats = Arc::clone(&stats);
            let instance_id = instance_id.clone();
            async move {
                let envelope = match InvalidationEnvelope::from_json(&payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(error = %e, "Failed to deserialize invalidation message");
                        stats.processing_errors.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                };
                if envelope.origin == instance_id {
                    stats.own_messages_ignored.fetch_add(1, Ordering::Relaxed);
                    return;
                }

                stats.record_received(&envelope.message);
                match envelope.message.apply(local.as_ref()).await {
                    Ok(removed) => {
                        debug!(origin = %envelope.origin, removed, "[Local] Applied invalidation message");
                    }
                    Err(e) => {
                        error!(error = %e, "Invalidation handler error");
                        stats.processing_errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        };

        Subscription::start_linked(
            remote,
            config.channel.clone(),
            config.reconnect_delay,
            handler,
            self.inner.shutdown_tx.subscribe(),
        )
    }

    // ===== Reads and writes =====

    /// Get a value, `None` on miss or on any cache fault
    pub async fn get<T: DeserializeOwned>(&self, key: &str, namespace: Option<&str>) -> Option<T> {
        let inner = &self.inner;
        let full_key = full_key(namespace, key);
        let Some(target) = inner.target() else {
            inner.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let bytes = inner
            .guarded(&target, "get", &full_key, target.store.get(&full_key))
            .await
            .flatten();
        inner.decode_hit(&full_key, bytes)
    }

    /// Store a value; `false` if it was not written
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, options: &SetOptions) -> bool {
        let full_key = full_key(options.namespace.as_deref(), key);
        match self.inner.codec.serialize(value) {
            Ok(bytes) => self.inner.set_bytes(&full_key, &bytes, options).await,
            Err(e) => {
                self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %full_key, error = %e, "Failed to serialize cache value");
                false
            }
        }
    }

    /// Return the cached value or compute, return and cache it
    ///
    /// On a miss `factory` runs exactly once and its value is returned at once;
    /// the cache write happens on a detached task whose failure is only logged.
    ///
    /// # Errors
    ///
    /// Only the factory's own error. Cache faults are absorbed.
    pub async fn get_or_set<T, E, F, Fut>(&self, key: &str, options: SetOptions, factory: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.get::<T>(key, options.namespace.as_deref()).await {
            return Ok(cached);
        }

        let value = factory().await?;

        match self.inner.codec.serialize(&value) {
            Ok(bytes) => {
                let full_key = full_key(options.namespace.as_deref(), key);
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    if !inner.set_bytes(&full_key, &bytes, &options).await {
                        debug!(key = %full_key, "Background cache write skipped");
                    }
                });
            }
            Err(e) => {
                self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Failed to serialize computed value");
            }
        }
        Ok(value)
    }

    /// Get several values, positionally
    pub async fn get_many<T: DeserializeOwned>(&self, keys: &[&str], namespace: Option<&str>) -> Vec<Option<T>> {
        let inner = &self.inner;
        let full_keys: Vec<String> = keys.iter().map(|key| full_key(namespace, key)).collect();
        let Some(target) = inner.target() else {
            CacheCounters::add(&inner.counters.misses, keys.len());
            return keys.iter().map(|_| None).collect();
        };

        let label = full_keys.first().map_or("", String::as_str);
        let mut values = inner
            .guarded(&target, "get_many", label, target.store.get_many(&full_keys))
            .await
            .unwrap_or_default();
        values.resize(full_keys.len(), None);

        full_keys
            .iter()
            .zip(values)
            .map(|(full_key, bytes)| inner.decode_hit(full_key, bytes))
            .collect()
    }

    /// Store several values under one set of options
    pub async fn set_many<T: Serialize>(&self, entries: &[(&str, T)], options: &SetOptions) -> bool {
        let inner = &self.inner;
        let namespace = options.namespace.as_deref();
        let mut encoded = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match inner.codec.serialize(value) {
                Ok(bytes) => encoded.push((full_key(namespace, key), bytes)),
                Err(e) => {
                    inner.counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "Failed to serialize cache value");
                    return false;
                }
            }
        }
        if encoded.is_empty() {
            return true;
        }

        // Tag membership is recorded per key
        if !options.tags.is_empty() {
            let mut all_written = true;
            for (full_key, bytes) in &encoded {
                all_written &= inner.set_bytes(full_key, bytes, options).await;
            }
            return all_written;
        }

        let Some(target) = inner.target() else {
            return false;
        };
        let ttl = inner.ttl_for(options);
        let label = encoded.first().map_or("", |(key, _)| key.as_str());
        let written = inner
            .guarded(&target, "set_many", label, target.store.set_many(&encoded, ttl))
            .await
            .is_some();
        if written {
            CacheCounters::add(&inner.counters.sets, encoded.len());
            debug!(count = encoded.len(), ttl_secs = ttl.as_secs(), "Cached keys in bulk");
            if target.remote {
                let keys: Vec<String> = encoded.into_iter().map(|(key, _)| key).collect();
                if let Err(e) = inner.local.delete_many(&keys).await {
                    warn!(error = %e, "[Local] Failed to drop fallback copies");
                }
            }
        }
        written
    }

    // ===== Invalidation =====

    /// Delete one key; `true` if a live entry was removed
    pub async fn delete(&self, key: &str, namespace: Option<&str>) -> bool {
        let inner = &self.inner;
        let full_key = full_key(namespace, key);
        let Some(target) = inner.target() else {
            return false;
        };

        let Some(removed) = inner
            .guarded(&target, "delete", &full_key, target.store.delete(&full_key))
            .await
        else {
            return false;
        };

        CacheCounters::add(&inner.counters.deletes, usize::from(removed));
        if target.remote {
            inner.mirror_to_local(InvalidationMessage::remove(full_key)).await;
        }
        removed
    }

    /// Delete several keys; returns how many were removed
    pub async fn delete_many(&self, keys: &[&str], namespace: Option<&str>) -> usize {
        let inner = &self.inner;
        let full_keys: Vec<String> = keys.iter().map(|key| full_key(namespace, key)).collect();
        let Some(label) = full_keys.first() else {
            return 0;
        };
        let Some(target) = inner.target() else {
            return 0;
        };

        let Some(removed) = inner
            .guarded(&target, "delete_many", label, target.store.delete_many(&full_keys))
            .await
        else {
            return 0;
        };

        CacheCounters::add(&inner.counters.deletes, removed);
        if target.remote {
            inner.mirror_to_local(InvalidationMessage::remove_bulk(full_keys)).await;
        }
        removed
    }

    /// Delete every key matching a `*` pattern within `namespace`
    pub async fn delete_pattern(&self, pattern: &str, namespace: Option<&str>) -> usize {
        let inner = &self.inner;
        let full_pattern = full_key(namespace, pattern);
        let Some(target) = inner.target() else {
            return 0;
        };

        let Some(removed) = inner
            .guarded(&target, "delete_pattern", &full_pattern, target.store.delete_pattern(&full_pattern))
            .await
        else {
            return 0;
        };

        CacheCounters::add(&inner.counters.deletes, removed);
        info!(pattern = %full_pattern, count = removed, "Deleted keys matching pattern");
        if target.remote {
            inner.mirror_to_local(InvalidationMessage::remove_pattern(full_pattern)).await;
        }
        removed
    }

    /// Delete every entry tagged `tag`
    pub async fn invalidate_tag(&self, tag: &str) -> usize {
        let inner = &self.inner;
        let Some(target) = inner.target() else {
            return 0;
        };

        let Some(removed) = inner
            .guarded(&target, "invalidate_tag", tag, target.store.delete_tag(tag))
            .await
        else {
            return 0;
        };

        CacheCounters::add(&inner.counters.deletes, removed);
        info!(tag = %tag, count = removed, "Invalidated tag");
        if target.remote {
            inner.mirror_to_local(InvalidationMessage::remove_tag(tag)).await;
        }
        removed
    }

    /// Clear the active backend
    pub async fn flush(&self) -> bool {
        let inner = &self.inner;
        let Some(target) = inner.target() else {
            return false;
        };
        let flushed = inner
            .guarded(&target, "flush", "*", target.store.flush())
            .await
            .is_some();
        if flushed && target.remote {
            inner.local.clear();
        }
        flushed
    }

    // ===== Counters and key metadata =====

    /// Add `amount` to a counter; `None` on any fault
    pub async fn increment(&self, key: &str, amount: i64, namespace: Option<&str>) -> Option<i64> {
        let inner = &self.inner;
        let full_key = full_key(namespace, key);
        let target = inner.target()?;
        let value = inner
            .guarded(&target, "increment", &full_key, target.store.increment(&full_key, amount))
            .await?;
        if target.remote {
            inner.drop_local_copy(&full_key).await;
        }
        Some(value)
    }

    /// Subtract `amount` from a counter; `None` on any fault
    pub async fn decrement(&self, key: &str, amount: i64, namespace: Option<&str>) -> Option<i64> {
        let inner = &self.inner;
        let full_key = full_key(namespace, key);
        let target = inner.target()?;
        let value = inner
            .guarded(&target, "decrement", &full_key, target.store.decrement(&full_key, amount))
            .await?;
        if target.remote {
            inner.drop_local_copy(&full_key).await;
        }
        Some(value)
    }

    pub async fn exists(&self, key: &str, namespace: Option<&str>) -> bool {
        let inner = &self.inner;
        let full_key = full_key(namespace, key);
        let Some(target) = inner.target() else {
            return false;
        };
        inner
            .guarded(&target, "exists", &full_key, target.store.exists(&full_key))
            .await
            .unwrap_or(false)
    }

    /// Set a new TTL; `false` if the key is absent or on any fault
    pub async fn expire(&self, key: &str, ttl: Duration, namespace: Option<&str>) -> bool {
        let inner = &self.inner;
        let full_key = full_key(namespace, key);
        let Some(target) = inner.target() else {
            return false;
        };
        inner
            .guarded(&target, "expire", &full_key, target.store.expire(&full_key, ttl))
            .await
            .unwrap_or(false)
    }

    /// Remaining lifetime; [`KeyTtl::Missing`] on any fault
    pub async fn ttl(&self, key: &str, namespace: Option<&str>) -> KeyTtl {
        let inner = &self.inner;
        let full_key = full_key(namespace, key);
        let Some(target) = inner.target() else {
            return KeyTtl::Missing;
        };
        inner
            .guarded(&target, "ttl", &full_key, target.store.ttl(&full_key))
            .await
            .unwrap_or(KeyTtl::Missing)
    }

    // ===== Pub/Sub =====

    /// Publish on the active backend; returns the number of receivers
    pub async fn publish(&self, channel: &str, message: &str) -> usize {
        let inner = &self.inner;
        let Some(target) = inner.target() else {
            return 0;
        };
        inner
            .guarded(&target, "publish", channel, target.store.publish(channel, message))
            .await
            .unwrap_or(0)
    }

    /// Run `handler` for every message on `channel`
    ///
    /// Subscribes on the remote store when one is configured, otherwise on the
    /// in-process bus. `None` when caching is disabled. The subscription runs until
    /// [`Subscription::shutdown`] or [`shutdown`](Self::shutdown), whether or not
    /// the returned handle is kept.
    pub fn subscribe<F, Fut>(&self, channel: &str, handler: F) -> Option<Subscription>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let inner = &self.inner;
        if inner.mode() == CacheMode::Disabled {
            return None;
        }
        let store: Arc<dyn CacheStore> = match &inner.remote {
            Some(remote) => Arc::clone(remote),
            None => Arc::clone(&inner.local) as Arc<dyn CacheStore>,
        };
        Some(Subscription::start_linked(
            store,
            channel,
            inner.config.invalidation.reconnect_delay,
            handler,
            inner.shutdown_tx.subscribe(),
        ))
    }

    // ===== Health and statistics =====

    /// `true` when running on the Local Store alone; otherwise pings the remote
    /// store through the breaker and updates the mode from the result
    pub async fn health_check(&self) -> bool {
        let inner = &self.inner;
        if inner.remote.is_none() || inner.mode() == CacheMode::Disabled {
            return true;
        }
        inner.probe_remote().await
    }

    pub fn get_statistics(&self) -> CacheStatistics {
        let counters = &self.inner.counters;
        let hits = counters.hits.load(Ordering::Relaxed);
        let misses = counters.misses.load(Ordering::Relaxed);
        let reads = hits + misses;
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if reads == 0 { 0.0 } else { hits as f64 / reads as f64 };

        CacheStatistics {
            hits,
            misses,
            sets: counters.sets.load(Ordering::Relaxed),
            deletes: counters.deletes.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
            hit_rate,
            mode: self.mode(),
        }
    }

    /// Zero every cache and invalidation counter
    pub fn reset_statistics(&self) {
        let counters = &self.inner.counters;
        for counter in [
            &counters.hits,
            &counters.misses,
            &counters.sets,
            &counters.deletes,
            &counters.errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.inner.invalidation_stats.reset();
        info!("Cache statistics reset");
    }

    pub fn invalidation_stats(&self) -> InvalidationStats {
        self.inner.invalidation_stats.snapshot()
    }

    pub fn mode(&self) -> CacheMode {
        self.inner.mode()
    }

    /// Breaker guarding the remote store
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.inner.breaker
    }

    pub fn registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.inner.registry
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.inner.local
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Id stamped on this instance's invalidation broadcasts
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Stop every background task
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let _ = inner.shutdown_tx.send(());

        let listener = inner.listener.lock().take();
        if let Some(listener) = listener {
            listener.shutdown().await;
        }

        let tasks: Vec<JoinHandle<()>> = inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        info!("Cache Service shut down");
    }
}

impl<C: CacheCodec> ServiceInner<C> {
    fn mode(&self) -> CacheMode {
        CacheMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    fn target(&self) -> Option<Target<'_>> {
        match self.mode() {
            CacheMode::Disabled => None,
            CacheMode::Remote => match &self.remote {
                Some(remote) => Some(Target {
                    store: remote.as_ref(),
                    remote: true,
                }),
                None => Some(self.local_target()),
            },
            CacheMode::Local => Some(self.local_target()),
        }
    }

    fn local_target(&self) -> Target<'_> {
        Target {
            store: self.local.as_ref(),
            remote: false,
        }
    }

    fn ttl_for(&self, options: &SetOptions) -> Duration {
        options
            .strategy
            .unwrap_or(self.config.default_strategy)
            .to_duration()
    }

    /// Run a store call; remote calls go through the breaker
    ///
    /// Any error is counted, logged and turned into `None`. A remote error also
    /// switches to fallback mode when that policy is enabled.
    async fn guarded<T>(
        &self,
        target: &Target<'_>,
        op: &'static str,
        key: &str,
        call: impl Future<Output = Result<T>>,
    ) -> Option<T> {
        if !target.remote {
            return match call.await {
                Ok(value) => Some(value),
                Err(e) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(op, key = %key, error = %e, "[Local] Cache operation failed");
                    None
                }
            };
        }

        match self.breaker.execute(|| call).await {
            Ok(value) => Some(value),
            Err(CircuitBreakerError::Operation(e)) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(op, key = %key, backend = target.store.name(), error = %e, "Remote cache operation failed");
                self.enter_fallback();
                None
            }
            Err(open @ CircuitBreakerError::Open { .. }) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                debug!(op, key = %key, error = %open, "Remote cache call rejected");
                self.enter_fallback();
                None
            }
        }
    }

    async fn set_bytes(&self, full_key: &str, bytes: &[u8], options: &SetOptions) -> bool {
        let Some(target) = self.target() else {
            return false;
        };
        let ttl = self.ttl_for(options);
        let written = self
            .guarded(&target, "set", full_key, target.store.set(full_key, bytes, ttl, &options.tags))
            .await
            .is_some();
        if written {
            self.counters.sets.fetch_add(1, Ordering::Relaxed);
            debug!(key = %full_key, ttl_secs = ttl.as_secs(), backend = target.store.name(), "Cached key");
            if target.remote {
                self.drop_local_copy(full_key).await;
            }
        }
        written
    }

    /// After a remote write, drop the fallback copy so it cannot resurface in the
    /// next outage
    async fn drop_local_copy(&self, full_key: &str) {
        if let Err(e) = self.local.delete(full_key).await {
            warn!(key = %full_key, error = %e, "[Local] Failed to drop fallback copy");
        }
    }

    fn decode_hit<T: DeserializeOwned>(&self, full_key: &str, bytes: Option<Vec<u8>>) -> Option<T> {
        let Some(bytes) = bytes else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        match self.codec.deserialize::<T>(&bytes) {
            Ok(value) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                warn!(key = %full_key, codec = self.codec.name(), error = %e, "Failed to deserialize cached value");
                None
            }
        }
    }

    /// After a remote removal, drop the same entries from the fallback copy and
    /// tell other instances to do likewise
    async fn mirror_to_local(&self, message: InvalidationMessage) {
        if let Err(e) = message.apply(self.local.as_ref()).await {
            warn!(error = %e, "[Local] Failed to mirror removal");
        }
        if self.config.invalidation.broadcast_on_delete {
            self.broadcast(message).await;
        }
    }

    async fn broadcast(&self, message: InvalidationMessage) {
        let Some(remote) = &self.remote else {
            return;
        };
        let payload = match InvalidationEnvelope::new(self.instance_id.clone(), message).to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode invalidation message");
                return;
            }
        };

        let target = Target {
            store: remote.as_ref(),
            remote: true,
        };
        let channel = &self.config.invalidation.channel;
        if let Some(receivers) = self
            .guarded(&target, "publish", channel, target.store.publish(channel, &payload))
            .await
        {
            self.invalidation_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
            debug!(channel = %channel, receivers, "Broadcast invalidation message");
        }
    }

    /// Ping the remote store through the breaker and set the mode from the result
    async fn probe_remote(&self) -> bool {
        let Some(remote) = &self.remote else {
            return true;
        };
        match self.breaker.execute(|| remote.ping()).await {
            Ok(()) => {
                self.leave_fallback();
                true
            }
            Err(e) => {
                debug!(backend = remote.name(), error = %e, "Remote health probe failed");
                self.enter_fallback();
                false
            }
        }
    }

    fn enter_fallback(&self) {
        if !self.config.fallback_to_local {
            return;
        }
        let switched = self
            .mode
            .compare_exchange(
                CacheMode::Remote.as_u8(),
                CacheMode::Local.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if switched {
            warn!(breaker = %self.breaker.name(), "Remote cache unavailable, falling back to local store");
        }
    }

    fn leave_fallback(&self) {
        let switched = self
            .mode
            .compare_exchange(
                CacheMode::Local.as_u8(),
                CacheMode::Remote.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if switched {
            info!(breaker = %self.breaker.name(), "Remote cache healthy again, leaving fallback mode");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_durations() {
        assert_eq!(CacheStrategy::RealTime.to_duration(), Duration::from_secs(10));
        assert_eq!(CacheStrategy::MediumTerm.to_duration(), Duration::from_secs(3600));
        assert_eq!(
            CacheStrategy::Custom(Duration::from_millis(1500)).to_duration(),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_mode_encoding() {
        for mode in [CacheMode::Remote, CacheMode::Local, CacheMode::Disabled] {
            assert_eq!(CacheMode::from_u8(mode.as_u8()), mode);
        }
        assert_eq!(serde_json::to_string(&CacheMode::Local).unwrap(), "\"local\"");
    }

    #[test]
    fn test_set_options_builder() {
        let options = SetOptions::new()
            .ttl(Duration::from_secs(30))
            .namespace("users")
            .tag("profile")
            .tags(["a", "b"]);
        assert_eq!(options.strategy, Some(CacheStrategy::Custom(Duration::from_secs(30))));
        assert_eq!(options.namespace.as_deref(), Some("users"));
        assert_eq!(options.tags, vec!["profile", "a", "b"]);
    }

    #[tokio::test]
    async fn test_disabled_mode_is_inert() {
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::local_only()
        };
        let service = CacheService::from_parts(
            config,
            Arc::new(LocalStore::new()),
            None,
            Arc::new(CircuitBreakerRegistry::default()),
            JsonCodec,
        );

        assert_eq!(service.mode(), CacheMode::Disabled);
        assert!(!service.set("k", &1, &SetOptions::new()).await);
        assert_eq!(service.get::<i32>("k", None).await, None);
        assert_eq!(service.delete_pattern("*", None).await, 0);
        assert!(service.health_check().await);
        assert!(service.local_store().is_empty());

        let stats = service.get_statistics();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 0);
        assert_eq!(stats.mode, CacheMode::Disabled);
    }
}
