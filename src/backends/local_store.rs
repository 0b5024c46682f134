//! Local Store - In-Process Fallback Backend
//!
//! `DashMap`-backed key table used when the remote tier is disabled or unhealthy.
//! Memory only: contents are lost on restart.
//!
//! Expiry is enforced twice:
//! - lazily, on every read (an expired entry is never returned)
//! - proactively, by a sweeper task that removes expired entries nobody reads
//!
//! Tags are stored on each entry; tag and pattern deletes scan the whole table,
//! which is acceptable for a fallback store.
//!
//! Pub/Sub is served by an in-process `tokio::sync::broadcast` bus so that local-only
//! deployments keep the same `publish`/`subscribe` contract.

use crate::keys::wildcard_regex;
use crate::traits::{CacheStore, KeyTtl, MessageStream};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::stream;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Buffered messages per in-process channel before slow subscribers lag
const CHANNEL_CAPACITY: usize = 1024;

/// Cache entry with expiration and tag tracking
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
    tags: Vec<String>,
}

impl CacheEntry {
    fn new(value: Vec<u8>, ttl: Duration, tags: &[String]) -> Self {
        Self {
            value,
            // A TTL past the clock's range never expires
            expires_at: Instant::now().checked_add(ttl),
            tags: tags.to_vec(),
        }
    }

    fn persistent(value: Vec<u8>) -> Self {
        Self {
            value,
            expires_at: None,
            tags: Vec::new(),
        }
    }

    fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// In-memory store with lazy expiry, periodic sweep, tags and an in-process bus
///
/// **Example**:
/// ```rust
/// use resilient_cache::backends::LocalStore;
/// use resilient_cache::CacheStore;
/// use std::time::Duration;
///
/// # async fn example() -> anyhow::Result<()> {
/// let store = LocalStore::new();
/// store.set("user:1", b"alice", Duration::from_secs(60), &[]).await?;
/// assert_eq!(store.get("user:1").await?, Some(b"alice".to_vec()));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct LocalStore {
    map: DashMap<String, CacheEntry>,
    channels: DashMap<String, broadcast::Sender<String>>,
}

impl LocalStore {
    pub fn new() -> Self {
        info!("Initializing Local Store (DashMap)");
        Self::default()
    }

    /// Spawn the periodic sweep of expired entries
    ///
    /// The task holds only a weak reference and exits once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        let every = every.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    debug!("[Local] Store dropped, sweeper exiting");
                    break;
                };
                store.cleanup_expired();
            }
        })
    }

    /// Remove every expired entry; returns how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.map.retain(|_, entry| {
            if entry.is_expired_at(now) {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            debug!(count = removed, "[Local] Swept expired entries");
        }
        removed
    }

    /// Number of held entries, including expired ones not yet swept
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Live keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .map
            .iter()
            .filter(|entry| !entry.value().is_expired_at(now))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Remove all entries
    pub fn clear(&self) {
        self.map.clear();
    }

    fn read(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let entry = self.map.get(key)?;
        if entry.is_expired_at(now) {
            drop(entry);
            // only drop it if nobody re-set the key in between
            self.map.remove_if(key, |_, e| e.is_expired_at(now));
            None
        } else {
            Some(entry.value.clone())
        }
    }

    fn remove_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.map
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired_at(now))
    }

    /// Remove entries selected by `matches`; counts only live ones
    fn remove_where(&self, matches: impl Fn(&str, &CacheEntry) -> bool) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.map.retain(|key, entry| {
            if matches(key, entry) {
                if !entry.is_expired_at(now) {
                    removed += 1;
                }
                false
            } else {
                true
            }
        });
        removed
    }
}

// ===== Trait Implementations =====

#[async_trait]
impl CacheStore for LocalStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.read(key))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration, tags: &[String]) -> Result<()> {
        self.map
            .insert(key.to_string(), CacheEntry::new(value.to_vec(), ttl, tags));
        debug!(key = %key, ttl_secs = ttl.as_secs(), tags = tags.len(), "[Local] Cached key with TTL");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.remove_key(key))
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        Ok(keys.iter().filter(|key| self.remove_key(key)).count())
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        Ok(keys.iter().map(|key| self.read(key)).collect())
    }

    async fn set_many(&self, entries: &[(String, Vec<u8>)], ttl: Duration) -> Result<()> {
        for (key, value) in entries {
            self.map
                .insert(key.clone(), CacheEntry::new(value.clone(), ttl, &[]));
        }
        debug!(count = entries.len(), ttl_secs = ttl.as_secs(), "[Local] Cached keys in bulk");
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = wildcard_regex(pattern)
            .with_context(|| format!("Invalid key pattern '{pattern}'"))?;
        Ok(self
            .keys()
            .into_iter()
            .filter(|key| matcher.is_match(key))
            .collect())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize> {
        let matcher = wildcard_regex(pattern)
            .with_context(|| format!("Invalid key pattern '{pattern}'"))?;
        let removed = self.remove_where(|key, _| matcher.is_match(key));
        debug!(pattern = %pattern, count = removed, "[Local] Removed keys matching pattern");
        Ok(removed)
    }

    async fn delete_tag(&self, tag: &str) -> Result<usize> {
        let removed = self.remove_where(|_, entry| entry.has_tag(tag));
        debug!(tag = %tag, count = removed, "[Local] Removed tagged keys");
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.read(key).is_some())
    }

    async fn increment(&self, key: &str, amount: i64) -> Result<i64> {
        let now = Instant::now();
        let mut entry = self
            .map
            .entry(key.to_string())
            .or_insert_with(|| CacheEntry::persistent(b"0".to_vec()));
        if entry.is_expired_at(now) {
            *entry = CacheEntry::persistent(b"0".to_vec());
        }

        let current: i64 = std::str::from_utf8(&entry.value)
            .ok()
            .and_then(|text| text.trim().parse().ok())
            .ok_or_else(|| anyhow!("value at '{key}' is not an integer"))?;
        let next = current
            .checked_add(amount)
            .ok_or_else(|| anyhow!("increment of '{key}' by {amount} would overflow"))?;

        entry.value = next.to_string().into_bytes();
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        match self.map.get_mut(key) {
            Some(mut entry) if !entry.is_expired_at(now) => {
                entry.expires_at = now.checked_add(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let now = Instant::now();
        Ok(match self.map.get(key) {
            Some(entry) if !entry.is_expired_at(now) => match entry.expires_at {
                Some(expires_at) => KeyTtl::Expires(expires_at.duration_since(now)),
                None => KeyTtl::Persistent,
            },
            _ => KeyTtl::Missing,
        })
    }

    async fn flush(&self) -> Result<()> {
        self.clear();
        info!("[Local] Flushed all entries");
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        Ok(self
            .channels
            .get(channel)
            .map_or(0, |tx| tx.send(message.to_string()).unwrap_or(0)))
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        let rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        let channel = channel.to_string();

        let messages = stream::unfold(rx, move |mut rx| {
            let channel = channel.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(message) => return Some((message, rx)),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(channel = %channel, skipped, "[Local] Subscriber lagged, messages dropped");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(messages.boxed())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Local"
    }
}
