//! Redis Store - Remote Cache Backend
//!
//! Thin transport adapter over a shared Redis server. It performs no retries and no
//! fallback; the cache service wraps every call in the circuit breaker.
//!
//! - Connection via `ConnectionManager`, established lazily on first use so a cold
//!   or unreachable server does not prevent startup
//! - Every command bounded by `command_timeout`
//! - Tag membership kept server-side as sets `tag:<name>` → full keys
//! - Pattern deletes resolved with cursor-based `SCAN`

use crate::keys::wildcard_glob;
use crate::traits::{CacheStore, KeyTtl, MessageStream};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures_util::{StreamExt, future};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult};
use std::future::Future;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Keys fetched per SCAN iteration
const SCAN_BATCH: usize = 100;
/// Keys per DEL when removing scan results
const DELETE_BATCH: usize = 500;
/// Prefix of the server-side tag membership sets
const TAG_PREFIX: &str = "tag:";

/// Redis-backed remote store
pub struct RedisStore {
    client: Client,
    /// Redis connection manager - handles reconnection automatically
    conn_manager: OnceCell<ConnectionManager>,
    command_timeout: Duration,
}

impl RedisStore {
    /// Create a store for `redis_url` without connecting
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be parsed.
    pub fn new(redis_url: &str, command_timeout: Duration) -> Result<Self> {
        let client = Client::open(redis_url)
            .with_context(|| format!("Failed to create Redis client with URL: {redis_url}"))?;

        Ok(Self {
            client,
            conn_manager: OnceCell::new(),
            command_timeout,
        })
    }

    /// Create a store and verify the server answers `PING`
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(redis_url: &str, command_timeout: Duration) -> Result<Self> {
        let store = Self::new(redis_url, command_timeout)?;
        store.ping().await?;
        info!(redis_url = %redis_url, "Redis Store connected successfully (ConnectionManager enabled)");
        Ok(store)
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let manager = self
            .conn_manager
            .get_or_try_init(|| async {
                let manager = tokio::time::timeout(
                    self.command_timeout,
                    ConnectionManager::new(self.client.clone()),
                )
                .await
                .map_err(|_| anyhow!("Redis connect timed out after {:?}", self.command_timeout))?
                .context("Failed to establish Redis connection manager")?;
                debug!("[Redis] Connection manager established");
                Ok::<_, anyhow::Error>(manager)
            })
            .await?;
        Ok(manager.clone())
    }

    /// Await a Redis command under the command timeout
    async fn run<T>(&self, command: &'static str, fut: impl Future<Output = RedisResult<T>>) -> Result<T> {
        tokio::time::timeout(self.command_timeout, fut)
            .await
            .map_err(|_| anyhow!("Redis {command} timed out after {:?}", self.command_timeout))?
            .with_context(|| format!("Redis {command} failed"))
    }

    fn tag_key(tag: &str) -> String {
        format!("{TAG_PREFIX}{tag}")
    }

    /// Scan for cache entries only; tag membership sets are bookkeeping, not entries
    async fn scan_entries(&self, pattern: &str) -> Result<Vec<String>> {
        let mut keys = self.scan_keys(&wildcard_glob(pattern)).await?;
        keys.retain(|key| !is_tag_set(key));
        Ok(keys)
    }

    fn millis(ttl: Duration) -> u64 {
        u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
    }

    /// Scan keys matching a Redis glob
    ///
    /// Uses SCAN (non-blocking, cursor-based) rather than KEYS.
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis command fails.
    pub async fn scan_keys(&self, glob: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = self
                .run(
                    "SCAN",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(glob)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn),
                )
                .await?;

            cursor = next;
            keys.extend(batch);

            // Cursor 0 means iteration is complete
            if cursor == 0 {
                break;
            }
        }

        debug!(pattern = %glob, count = keys.len(), "[Redis] Scanned keys matching pattern");
        Ok(keys)
    }

    /// Remove multiple keys at once (bulk delete)
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis command fails.
    pub async fn remove_bulk(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection().await?;
        let mut removed = 0;
        for chunk in keys.chunks(DELETE_BATCH) {
            let count: usize = self.run("DEL", conn.del(chunk)).await?;
            removed += count;
        }
        debug!(count = removed, "[Redis] Removed keys in bulk");
        Ok(removed)
    }
}

// ===== Trait Implementations =====

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        let value: Option<Vec<u8>> = self.run("GET", conn.get(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration, tags: &[String]) -> Result<()> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(Self::millis(ttl))
            .ignore();
        for tag in tags {
            pipe.cmd("SADD").arg(Self::tag_key(tag)).arg(key).ignore();
        }

        let (): () = self.run("SET", pipe.query_async(&mut conn)).await?;
        debug!(key = %key, ttl_secs = ttl.as_secs(), tags = tags.len(), "[Redis] Cached key with TTL");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let removed: usize = self.run("DEL", conn.del(key)).await?;
        Ok(removed > 0)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        self.remove_bulk(keys).await
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let values: Vec<Option<Vec<u8>>> = self
            .run("MGET", redis::cmd("MGET").arg(keys).query_async(&mut conn))
            .await?;
        Ok(values)
    }

    async fn set_many(&self, entries: &[(String, Vec<u8>)], ttl: Duration) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        for (key, value) in entries {
            pipe.cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(Self::millis(ttl))
                .ignore();
        }
        let (): () = self.run("SET", pipe.query_async(&mut conn)).await?;
        debug!(count = entries.len(), ttl_secs = ttl.as_secs(), "[Redis] Cached keys in bulk");
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        self.scan_entries(pattern).await
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize> {
        let keys = self.scan_entries(pattern).await?;
        self.remove_bulk(&keys).await
    }

    async fn delete_tag(&self, tag: &str) -> Result<usize> {
        let tag_key = Self::tag_key(tag);
        let mut conn = self.connection().await?;
        let members: Vec<String> = self.run("SMEMBERS", conn.smembers(&tag_key)).await?;
        let removed = self.remove_bulk(&members).await?;
        let _: usize = self.run("DEL", conn.del(&tag_key)).await?;
        debug!(tag = %tag, members = members.len(), count = removed, "[Redis] Removed tagged keys");
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let exists: bool = self.run("EXISTS", conn.exists(key)).await?;
        Ok(exists)
    }

    async fn increment(&self, key: &str, amount: i64) -> Result<i64> {
        let mut conn = self.connection().await?;
        let value: i64 = self.run("INCRBY", conn.incr(key, amount)).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let updated: bool = self
            .run(
                "PEXPIRE",
                redis::cmd("PEXPIRE")
                    .arg(key)
                    .arg(Self::millis(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(updated)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let mut conn = self.connection().await?;
        // -2 = key doesn't exist, -1 = no expiry
        let millis: i64 = self
            .run("PTTL", redis::cmd("PTTL").arg(key).query_async(&mut conn))
            .await?;
        Ok(match millis {
            -2 => KeyTtl::Missing,
            ms if ms < 0 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(Duration::from_millis(ms.unsigned_abs())),
        })
    }

    async fn flush(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let (): () = self
            .run("FLUSHDB", redis::cmd("FLUSHDB").query_async(&mut conn))
            .await?;
        warn!("[Redis] Flushed database");
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        let mut conn = self.connection().await?;
        let receivers: usize = self.run("PUBLISH", conn.publish(channel, message)).await?;
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        let mut pubsub = tokio::time::timeout(self.command_timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| anyhow!("Redis Pub/Sub connect timed out after {:?}", self.command_timeout))?
            .context("Failed to get pubsub connection")?;

        pubsub
            .subscribe(channel)
            .await
            .with_context(|| format!("Failed to subscribe to channel {channel}"))?;
        info!(channel = %channel, "[Redis] Subscribed to channel");

        let messages = pubsub.into_on_message().filter_map(|msg| {
            let payload = match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!(error = %e, "[Redis] Failed to get message payload");
                    None
                }
            };
            future::ready(payload)
        });
        Ok(messages.boxed())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = self
            .run("PING", redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}

fn is_tag_set(key: &str) -> bool {
    key.starts_with(TAG_PREFIX)
}
