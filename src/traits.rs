//! Store and Codec Traits
//!
//! - `CacheCodec`: pluggable value serialization
//! - `CacheStore`: the surface shared by the in-process [`LocalStore`](crate::backends::LocalStore)
//!   and the remote [`RedisStore`](crate::backends::RedisStore)
//!
//! The cache service holds one store of each kind and picks between them per call,
//! so both implementations must agree on observable semantics: TTL expiry, tag
//! membership, `*` patterns on the full key, and integer counters.
//!
//! # Example: Custom Store
//!
//! ```rust,ignore
//! use resilient_cache::{CacheStore, KeyTtl, MessageStream, async_trait};
//! use std::time::Duration;
//! use anyhow::Result;
//!
//! struct MyStore { /* ... */ }
//!
//! #[async_trait]
//! impl CacheStore for MyStore {
//!     async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
//!         // ...
//!     }
//!     // ... remaining operations
//! }
//! ```

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use std::fmt::Debug;
use std::time::Duration;

/// Trait for cache value serialization/deserialization
///
/// Serialization failures are local errors: they are never reported to the
/// circuit breaker.
pub trait CacheCodec: Send + Sync + Debug {
    /// Serialize a value to bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented by this codec.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize bytes to a value
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid encoding of `T`.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Codec name, for logging
    fn name(&self) -> &'static str;
}

/// Remaining lifetime of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist (or has expired)
    Missing,
    /// The key exists without an expiry
    Persistent,
    /// The key expires after this duration
    Expires(Duration),
}

impl KeyTtl {
    /// Redis-style seconds: `-2` missing, `-1` persistent
    pub fn as_secs(&self) -> i64 {
        match self {
            Self::Missing => -2,
            Self::Persistent => -1,
            Self::Expires(remaining) => i64::try_from(remaining.as_secs()).unwrap_or(i64::MAX),
        }
    }
}

impl Serialize for KeyTtl {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.as_secs())
    }
}

/// Stream of raw Pub/Sub payloads for one channel
pub type MessageStream = BoxStream<'static, String>;

/// Storage engine behind the cache service
///
/// Values are opaque bytes; keys are full keys (namespace already applied).
/// Implementations must be `Send + Sync`; the service shares one instance across
/// every concurrent caller.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Value for `key`, `None` if absent or expired
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` for `ttl`, recording membership in every tag in `tags`
    async fn set(&self, key: &str, value: &[u8], ttl: Duration, tags: &[String]) -> Result<()>;

    /// Remove `key`; `true` if a live entry was removed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remove several keys; returns how many live entries were removed
    async fn delete_many(&self, keys: &[String]) -> Result<usize>;

    /// Values for `keys`, positionally
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

    /// Store several values sharing one TTL
    async fn set_many(&self, entries: &[(String, Vec<u8>)], ttl: Duration) -> Result<()>;

    /// Live keys matching a `*` wildcard pattern
    async fn scan(&self, pattern: &str) -> Result<Vec<String>>;

    /// Remove every key matching a `*` wildcard pattern
    async fn delete_pattern(&self, pattern: &str) -> Result<usize>;

    /// Remove every entry tagged with `tag`, along with the tag's membership record
    async fn delete_tag(&self, tag: &str) -> Result<usize>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Add `amount` to the integer stored at `key`; an absent key counts as 0
    async fn increment(&self, key: &str, amount: i64) -> Result<i64>;

    /// Subtract `amount` from the integer stored at `key`
    async fn decrement(&self, key: &str, amount: i64) -> Result<i64> {
        let delta = amount
            .checked_neg()
            .ok_or_else(|| anyhow!("decrement amount {amount} out of range"))?;
        self.increment(key, delta).await
    }

    /// Set a new TTL on an existing key; `false` if the key is absent
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    /// Remove everything
    async fn flush(&self) -> Result<()>;

    /// Publish a message; returns the number of receivers
    async fn publish(&self, channel: &str, message: &str) -> Result<usize>;

    /// Subscribe to a channel
    async fn subscribe(&self, channel: &str) -> Result<MessageStream>;

    /// Lightweight liveness check
    async fn ping(&self) -> Result<()>;

    async fn health_check(&self) -> bool {
        self.ping().await.is_ok()
    }

    fn name(&self) -> &'static str {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ttl_redis_convention() {
        assert_eq!(KeyTtl::Missing.as_secs(), -2);
        assert_eq!(KeyTtl::Persistent.as_secs(), -1);
        assert_eq!(KeyTtl::Expires(Duration::from_millis(4500)).as_secs(), 4);
        assert_eq!(
            serde_json::to_string(&KeyTtl::Expires(Duration::from_secs(30))).unwrap(),
            "30"
        );
    }
}
