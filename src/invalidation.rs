//! Cross-process cache invalidation
//!
//! When one process deletes entries it broadcasts an [`InvalidationMessage`] on a
//! shared channel. Every other process applies the same removal to its own Local
//! Store so fallback copies converge. Delivery is best-effort (at-most-once).
//!
//! Messages travel as JSON with a `type` tag and the sender's `origin` id:
//!
//! ```json
//! {"origin":"5f0c…","type":"remove_pattern","pattern":"user:*"}
//! ```

use crate::traits::CacheStore;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Invalidation message types sent across cache instances
///
/// Keys and patterns are full keys (namespace already applied).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvalidationMessage {
    /// Remove a single key from all cache instances
    Remove { key: String },

    /// Bulk remove multiple keys at once
    RemoveBulk { keys: Vec<String> },

    /// Remove all keys matching a `*` wildcard pattern (e.g. `user:*`)
    RemovePattern { pattern: String },

    /// Remove every entry carrying a tag
    RemoveTag { tag: String },
}

impl InvalidationMessage {
    pub fn remove(key: impl Into<String>) -> Self {
        Self::Remove { key: key.into() }
    }

    pub fn remove_bulk(keys: Vec<String>) -> Self {
        Self::RemoveBulk { keys }
    }

    pub fn remove_pattern(pattern: impl Into<String>) -> Self {
        Self::RemovePattern {
            pattern: pattern.into(),
        }
    }

    pub fn remove_tag(tag: impl Into<String>) -> Self {
        Self::RemoveTag { tag: tag.into() }
    }

    /// Perform the removal against `store`; returns the number of entries removed
    ///
    /// # Errors
    ///
    /// Propagates the store's error.
    pub async fn apply(&self, store: &dyn CacheStore) -> Result<usize> {
        match self {
            Self::Remove { key } => Ok(usize::from(store.delete(key).await?)),
            Self::RemoveBulk { keys } => store.delete_many(keys).await,
            Self::RemovePattern { pattern } => store.delete_pattern(pattern).await,
            Self::RemoveTag { tag } => store.delete_tag(tag).await,
        }
    }
}

/// A message together with the id of the instance that sent it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEnvelope {
    pub origin: String,
    #[serde(flatten)]
    pub message: InvalidationMessage,
}

impl InvalidationEnvelope {
    pub fn new(origin: impl Into<String>, message: InvalidationMessage) -> Self {
        Self {
            origin: origin.into(),
            message,
        }
    }

    /// Serialize to JSON for transmission
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize invalidation message")
    }

    /// Deserialize from JSON
    ///
    /// # Errors
    ///
    /// Returns an error if `json` is not a valid invalidation message.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize invalidation message")
    }
}

/// Configuration for cache invalidation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationConfig {
    /// Pub/Sub channel name for invalidation messages
    pub channel: String,

    /// Broadcast on every delete, pattern delete and tag invalidation
    pub broadcast_on_delete: bool,

    /// Apply messages from other instances to the Local Store
    pub listen: bool,

    /// Base delay before resubscribing after the channel drops
    pub reconnect_delay: Duration,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            channel: "cache:invalidate".to_string(),
            broadcast_on_delete: true,
            listen: true,
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Statistics for invalidation operations
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidationStats {
    /// Number of invalidation messages published
    pub messages_sent: u64,

    /// Number of messages received from other instances
    pub messages_received: u64,

    pub removes_received: u64,
    pub bulk_removes_received: u64,
    pub patterns_received: u64,
    pub tags_received: u64,

    /// Messages skipped because this instance sent them
    pub own_messages_ignored: u64,

    /// Number of failed message processing attempts
    pub processing_errors: u64,
}

/// Thread-safe statistics for invalidation operations
#[derive(Debug, Default)]
pub struct AtomicInvalidationStats {
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub removes_received: AtomicU64,
    pub bulk_removes_received: AtomicU64,
    pub patterns_received: AtomicU64,
    pub tags_received: AtomicU64,
    pub own_messages_ignored: AtomicU64,
    pub processing_errors: AtomicU64,
}

impl AtomicInvalidationStats {
    /// Count a received message under its kind
    pub fn record_received(&self, message: &InvalidationMessage) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        let counter = match message {
            InvalidationMessage::Remove { .. } => &self.removes_received,
            InvalidationMessage::RemoveBulk { .. } => &self.bulk_removes_received,
            InvalidationMessage::RemovePattern { .. } => &self.patterns_received,
            InvalidationMessage::RemoveTag { .. } => &self.tags_received,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> InvalidationStats {
        InvalidationStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            removes_received: self.removes_received.load(Ordering::Relaxed),
            bulk_removes_received: self.bulk_removes_received.load(Ordering::Relaxed),
            patterns_received: self.patterns_received.load(Ordering::Relaxed),
            tags_received: self.tags_received.load(Ordering::Relaxed),
            own_messages_ignored: self.own_messages_ignored.load(Ordering::Relaxed),
            processing_errors: self.processing_errors.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.messages_sent,
            &self.messages_received,
            &self.removes_received,
            &self.bulk_removes_received,
            &self.patterns_received,
            &self.tags_received,
            &self.own_messages_ignored,
            &self.processing_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::LocalStore;

    #[test]
    fn test_envelope_wire_format() {
        let envelope = InvalidationEnvelope::new("node-a", InvalidationMessage::remove_pattern("user:*"));
        let json = envelope.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["origin"], "node-a");
        assert_eq!(value["type"], "remove_pattern");
        assert_eq!(value["pattern"], "user:*");

        let parsed = InvalidationEnvelope::from_json(&json).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_rejects_unknown_type() {
        let result = InvalidationEnvelope::from_json(r#"{"origin":"x","type":"update","key":"k"}"#);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_apply_to_local_store() {
        let store = LocalStore::new();
        let ttl = Duration::from_secs(60);
        let tags = vec!["users".to_string()];
        store.set("user:1", b"1", ttl, &tags).await.unwrap();
        store.set("user:2", b"2", ttl, &[]).await.unwrap();
        store.set("session:1", b"s", ttl, &[]).await.unwrap();
        store.set("other", b"o", ttl, &tags).await.unwrap();

        let removed = InvalidationMessage::remove_tag("users").apply(&store).await.unwrap();
        assert_eq!(removed, 2);

        let removed = InvalidationMessage::remove_pattern("user:*").apply(&store).await.unwrap();
        assert_eq!(removed, 1);

        let removed = InvalidationMessage::remove("session:1").apply(&store).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_stats_by_kind() {
        let stats = AtomicInvalidationStats::default();
        stats.record_received(&InvalidationMessage::remove("a"));
        stats.record_received(&InvalidationMessage::remove_tag("t"));
        stats.record_received(&InvalidationMessage::remove_bulk(vec!["a".into(), "b".into()]));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.messages_received, 3);
        assert_eq!(snapshot.removes_received, 1);
        assert_eq!(snapshot.tags_received, 1);
        assert_eq!(snapshot.bulk_removes_received, 1);
        assert_eq!(snapshot.patterns_received, 0);

        stats.reset();
        assert_eq!(stats.snapshot(), InvalidationStats::default());
    }
}
