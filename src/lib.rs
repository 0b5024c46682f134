//! Resilient Cache
//!
//! A cache service that keeps working when its remote tier does not:
//! - **Circuit Breaker**: windowed failure counting, volume threshold, half-open probing
//! - **Breaker Registry**: one named breaker per dependency per process
//! - **Remote Store**: Redis via `ConnectionManager`, every call guarded by the breaker
//! - **Local Store**: in-process fallback with TTL, tags, patterns and counters
//! - **Fallback Mode**: switches to the Local Store on remote failure, back on recovery
//! - **Invalidation**: tag and pattern deletes, broadcast to other processes via Pub/Sub
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use resilient_cache::{CacheConfig, CacheServiceBuilder, CacheStrategy, SetOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = CacheServiceBuilder::new()
//!         .config(CacheConfig::from_env()?)
//!         .build()
//!         .await?;
//!
//!     let options = SetOptions::new()
//!         .strategy(CacheStrategy::ShortTerm)
//!         .namespace("users")
//!         .tag("profiles");
//!     cache.set("1", &serde_json::json!({"name": "alice"}), &options).await;
//!
//!     let user: Option<serde_json::Value> = cache.get("1", Some("users")).await;
//!     tracing::info!(?user, "Cached user");
//!
//!     cache.invalidate_tag("profiles").await;
//!
//!     let stats = cache.get_statistics();
//!     tracing::info!("Hit rate: {:.2}", stats.hit_rate);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! Caller → CacheService ─ mode=remote ─→ CircuitBreaker → RedisStore
//!                      └─ mode=local ──→ LocalStore
//!          RedisStore Pub/Sub ─→ invalidation listener ─→ LocalStore
//! ```

pub mod admin;
pub mod backends;
pub mod builder;
pub mod cache_service;
pub mod circuit_breaker;
pub mod codecs;
pub mod config;
pub mod error;
pub mod invalidation;
pub mod keys;
pub mod pubsub;
pub mod registry;
pub mod traits;

pub use admin::{AdminReport, AdminStatistics, BreakerSummary, CacheAdmin};
pub use backends::{LocalStore, RedisStore};
pub use builder::CacheServiceBuilder;
pub use cache_service::{CacheMode, CacheService, CacheStatistics, CacheStrategy, SetOptions};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerEvent, CircuitBreakerStats,
    CircuitState,
};
pub use codecs::JsonCodec;
pub use config::{CacheConfig, REMOTE_BREAKER_NAME};
pub use error::ConfigError;
pub use invalidation::{InvalidationConfig, InvalidationEnvelope, InvalidationMessage, InvalidationStats};
pub use pubsub::Subscription;
pub use registry::{CircuitBreakerOverrides, CircuitBreakerRegistry};
pub use traits::{CacheCodec, CacheStore, KeyTtl, MessageStream};

// Re-export async_trait for users implementing custom stores
pub use async_trait::async_trait;
