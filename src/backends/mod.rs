//! Cache Store Implementations
//!
//! # Available Backends
//!
//! - **`LocalStore`** - in-process `DashMap` table; fallback tier, or the only tier when
//!   the remote store is disabled
//! - **`RedisStore`** - shared Redis server; primary tier, always called through the
//!   circuit breaker
//!
//! Both implement [`CacheStore`](crate::traits::CacheStore) with the same observable
//! semantics, so the cache service can switch between them per call.

mod local_store;
mod redis_store;

pub use local_store::LocalStore;
pub use redis_store::RedisStore;
