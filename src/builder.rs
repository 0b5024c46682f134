//! Cache Service Builder
//!
//! Wires configuration, the breaker registry, both stores and the codec into a
//! [`CacheService`], then starts its background tasks.
//!
//! # Example: Redis with local fallback
//!
//! ```rust,no_run
//! use resilient_cache::{CacheConfig, CacheServiceBuilder};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = CacheServiceBuilder::new()
//!         .config(CacheConfig::from_env()?)
//!         .build()
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! # Example: Custom remote store
//!
//! ```rust,ignore
//! use resilient_cache::CacheServiceBuilder;
//! use std::sync::Arc;
//!
//! let cache = CacheServiceBuilder::new()
//!     .with_remote(Arc::new(MyStore::new()))
//!     .build()
//!     .await?;
//! ```

use crate::backends::{LocalStore, RedisStore};
use crate::cache_service::{CacheMode, CacheService};
use crate::codecs::JsonCodec;
use crate::config::CacheConfig;
use crate::registry::CircuitBreakerRegistry;
use crate::traits::{CacheCodec, CacheStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Builder for [`CacheService`]
///
/// # Default Behavior
///
/// - **Config**: [`CacheConfig::default`] (Redis at `127.0.0.1:6379`, fallback enabled)
/// - **Registry**: a fresh [`CircuitBreakerRegistry`]
/// - **Local Store**: a fresh [`LocalStore`]
/// - **Remote**: a [`RedisStore`] for `config.redis_url`, unless `remote_enabled` is off
/// - **Codec**: [`JsonCodec`]
pub struct CacheServiceBuilder<C = JsonCodec> {
    config: CacheConfig,
    registry: Option<Arc<CircuitBreakerRegistry>>,
    local: Option<Arc<LocalStore>>,
    remote: Option<Arc<dyn CacheStore>>,
    codec: C,
}

impl CacheServiceBuilder<JsonCodec> {
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
            registry: None,
            local: None,
            remote: None,
            codec: JsonCodec,
        }
    }
}

impl Default for CacheServiceBuilder<JsonCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: CacheCodec + 'static> CacheServiceBuilder<C> {
    #[must_use]
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a process-wide registry instead of creating one
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<CircuitBreakerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn with_local(mut self, local: Arc<LocalStore>) -> Self {
        self.local = Some(local);
        self
    }

    /// Use `store` as the remote tier instead of connecting to `config.redis_url`
    ///
    /// Ignored when `remote_enabled` is off.
    #[must_use]
    pub fn with_remote(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.remote = Some(store);
        self
    }

    #[must_use]
    pub fn with_codec<D: CacheCodec + 'static>(self, codec: D) -> CacheServiceBuilder<D> {
        CacheServiceBuilder {
            config: self.config,
            registry: self.registry,
            local: self.local,
            remote: self.remote,
            codec,
        }
    }

    /// Build the service and start its background tasks
    ///
    /// An unreachable remote store does not fail the build: the service starts in
    /// fallback mode (when enabled) and the recovery probe keeps checking.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the Redis URL cannot be parsed.
    pub async fn build(self) -> Result<CacheService<C>> {
        let config = self.config;
        config.validate().context("Invalid cache configuration")?;

        let remote: Option<Arc<dyn CacheStore>> = if config.remote_enabled {
            match self.remote {
                Some(store) => Some(store),
                None => {
                    let redis = RedisStore::new(&config.redis_url, config.command_timeout)?;
                    Some(Arc::new(redis) as Arc<dyn CacheStore>)
                }
            }
        } else {
            None
        };

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(CircuitBreakerRegistry::new(config.breaker.clone())));
        let local = self.local.unwrap_or_else(|| Arc::new(LocalStore::new()));
        let fallback_to_local = config.fallback_to_local;

        let service = CacheService::from_parts(config, local, remote, registry, self.codec);

        if service.mode() == CacheMode::Remote {
            if service.health_check().await {
                info!("Remote cache reachable");
            } else if fallback_to_local {
                warn!("Remote cache unreachable at startup, starting in fallback mode");
            } else {
                warn!("Remote cache unreachable at startup and fallback is disabled");
            }
        }

        service.start_background();
        info!(mode = %service.mode(), "Cache Service ready");
        Ok(service)
    }
}
