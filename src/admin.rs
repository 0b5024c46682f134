//! Administrative operations
//!
//! A thin facade for operator tooling (an HTTP admin route, a CLI). Each operation
//! maps onto one Cache Service or registry call and reports the service's own
//! return value.

use crate::cache_service::{CacheService, CacheStatistics};
use crate::circuit_breaker::CircuitState;
use crate::invalidation::InvalidationStats;
use crate::traits::CacheCodec;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

/// Outcome of an administrative operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdminReport {
    pub success: bool,
    /// Entries (or breakers) affected
    pub affected: usize,
}

impl AdminReport {
    fn count(affected: usize) -> Self {
        Self {
            success: true,
            affected,
        }
    }
}

/// Serializable view of one breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSummary {
    pub state: CircuitState,
    pub failures: u64,
    pub successes: u64,
    pub total_requests: u64,
}

/// Everything an operator dashboard shows
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdminStatistics {
    pub cache: CacheStatistics,
    pub breakers: BTreeMap<String, BreakerSummary>,
    pub invalidation: InvalidationStats,
    pub local_entries: usize,
}

pub struct CacheAdmin<C: CacheCodec> {
    cache: CacheService<C>,
}

impl<C: CacheCodec + 'static> CacheAdmin<C> {
    pub fn new(cache: CacheService<C>) -> Self {
        Self { cache }
    }

    pub fn statistics(&self) -> AdminStatistics {
        let breakers = self
            .cache
            .registry()
            .get_all_stats()
            .into_iter()
            .map(|(name, stats)| {
                let summary = BreakerSummary {
                    state: stats.state,
                    failures: stats.failures,
                    successes: stats.successes,
                    total_requests: stats.total_requests,
                };
                (name, summary)
            })
            .collect();

        AdminStatistics {
            cache: self.cache.get_statistics(),
            breakers,
            invalidation: self.cache.invalidation_stats(),
            local_entries: self.cache.local_store().len(),
        }
    }

    pub async fn health_check(&self) -> AdminReport {
        AdminReport {
            success: self.cache.health_check().await,
            affected: 0,
        }
    }

    /// Remove every key in `namespace`
    pub async fn clear_namespace(&self, namespace: &str) -> AdminReport {
        let removed = self.cache.delete_pattern("*", Some(namespace)).await;
        info!(namespace = %namespace, count = removed, "Admin cleared namespace");
        AdminReport::count(removed)
    }

    pub async fn delete_key(&self, key: &str, namespace: Option<&str>) -> AdminReport {
        let removed = self.cache.delete(key, namespace).await;
        AdminReport {
            success: removed,
            affected: usize::from(removed),
        }
    }

    pub async fn invalidate_tag(&self, tag: &str) -> AdminReport {
        AdminReport::count(self.cache.invalidate_tag(tag).await)
    }

    pub fn reset_statistics(&self) -> AdminReport {
        self.cache.reset_statistics();
        AdminReport::count(0)
    }

    /// Force every registered breaker closed
    pub fn reset_breakers(&self) -> AdminReport {
        AdminReport::count(self.cache.registry().reset_all())
    }
}
