//! Entity cache module - in-memory cache in front of the local mirror
//!
//! Mirrored orders and calls are read far more often than they are written
//! (every screen render vs. background refresh / conflict resolution), so
//! reads go through a small moka cache:
//! - LRU eviction
//! - TTL / TTI expiration
//! - Hit / miss statistics

use crate::sync::models::ReferenceType;
use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Entity cache configuration
pub struct EntityCacheConfig {
    /// Maximum number of entities to cache
    pub max_capacity: u64,

    /// Time-to-live for cached entities (in seconds)
    pub ttl_secs: u64,

    /// Time-to-idle for cached entities (in seconds)
    pub tti_secs: u64,
}

impl Default for EntityCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 1000,
            ttl_secs: 1800,
            tti_secs: 600,
        }
    }
}

type EntityKey = (ReferenceType, i64);

/// Cache of mirrored server records, keyed by entity kind and id
#[derive(Clone)]
pub struct EntityCache {
    cache: Arc<Cache<EntityKey, serde_json::Value>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::with_config(EntityCacheConfig::default())
    }

    pub fn with_config(config: EntityCacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(Duration::from_secs(config.ttl_secs))
            .time_to_idle(Duration::from_secs(config.tti_secs))
            .build();

        Self {
            cache: Arc::new(cache),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn get(&self, reference_type: ReferenceType, id: i64) -> Option<serde_json::Value> {
        match self.cache.get(&(reference_type, id)).await {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn insert(&self, reference_type: ReferenceType, id: i64, value: serde_json::Value) {
        self.cache.insert((reference_type, id), value).await;
    }

    pub async fn remove(&self, reference_type: ReferenceType, id: i64) {
        self.cache.invalidate(&(reference_type, id)).await;
    }

    /// Clear all cached entities
    pub async fn clear(&self) {
        self.cache.invalidate_all();
        // Wait for invalidation to complete
        self.cache.run_pending_tasks().await;
    }

    pub async fn stats(&self) -> CacheStats {
        self.cache.run_pending_tasks().await;

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total_requests = hits + misses;
        let hit_rate = if total_requests > 0 {
            (hits as f64 / total_requests as f64) * 100.0
        } else {
            0.0
        };

        CacheStats {
            hits,
            misses,
            total_requests,
            hit_rate,
            entry_count: self.cache.entry_count(),
        }
    }
}

impl Default for EntityCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache statistics
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    pub hit_rate: f64,
    pub entry_count: u64,
}
