//! Cache backend implementation with L1 (DashMap) and L2 (Redis) tiers.

use async_trait::async_trait;
use dashmap::DashMap;
use deadpool_redis::Pool;
use deadpool_redis::redis::{self, AsyncCommands};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{CacheError, CacheGateway};

/// A cached entry with TTL support.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub data: Arc<str>,
    pub cached_at: Instant,
    pub ttl: Duration,
}

impl CachedEntry {
    /// Create a new cached entry.
    pub fn new(data: &str, ttl: Duration) -> Self {
        Self {
            data: Arc::from(data),
            cached_at: Instant::now(),
            ttl,
        }
    }

    /// Check if this entry has expired.
    pub fn is_expired(&self) -> bool {
        self.cached_at.elapsed() >= self.ttl
    }
}

/// Two-tier cache backend: L1 (DashMap) + optional L2 (Redis).
///
/// ## Cache Modes
///
/// - **Local**: Single-instance mode using only DashMap
/// - **Redis**: Multi-instance mode with DashMap (L1) + Redis (L2)
///
/// Cached results are pure function outputs, so an L1 copy can never
/// disagree with L2; it only ever lives as long as the L2 entry's remaining
/// TTL.
#[derive(Clone)]
pub enum CacheBackend {
    /// Single-instance: local DashMap only
    Local(Arc<DashMap<String, CachedEntry>>),

    /// Multi-instance: Redis + local L1
    Redis {
        redis: Pool,
        local: Arc<DashMap<String, CachedEntry>>,
    },
}

impl CacheBackend {
    /// Create a new local-only cache backend.
    pub fn new_local() -> Self {
        CacheBackend::Local(Arc::new(DashMap::new()))
    }

    /// Create a new Redis-backed cache backend.
    pub fn new_redis(redis_pool: Pool) -> Self {
        CacheBackend::Redis {
            redis: redis_pool,
            local: Arc::new(DashMap::new()),
        }
    }

    fn local(&self) -> &Arc<DashMap<String, CachedEntry>> {
        match self {
            CacheBackend::Local(map) => map,
            CacheBackend::Redis { local, .. } => local,
        }
    }

    fn get_local(&self, key: &str) -> Option<String> {
        let map = self.local();
        if let Some(entry) = map.get(key) {
            if !entry.is_expired() {
                return Some(entry.data.to_string());
            }
            // Remove expired entry
            drop(entry);
            map.remove(key);
        }
        None
    }

    /// Get cache statistics (L1 only).
    pub fn stats(&self) -> CacheStats {
        match self {
            CacheBackend::Local(map) => CacheStats {
                l1_entries: map.len(),
                mode: "local".to_string(),
            },
            CacheBackend::Redis { local, .. } => CacheStats {
                l1_entries: local.len(),
                mode: "redis".to_string(),
            },
        }
    }
}

#[async_trait]
impl CacheGateway for CacheBackend {
    /// ## Lookup Order
    ///
    /// 1. Check L1 (DashMap)
    /// 2. Check L2 (Redis), promoting hits to L1 with the remaining TTL
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        if let Some(value) = self.get_local(key) {
            tracing::debug!(key = %key, "cache hit (L1)");
            return Ok(Some(value));
        }

        let CacheBackend::Redis { redis, local } = self else {
            return Ok(None);
        };

        let mut conn = redis.get().await.map_err(|e| {
            tracing::warn!(error = %e, "Failed to get Redis connection");
            CacheError::Unavailable(e.to_string())
        })?;

        let (value, pttl): (Option<String>, i64) = redis::pipe()
            .get(key)
            .pttl(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                tracing::warn!(key = %key, error = %e, "Redis GET error");
                CacheError::Unavailable(e.to_string())
            })?;

        match value {
            Some(value) => {
                tracing::debug!(key = %key, "cache hit (L2)");
                if pttl > 0 {
                    let ttl = Duration::from_millis(pttl as u64);
                    local.insert(key.to_string(), CachedEntry::new(&value, ttl));
                }
                Ok(Some(value))
            }
            None => {
                tracing::debug!(key = %key, "cache miss");
                Ok(None)
            }
        }
    }

    /// ## Write Strategy
    ///
    /// - **Local mode**: Write to DashMap only
    /// - **Redis mode**: Write to L2 first, then L1
    ///
    /// Writing the same key with the same value repeatedly is benign.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        match self {
            CacheBackend::Local(map) => {
                map.insert(key.to_string(), CachedEntry::new(value, ttl));
                Ok(())
            }
            CacheBackend::Redis { redis, local } => {
                let mut conn = redis.get().await.map_err(|e| {
                    tracing::warn!(error = %e, "Failed to get Redis connection");
                    CacheError::Unavailable(e.to_string())
                })?;

                // SET EX takes whole seconds; never round a short TTL down to zero
                let ttl_secs = ttl.as_secs().max(1);
                conn.set_ex::<_, _, ()>(key, value, ttl_secs)
                    .await
                    .map_err(|e| {
                        tracing::warn!(key = %key, error = %e, "Redis SET error");
                        CacheError::Unavailable(e.to_string())
                    })?;

                local.insert(key.to_string(), CachedEntry::new(value, ttl));
                tracing::debug!(key = %key, ttl_secs = %ttl_secs, "cache set (L1+L2)");
                Ok(())
            }
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub l1_entries: usize,
    pub mode: String,
}
