//! Result cache used by the compute pipeline.
//!
//! ## Architecture
//!
//! - **Local**: in-memory DashMap with per-entry TTL, per process
//! - **Redis**: shared cache with a local L1 in front of it
//!
//! ## Graceful Degradation
//!
//! If Redis is disabled or unreachable at startup the backend falls back to
//! local-only mode. Errors after startup surface as [`CacheError::Unavailable`],
//! which callers treat as a miss.

pub mod backend;

use async_trait::async_trait;
use std::time::Duration;

pub use backend::{CacheBackend, CacheStats, CachedEntry};

/// Errors surfaced by a cache gateway.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Typed façade over a key/value cache with expiry.
///
/// Absence and "stored but expired" are indistinguishable to callers.
#[async_trait]
pub trait CacheGateway: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
}
