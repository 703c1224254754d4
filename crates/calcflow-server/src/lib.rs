pub mod audit;
pub mod broker;
pub mod cache;
pub mod config;
pub mod identity;
pub mod ingest;
pub mod metrics;
pub mod observability;
pub mod orchestrator;
pub mod runtime;

pub use audit::{AuditError, AuditFilter, AuditRecord, AuditStore, MemoryAuditStore, PostgresAuditStore};
pub use broker::{
    BrokerConnection, BrokerError, BrokerTransport, ConnectionState, MemoryBroker, RedisTransport,
    RetryPolicy,
};
pub use cache::{CacheBackend, CacheError, CacheGateway, CachedEntry};
pub use config::{AppConfig, RedisConfig};
pub use identity::{AuthError, IdentityVerifier, JwtIdentityVerifier, Requester};
pub use ingest::{EventIngestLoop, IngestError, IngestHandle, IngestShutdown, ingest_message};
pub use observability::init_tracing;
pub use orchestrator::{ComputeOrchestrator, ExecuteError, OrchestratorSettings};
pub use runtime::{RuntimeError, ServiceRuntime};

/// Create a cache backend based on configuration.
///
/// ## Cache Modes
///
/// - **Redis disabled**: Returns local-only cache (DashMap)
/// - **Redis enabled**: Attempts to connect to Redis, falls back to local on failure
///
/// ## Graceful Degradation
///
/// If Redis connection fails, the process keeps running with a local-only
/// cache; results are then not shared between instances.
pub async fn create_cache_backend(config: &RedisConfig) -> CacheBackend {
    use std::time::Duration;

    if !config.enabled {
        tracing::info!("Redis disabled, using local cache only");
        return CacheBackend::new_local();
    }

    tracing::info!(url = %config.url, "Connecting to Redis cache");

    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    if let Some(ref mut pool_config) = redis_config.pool {
        pool_config.max_size = config.pool_size;
        pool_config.timeouts.wait = Some(Duration::from_millis(config.timeout_ms));
        pool_config.timeouts.create = Some(Duration::from_millis(config.timeout_ms));
        pool_config.timeouts.recycle = Some(Duration::from_millis(config.timeout_ms));
    }

    let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to local cache."
            );
            return CacheBackend::new_local();
        }
    };

    match pool.get().await {
        Ok(_) => {
            tracing::info!("Connected to Redis cache");
            CacheBackend::new_redis(pool)
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to connect to Redis. Falling back to local cache."
            );
            CacheBackend::new_local()
        }
    }
}
