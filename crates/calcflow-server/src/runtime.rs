//! Process wiring: bootstrap in dependency order, ordered shutdown.

use calcflow_core::EventRing;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::audit::{AuditError, AuditStore, MemoryAuditStore, PostgresAuditStore, create_pool};
use crate::broker::{BrokerConnection, BrokerError, BrokerTransport, MemoryBroker, RedisTransport};
use crate::cache::CacheBackend;
use crate::config::{AppConfig, AuditBackend, BrokerKind};
use crate::identity::JwtIdentityVerifier;
use crate::ingest::{EventIngestLoop, IngestError, IngestHandle, IngestShutdown};
use crate::orchestrator::{ComputeOrchestrator, OrchestratorSettings};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("audit store setup failed: {0}")]
    Audit(#[from] AuditError),

    #[error("broker startup failed: {0}")]
    Broker(#[from] BrokerError),

    #[error("event ingest loop is already running")]
    IngestRunning,

    #[error(transparent)]
    Ingest(#[from] IngestError),
}

/// All long-lived components of one process.
pub struct ServiceRuntime {
    config: AppConfig,
    cache: Arc<CacheBackend>,
    audit: Arc<dyn AuditStore>,
    identity: Arc<JwtIdentityVerifier>,
    broker: Arc<BrokerConnection>,
    orchestrator: Arc<ComputeOrchestrator>,
    ring: Arc<EventRing>,
    ingest: Mutex<Option<IngestHandle>>,
}

impl ServiceRuntime {
    /// Build every component from `config` and start the broker connection.
    ///
    /// A broker that stays unreachable after all retry attempts aborts the
    /// bootstrap.
    pub async fn bootstrap(config: &AppConfig) -> Result<Self, RuntimeError> {
        let transport: Arc<dyn BrokerTransport> = match config.broker.kind {
            BrokerKind::Redis => Arc::new(RedisTransport::new(
                config.broker.url.clone(),
                Duration::from_millis(config.redis.timeout_ms),
            )),
            BrokerKind::Memory => Arc::new(MemoryBroker::new()),
        };
        Self::bootstrap_with_transport(config, transport).await
    }

    /// Like [`bootstrap`](Self::bootstrap) with an explicit broker transport.
    pub async fn bootstrap_with_transport(
        config: &AppConfig,
        transport: Arc<dyn BrokerTransport>,
    ) -> Result<Self, RuntimeError> {
        config.validate().map_err(RuntimeError::Config)?;

        let cache = Arc::new(crate::create_cache_backend(&config.redis).await);

        let audit: Arc<dyn AuditStore> = match config.audit.backend {
            AuditBackend::Memory => {
                info!("Using in-memory audit store");
                Arc::new(MemoryAuditStore::new())
            }
            AuditBackend::Postgres => {
                let url = config.audit.url.as_deref().ok_or_else(|| {
                    RuntimeError::Config("audit.url is required for the postgres backend".into())
                })?;
                let store = PostgresAuditStore::new(create_pool(url, config.audit.pool_size).await?);
                store.init_schema().await?;
                Arc::new(store)
            }
        };

        let identity = Arc::new(JwtIdentityVerifier::new(
            &config.auth.jwt_secret,
            config.auth.token_ttl(),
        ));

        let broker = Arc::new(BrokerConnection::new(
            transport,
            config.broker.retry_policy(),
            config.broker.drain_timeout(),
        ));
        broker.start().await?;

        let orchestrator = Arc::new(ComputeOrchestrator::new(
            cache.clone(),
            audit.clone(),
            broker.clone(),
            identity.clone(),
            OrchestratorSettings::from(config),
        ));

        let ring = Arc::new(EventRing::new(config.events.buffer_capacity));

        info!(
            cache = %cache.stats().mode,
            broker = ?broker,
            ring_capacity = ring.capacity(),
            "Service runtime ready"
        );

        Ok(Self {
            config: config.clone(),
            cache,
            audit,
            identity,
            broker,
            orchestrator,
            ring,
            ingest: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheBackend> {
        &self.cache
    }

    pub fn audit(&self) -> &Arc<dyn AuditStore> {
        &self.audit
    }

    pub fn identity(&self) -> &Arc<JwtIdentityVerifier> {
        &self.identity
    }

    pub fn broker(&self) -> &Arc<BrokerConnection> {
        &self.broker
    }

    pub fn orchestrator(&self) -> &Arc<ComputeOrchestrator> {
        &self.orchestrator
    }

    pub fn ring(&self) -> &Arc<EventRing> {
        &self.ring
    }

    /// Spawn the single event ingest loop.
    pub async fn start_ingest(&self) -> Result<(), RuntimeError> {
        let ring = self.ring.clone();
        self.start_ingest_with(move |message| {
            crate::ingest::ingest_message(&ring, message);
        })
        .await
    }

    async fn start_ingest_with<F>(&self, handler: F) -> Result<(), RuntimeError>
    where
        F: FnMut(Map<String, Value>) + Send + 'static,
    {
        let mut slot = self.ingest.lock().await;
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(RuntimeError::IngestRunning);
        }

        let handle = EventIngestLoop::new(
            self.broker.clone(),
            self.ring.clone(),
            self.config.broker.topic.clone(),
        )
        .spawn_with(handler);
        *slot = Some(handle);
        Ok(())
    }

    /// Wait until the ingest loop ends on its own.
    ///
    /// Resolves with the loop's error if its subscription could not be kept
    /// alive, and immediately if no loop was started. Cancel safe.
    pub async fn ingest_finished(&self) -> Result<(), RuntimeError> {
        let mut slot = self.ingest.lock().await;
        match slot.as_mut() {
            Some(handle) => Ok(handle.finished().await?),
            None => Ok(()),
        }
    }

    /// Cancel ingestion, wait for it with a timeout, then stop the broker.
    ///
    /// Returns how the ingest loop ended, if one was running.
    pub async fn shutdown(&self) -> Option<IngestShutdown> {
        info!("Shutting down service runtime");

        let outcome = match self.ingest.lock().await.take() {
            Some(handle) => {
                let outcome = handle.shutdown(self.config.events.shutdown_timeout()).await;
                match &outcome {
                    IngestShutdown::Clean => info!("Event ingest loop stopped"),
                    IngestShutdown::Failed(reason) => {
                        warn!(reason = %reason, "Event ingest loop had already failed")
                    }
                    IngestShutdown::TimedOut => {
                        warn!("Event ingest loop abandoned after shutdown timeout")
                    }
                }
                Some(outcome)
            }
            None => None,
        };

        self.broker.stop().await;
        info!("Service runtime stopped");
        outcome
    }
}
