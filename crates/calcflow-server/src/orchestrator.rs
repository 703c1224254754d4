//! Cache-aside compute pipeline.
//!
//! Per request the order is fixed:
//!
//! 1. domain check (nothing invalid reaches the cache or the audit store)
//! 2. cache lookup
//! 3. on a miss: compute, then audit, then cache write
//! 4. publish the event
//!
//! Only audit failures fail a request. Cache errors degrade to the compute
//! path and publish errors are logged and counted.

use calcflow_core::{
    DomainError, Event, Operation, OperationRequest, OperationResult, Origin, ResultValue,
    ValidationError, compute,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::audit::{AuditError, AuditFilter, AuditRecord, AuditStore, NewAuditRecord};
use crate::broker::BrokerConnection;
use crate::cache::CacheGateway;
use crate::config::AppConfig;
use crate::identity::{AuthError, IdentityVerifier};
use crate::metrics;

/// Pipeline knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub cache_ttl: Duration,
    pub topic: String,
    /// Publish an event when a request is served from cache
    pub publish_cache_hits: bool,
    /// Write an audit record when a request is served from cache
    pub audit_cache_hits: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(3600),
            topic: "operation_stream".to_string(),
            publish_cache_hits: true,
            audit_cache_hits: false,
        }
    }
}

impl From<&AppConfig> for OrchestratorSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            cache_ttl: config.cache.ttl(),
            topic: config.broker.topic.clone(),
            publish_cache_hits: config.cache.publish_hits,
            audit_cache_hits: config.cache.audit_hits,
        }
    }
}

/// Request-level failures.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("requester '{0}' is not registered")]
    UnknownRequester(String),

    #[error("audit write failed: {0}")]
    Audit(#[source] AuditError),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
}

impl From<AuditError> for ExecuteError {
    fn from(err: AuditError) -> Self {
        match err {
            AuditError::IdentityNotFound(requester) => Self::UnknownRequester(requester),
            other => Self::Audit(other),
        }
    }
}

pub struct ComputeOrchestrator {
    cache: Arc<dyn CacheGateway>,
    audit: Arc<dyn AuditStore>,
    broker: Arc<BrokerConnection>,
    identity: Arc<dyn IdentityVerifier>,
    settings: OrchestratorSettings,
}

impl ComputeOrchestrator {
    pub fn new(
        cache: Arc<dyn CacheGateway>,
        audit: Arc<dyn AuditStore>,
        broker: Arc<BrokerConnection>,
        identity: Arc<dyn IdentityVerifier>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            cache,
            audit,
            broker,
            identity,
            settings,
        }
    }

    /// Resolve `token` to a requester, validate `operation` and execute it.
    pub async fn execute_with_token(
        &self,
        token: &str,
        operation: Operation,
    ) -> Result<OperationResult, ExecuteError> {
        let requester = self.identity.resolve(token)?;
        let request = OperationRequest::new(operation, requester.0)?;
        self.execute(request).await
    }

    #[instrument(skip_all, fields(operation = %request.operation, requester = %request.requester))]
    pub async fn execute(&self, request: OperationRequest) -> Result<OperationResult, ExecuteError> {
        let OperationRequest {
            operation,
            requester,
        } = request;
        let kind = operation.kind();

        operation.check_domain()?;

        let key = operation.cache_key();
        if let Some(value) = self.cached_value(&operation, &key).await {
            metrics::record_cache_hit(kind.as_str());
            debug!(key = %key, "Cache hit");

            let result = OperationResult::new(operation, value, Origin::Cache);
            if self.settings.audit_cache_hits {
                self.audit(&result, &requester).await?;
            }
            if self.settings.publish_cache_hits {
                self.publish(&result, &requester).await;
            }
            return Ok(result);
        }
        metrics::record_cache_miss(kind.as_str());

        let value = compute(&operation)?;
        metrics::record_computation(kind.as_str());
        let result = OperationResult::new(operation, value, Origin::Computed);

        self.audit(&result, &requester).await?;

        if let Err(e) = self
            .cache
            .set(&key, &result.value.encode(), self.settings.cache_ttl)
            .await
        {
            metrics::record_cache_error("set");
            warn!(key = %key, error = %e, "Cache write failed, result not cached");
        }

        self.publish(&result, &requester).await;

        info!(result = %result.value, "Operation computed");
        Ok(result)
    }

    /// Audit records matching `filter`, newest first.
    pub async fn history(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, ExecuteError> {
        Ok(self.audit.list_records(filter).await?)
    }

    /// Cached value for `key`, or `None` on a miss, a cache outage or an
    /// undecodable entry.
    async fn cached_value(&self, operation: &Operation, key: &str) -> Option<ResultValue> {
        let raw = match self.cache.get(key).await {
            Ok(raw) => raw?,
            Err(e) => {
                metrics::record_cache_error("get");
                warn!(key = %key, error = %e, "Cache unavailable, computing");
                return None;
            }
        };

        match ResultValue::decode(operation.kind(), &raw) {
            Ok(value) => Some(value),
            Err(e) => {
                metrics::record_cache_error("decode");
                warn!(key = %key, error = %e, "Ignoring undecodable cache entry");
                None
            }
        }
    }

    async fn audit(&self, result: &OperationResult, requester: &str) -> Result<(), ExecuteError> {
        let record = NewAuditRecord {
            operation: result.operation.kind(),
            input_repr: result.operation.input_repr(),
            result_repr: result.value.encode(),
            requester: requester.to_string(),
        };

        match self.audit.insert_record(record).await {
            Ok(stored) => {
                metrics::record_audit_write("ok");
                debug!(audit_id = stored.id, "Audit record written");
                Ok(())
            }
            Err(e) => {
                metrics::record_audit_write(if e.is_identity_not_found() {
                    "unknown_requester"
                } else {
                    "error"
                });
                warn!(error = %e, "Audit write failed");
                Err(e.into())
            }
        }
    }

    async fn publish(&self, result: &OperationResult, requester: &str) {
        let event = Event::from_result(result, requester);
        let topic = &self.settings.topic;

        if let Err(e) = self.broker.send(topic, &event).await {
            metrics::record_publish_failure(topic);
            warn!(topic = %topic, error = %e, "Event publish failed");
        }
    }
}
