//! Append-only audit trail of computed operations.
//!
//! Every record references a registered requester. Inserting a record for an
//! unknown requester fails with [`AuditError::IdentityNotFound`] and writes
//! nothing.

mod memory;
mod postgres;

pub use memory::MemoryAuditStore;
pub use postgres::{PgPool, PostgresAuditStore, create_pool};

use async_trait::async_trait;
use calcflow_core::OperationKind;
use serde::Serialize;
use time::OffsetDateTime;

/// Stored identity id of a requester.
pub type RequesterId = i64;

/// A record to append.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditRecord {
    pub operation: OperationKind,
    pub input_repr: String,
    pub result_repr: String,
    pub requester: String,
}

/// A stored audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub id: i64,
    pub operation: OperationKind,
    pub input_repr: String,
    pub result_repr: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub requester: String,
}

/// Filter for listing records. The default lists everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Only records of this requester
    pub requester: Option<String>,
    /// Only records of this operation
    pub operation: Option<OperationKind>,
    /// Maximum number of records returned
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn for_requester(requester: impl Into<String>) -> Self {
        Self {
            requester: Some(requester.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &AuditRecord) -> bool {
        self.requester
            .as_deref()
            .is_none_or(|r| r == record.requester)
            && self.operation.is_none_or(|op| op == record.operation)
    }
}

/// Errors that can occur during audit store operations.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("requester '{0}' is not registered")]
    IdentityNotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx_core::Error),

    #[error("Corrupt audit row: {0}")]
    Corrupt(String),
}

impl AuditError {
    /// Returns `true` if this is an `IdentityNotFound` error.
    #[must_use]
    pub fn is_identity_not_found(&self) -> bool {
        matches!(self, Self::IdentityNotFound(_))
    }
}

/// Durable store of audit records and the requester identities they
/// reference.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Register a requester, returning its id. Registering an existing
    /// requester returns the existing id.
    async fn register_requester(&self, username: &str) -> Result<RequesterId, AuditError>;

    async fn resolve_requester(&self, username: &str) -> Result<Option<RequesterId>, AuditError>;

    /// Append a record. Fails with `IdentityNotFound` and writes nothing if
    /// the requester is not registered.
    async fn insert_record(&self, record: NewAuditRecord) -> Result<AuditRecord, AuditError>;

    /// Records matching `filter`, newest first.
    async fn list_records(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError>;
}
