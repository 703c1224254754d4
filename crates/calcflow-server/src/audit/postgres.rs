//! PostgreSQL audit store.

use async_trait::async_trait;
use calcflow_core::OperationKind;
use sqlx_core::pool::{Pool, PoolOptions};
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_postgres::Postgres;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info};

use super::{AuditError, AuditFilter, AuditRecord, AuditStore, NewAuditRecord, RequesterId};

/// PostgreSQL connection pool type alias.
pub type PgPool = Pool<Postgres>;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS requesters (
        id BIGSERIAL PRIMARY KEY,
        username TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS audit_operations (
        id BIGSERIAL PRIMARY KEY,
        operation TEXT NOT NULL,
        input TEXT NOT NULL,
        result TEXT NOT NULL,
        recorded_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        requester_id BIGINT NOT NULL REFERENCES requesters (id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS audit_operations_requester_idx
        ON audit_operations (requester_id, id DESC)
    "#,
];

/// Create a connection pool for the audit database.
pub async fn create_pool(url: &str, pool_size: u32) -> Result<PgPool, AuditError> {
    info!(pool_size, "Creating PostgreSQL audit pool");

    let pool = PoolOptions::<Postgres>::new()
        .max_connections(pool_size)
        .acquire_timeout(Duration::from_secs(5))
        .connect(url)
        .await?;

    debug!("PostgreSQL audit pool created");
    Ok(pool)
}

type RecordRow = (i64, String, String, String, OffsetDateTime, String);

/// `LIMIT` bind value; `None` binds NULL, which Postgres treats as no limit.
fn sql_limit(limit: Option<usize>) -> Option<i64> {
    limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX))
}

/// Audit store backed by two tables: `requesters` and `audit_operations`.
#[derive(Clone)]
pub struct PostgresAuditStore {
    pool: PgPool,
}

impl PostgresAuditStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the tables if they do not exist yet.
    pub async fn init_schema(&self) -> Result<(), AuditError> {
        for statement in SCHEMA {
            query(*statement).execute(&self.pool).await?;
        }
        info!("Audit schema ready");
        Ok(())
    }

    fn record_from_row(row: RecordRow) -> Result<AuditRecord, AuditError> {
        let (id, operation, input_repr, result_repr, timestamp, requester) = row;
        let operation: OperationKind = operation
            .parse()
            .map_err(|_| AuditError::Corrupt(format!("unknown operation '{operation}' in row {id}")))?;

        Ok(AuditRecord {
            id,
            operation,
            input_repr,
            result_repr,
            timestamp,
            requester,
        })
    }
}

#[async_trait]
impl AuditStore for PostgresAuditStore {
    async fn register_requester(&self, username: &str) -> Result<RequesterId, AuditError> {
        let (id,): (i64,) = query_as(
            r#"
            INSERT INTO requesters (username)
            VALUES ($1)
            ON CONFLICT (username) DO UPDATE SET username = EXCLUDED.username
            RETURNING id
            "#,
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn resolve_requester(&self, username: &str) -> Result<Option<RequesterId>, AuditError> {
        let row: Option<(i64,)> = query_as("SELECT id FROM requesters WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(id,)| id))
    }

    /// Resolves the requester and inserts in a single statement, so an
    /// unknown requester inserts zero rows.
    async fn insert_record(&self, record: NewAuditRecord) -> Result<AuditRecord, AuditError> {
        let row: Option<(i64, OffsetDateTime)> = query_as(
            r#"
            INSERT INTO audit_operations (operation, input, result, requester_id)
            SELECT $1, $2, $3, r.id
            FROM requesters r
            WHERE r.username = $4
            RETURNING id, recorded_at
            "#,
        )
        .bind(record.operation.as_str())
        .bind(&record.input_repr)
        .bind(&record.result_repr)
        .bind(&record.requester)
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, timestamp)) = row else {
            return Err(AuditError::IdentityNotFound(record.requester));
        };

        Ok(AuditRecord {
            id,
            operation: record.operation,
            input_repr: record.input_repr,
            result_repr: record.result_repr,
            timestamp,
            requester: record.requester,
        })
    }

    async fn list_records(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError> {
        let rows: Vec<RecordRow> = query_as(
            r#"
            SELECT o.id, o.operation, o.input, o.result, o.recorded_at, r.username
            FROM audit_operations o
            JOIN requesters r ON r.id = o.requester_id
            WHERE ($1::TEXT IS NULL OR r.username = $1)
              AND ($2::TEXT IS NULL OR o.operation = $2)
            ORDER BY o.id DESC
            LIMIT $3
            "#,
        )
        .bind(filter.requester.as_deref())
        .bind(filter.operation.map(|op| op.as_str()))
        .bind(sql_limit(filter.limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::record_from_row).collect()
    }
}
