use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use time::OffsetDateTime;

use super::{AuditError, AuditFilter, AuditRecord, AuditStore, NewAuditRecord, RequesterId};

/// Process-local audit store.
///
/// Records live for the lifetime of the process; useful for tests and
/// single-shot runs.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    requesters: HashMap<String, RequesterId>,
    records: Vec<AuditRecord>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn register_requester(&self, username: &str) -> Result<RequesterId, AuditError> {
        let mut inner = self.inner.write();
        let next_id = inner.requesters.len() as RequesterId + 1;
        Ok(*inner
            .requesters
            .entry(username.to_string())
            .or_insert(next_id))
    }

    async fn resolve_requester(&self, username: &str) -> Result<Option<RequesterId>, AuditError> {
        Ok(self.inner.read().requesters.get(username).copied())
    }

    async fn insert_record(&self, record: NewAuditRecord) -> Result<AuditRecord, AuditError> {
        let mut inner = self.inner.write();
        if !inner.requesters.contains_key(&record.requester) {
            return Err(AuditError::IdentityNotFound(record.requester));
        }

        let stored = AuditRecord {
            id: inner.records.len() as i64 + 1,
            operation: record.operation,
            input_repr: record.input_repr,
            result_repr: record.result_repr,
            timestamp: OffsetDateTime::now_utc(),
            requester: record.requester,
        };
        inner.records.push(stored.clone());
        Ok(stored)
    }

    async fn list_records(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError> {
        let inner = self.inner.read();
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(inner
            .records
            .iter()
            .rev()
            .filter(|r| filter.matches(r))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calcflow_core::OperationKind;
    use tokio_test::block_on;

    fn record(op: OperationKind, input: &str, requester: &str) -> NewAuditRecord {
        NewAuditRecord {
            operation: op,
            input_repr: input.into(),
            result_repr: "1".into(),
            requester: requester.into(),
        }
    }

    #[tokio::test]
    async fn unknown_requester_writes_nothing() {
        let store = MemoryAuditStore::new();
        let err = store
            .insert_record(record(OperationKind::Fibonacci, "1", "ghost"))
            .await
            .unwrap_err();
        assert!(err.is_identity_not_found());
        assert!(store.is_empty());
    }

    #[test]
    fn register_is_idempotent() {
        let store = MemoryAuditStore::new();
        block_on(async {
            let a = store.register_requester("alice").await.unwrap();
            let b = store.register_requester("bob").await.unwrap();
            assert_ne!(a, b);
            assert_eq!(store.register_requester("alice").await.unwrap(), a);
            assert_eq!(store.resolve_requester("bob").await.unwrap(), Some(b));
            assert_eq!(store.resolve_requester("carol").await.unwrap(), None);
        });
    }

    #[tokio::test]
    async fn lists_newest_first_with_filters() {
        let store = MemoryAuditStore::new();
        store.register_requester("alice").await.unwrap();
        store.register_requester("bob").await.unwrap();

        store
            .insert_record(record(OperationKind::Fibonacci, "1", "alice"))
            .await
            .unwrap();
        store
            .insert_record(record(OperationKind::Factorial, "2", "bob"))
            .await
            .unwrap();
        store
            .insert_record(record(OperationKind::Fibonacci, "3", "alice"))
            .await
            .unwrap();

        let all = store.list_records(&AuditFilter::default()).await.unwrap();
        let inputs: Vec<_> = all.iter().map(|r| r.input_repr.as_str()).collect();
        assert_eq!(inputs, vec!["3", "2", "1"]);

        let alice = store
            .list_records(&AuditFilter::for_requester("alice"))
            .await
            .unwrap();
        assert_eq!(alice.len(), 2);
        assert!(alice.iter().all(|r| r.requester == "alice"));

        let limited = store
            .list_records(&AuditFilter {
                operation: Some(OperationKind::Fibonacci),
                limit: Some(1),
                ..AuditFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].input_repr, "3");
    }
}
