//! Volatile storage for tests and single-process sessions.

use super::{outcome_status, CallRow, ResultLookup, Storage, StorageError, StoredOutcome};
use crate::types::{CallId, CallStatus};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Map-backed [`Storage`] with the same CAS semantics as a durable store.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    rows: Arc<RwLock<FxHashMap<CallId, CallRow>>>,
}

impl InMemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored row, for inspection in tests.
    pub fn snapshot(&self) -> Vec<CallRow> {
        self.rows.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn put_call(&self, row: CallRow) -> Result<(), StorageError> {
        self.rows.write().entry(row.id).or_insert(row);
        Ok(())
    }

    async fn get_call(&self, id: CallId) -> Result<Option<CallRow>, StorageError> {
        Ok(self.rows.read().get(&id).cloned())
    }

    async fn put_result(&self, id: CallId, outcome: StoredOutcome) -> Result<(), StorageError> {
        let mut rows = self.rows.write();
        if let Some(row) = rows.get_mut(&id) {
            row.status = outcome_status(&outcome);
            row.result = Some(outcome);
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_result(&self, id: CallId) -> Result<ResultLookup, StorageError> {
        let rows = self.rows.read();
        let Some(row) = rows.get(&id) else {
            return Ok(ResultLookup::Missing);
        };
        Ok(match &row.result {
            None => ResultLookup::Missing,
            Some(StoredOutcome::Value { value }) => ResultLookup::Value(value.clone()),
            Some(StoredOutcome::Forward { target }) => ResultLookup::Forward(*target),
            Some(StoredOutcome::Error { error }) => ResultLookup::Error(error.clone()),
        })
    }

    async fn set_status(&self, id: CallId, status: CallStatus) -> Result<(), StorageError> {
        let mut rows = self.rows.write();
        if let Some(row) = rows.get_mut(&id) {
            row.status = status;
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn cas_status(
        &self,
        id: CallId,
        from: CallStatus,
        to: CallStatus,
    ) -> Result<bool, StorageError> {
        let mut rows = self.rows.write();
        match rows.get_mut(&id) {
            Some(row) if row.status == from => {
                row.status = to;
                row.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::call_id;
    use crate::types::NodeRef;
    use serde_json::json;

    fn row(name: &str) -> CallRow {
        let node = NodeRef::new("g", name);
        let id = call_id(&node, &[], &[], &[]);
        CallRow::new(id, node, vec![], vec![], vec![], CallStatus::Pending)
    }

    #[tokio::test]
    async fn put_call_is_idempotent() {
        let storage = InMemoryStorage::new();
        let mut first = row("a");
        first.status = CallStatus::Ready;
        let id = first.id;
        storage.put_call(first).await.unwrap();
        // A second insert with a different status must not clobber.
        storage.put_call(row("a")).await.unwrap();
        let stored = storage.get_call(id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Ready);
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn cas_wins_once() {
        let storage = InMemoryStorage::new();
        let r = row("a");
        let id = r.id;
        storage.put_call(r).await.unwrap();
        storage.set_status(id, CallStatus::Running).await.unwrap();

        let first = storage
            .cas_status(id, CallStatus::Running, CallStatus::Resolved)
            .await
            .unwrap();
        let second = storage
            .cas_status(id, CallStatus::Running, CallStatus::Failed)
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
        let stored = storage.get_call(id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Resolved);
    }

    #[tokio::test]
    async fn result_lookup_reports_forward_and_value() {
        let storage = InMemoryStorage::new();
        let a = row("a");
        let b = row("b");
        let (a_id, b_id) = (a.id, b.id);
        storage.put_call(a).await.unwrap();
        storage.put_call(b).await.unwrap();

        storage
            .put_result(a_id, StoredOutcome::Forward { target: b_id })
            .await
            .unwrap();
        storage
            .put_result(b_id, StoredOutcome::Value { value: json!(9) })
            .await
            .unwrap();

        assert_eq!(
            storage.get_result(a_id).await.unwrap(),
            ResultLookup::Forward(b_id)
        );
        assert_eq!(
            storage.get_result(b_id).await.unwrap(),
            ResultLookup::Value(json!(9))
        );
        assert_eq!(
            storage.get_result(row("c").id).await.unwrap(),
            ResultLookup::Missing
        );
    }

    #[tokio::test]
    async fn put_result_sets_terminal_status() {
        let storage = InMemoryStorage::new();
        let r = row("a");
        let id = r.id;
        storage.put_call(r).await.unwrap();
        storage
            .put_result(
                id,
                StoredOutcome::Error {
                    error: crate::errors::CallError::execution("boom"),
                },
            )
            .await
            .unwrap();
        let stored = storage.get_call(id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Failed);
    }
}
