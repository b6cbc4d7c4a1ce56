//! Durable call records: the memoization substrate.
//!
//! Storage keeps the authoritative state of every call: its definition
//! (node reference plus argument slots), its lifecycle status, and its
//! outcome (a value, an error descriptor, or a forwarding redirect left
//! behind by a tail call). The in-memory scheduler is a cache over this
//! map, kept coherent through broker events.
//!
//! The compare-and-swap on status is the single-writer guarantee: under
//! at-least-once delivery two executors may finish the same call, but
//! only the first RUNNING→terminal transition lands; the loser discards
//! its result.

mod local;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use local::InMemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

use crate::call::StoredSlot;
use crate::errors::CallError;
use crate::types::{CallId, CallStatus, NodeRef};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Persisted definition and state of one call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallRow {
    pub id: CallId,
    pub node_ref: NodeRef,
    pub args: Vec<StoredSlot>,
    pub kwargs: Vec<(String, StoredSlot)>,
    /// Ordering-only dependency ids; resolved before the call runs but
    /// never materialized into arguments.
    pub gates: Vec<CallId>,
    pub status: CallStatus,
    pub result: Option<StoredOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CallRow {
    /// Fresh row for a newly registered call.
    #[must_use]
    pub fn new(
        id: CallId,
        node_ref: NodeRef,
        args: Vec<StoredSlot>,
        kwargs: Vec<(String, StoredSlot)>,
        gates: Vec<CallId>,
        status: CallStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            node_ref,
            args,
            kwargs,
            gates,
            status,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Terminal outcome blob recorded against a call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StoredOutcome {
    /// Concrete result value.
    Value { value: Value },
    /// Redirect to the call that supplanted this one.
    Forward { target: CallId },
    /// Error descriptor.
    Error { error: CallError },
}

/// Result of a one-step outcome lookup.
#[derive(Clone, Debug, PartialEq)]
pub enum ResultLookup {
    Value(Value),
    Forward(CallId),
    Error(CallError),
    Missing,
}

/// Infrastructure failures. Retried with backoff; never recorded against
/// a call.
#[derive(Debug, Error, Diagnostic)]
pub enum StorageError {
    #[error("storage unavailable: {reason}")]
    #[diagnostic(
        code(mycelia::storage::unavailable),
        help("The runtime retries with exponential backoff; check storage connectivity.")
    )]
    Unavailable { reason: String },

    #[error("stored blob for call {id} is corrupt: {reason}")]
    #[diagnostic(code(mycelia::storage::corrupt))]
    Corrupt { id: CallId, reason: String },
}

/// Durable map from call id to definition, status, and outcome.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert a call row if absent. Re-inserting an existing id is a
    /// no-op: content addressing makes the row immutable modulo status
    /// and result.
    async fn put_call(&self, row: CallRow) -> Result<(), StorageError>;

    async fn get_call(&self, id: CallId) -> Result<Option<CallRow>, StorageError>;

    /// Record a terminal outcome (value, error, or forward) and the
    /// matching terminal status.
    async fn put_result(&self, id: CallId, outcome: StoredOutcome) -> Result<(), StorageError>;

    /// One-step outcome lookup; callers follow `Forward` targets.
    async fn get_result(&self, id: CallId) -> Result<ResultLookup, StorageError>;

    /// Unconditional status write (non-contended transitions).
    async fn set_status(&self, id: CallId, status: CallStatus) -> Result<(), StorageError>;

    /// Atomic status transition; returns whether this writer won. The
    /// RUNNING→terminal edge goes through here.
    async fn cas_status(
        &self,
        id: CallId,
        from: CallStatus,
        to: CallStatus,
    ) -> Result<bool, StorageError>;
}

/// Terminal status implied by an outcome blob.
pub(crate) fn outcome_status(outcome: &StoredOutcome) -> CallStatus {
    match outcome {
        StoredOutcome::Value { .. } | StoredOutcome::Forward { .. } => CallStatus::Resolved,
        StoredOutcome::Error { .. } => CallStatus::Failed,
    }
}
