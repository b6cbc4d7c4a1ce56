//! Executes one claimed call end to end.
//!
//! The executor fetches the call's definition, materializes every `Ref`
//! and `Group` slot from storage (following forward redirects), invokes
//! the node body with a fresh run context, and reduces whatever happened
//! to an [`ExecutionOutcome`]. It never mutates scheduler state; the
//! outcome travels back through the broker as a completion event.
//!
//! User failures (including panics inside the body) become data; only
//! storage faults surface as host errors, and those are retried by the
//! worker loop rather than recorded against the call.

use crate::broker::ExecutionOutcome;
use crate::codec::Codec;
use crate::errors::CallError;
use crate::graph::Graph;
use crate::node::{CallInput, CallOutput, RunContext};
use crate::storage::{ResultLookup, Storage, StorageError};
use crate::call::StoredSlot;
use crate::types::CallId;
use futures_util::FutureExt;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

/// Host-level executor faults. These requeue the claim; they never fail
/// the call.
#[derive(Debug, Error, Diagnostic)]
pub enum ExecutorError {
    #[error("call {id} has no stored record")]
    #[diagnostic(
        code(mycelia::executor::unknown_call),
        help("The call row must be persisted before the id is published.")
    )]
    UnknownCall { id: CallId },

    #[error(transparent)]
    #[diagnostic(code(mycelia::executor::storage))]
    Storage(#[from] StorageError),
}

/// Stateless runner for claimed calls; one per worker process.
pub struct Executor {
    graph: Arc<Graph>,
    storage: Arc<dyn Storage>,
    codec: Arc<dyn Codec>,
}

impl Executor {
    pub fn new(graph: Arc<Graph>, storage: Arc<dyn Storage>, codec: Arc<dyn Codec>) -> Self {
        Self {
            graph,
            storage,
            codec,
        }
    }

    /// Run the body of `call_id` and report how it ended.
    #[instrument(skip(self, ctx), fields(call = %call_id.short()))]
    pub async fn execute(
        &self,
        call_id: CallId,
        ctx: RunContext,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let row = self
            .storage
            .get_call(call_id)
            .await?
            .ok_or(ExecutorError::UnknownCall { id: call_id })?;

        let Some(entry) = self.graph.entry(&row.node_ref.node) else {
            return Ok(ExecutionOutcome::Failed(CallError::NodeNotRegistered {
                node: row.node_ref.encode(),
            }));
        };

        // Materialize arguments in declaration order.
        let mut args = Vec::with_capacity(row.args.len());
        for slot in &row.args {
            match self.materialize(slot).await? {
                Ok(value) => args.push(value),
                Err(error) => return Ok(ExecutionOutcome::Failed(error)),
            }
        }
        let mut kwargs = FxHashMap::default();
        for (name, slot) in &row.kwargs {
            match self.materialize(slot).await? {
                Ok(value) => {
                    kwargs.insert(name.clone(), value);
                }
                Err(error) => return Ok(ExecutionOutcome::Failed(error)),
            }
        }

        let input = CallInput { args, kwargs };
        let body = entry.handler.run(ctx, input);
        let outcome = match AssertUnwindSafe(body).catch_unwind().await {
            Ok(Ok(CallOutput::Value(value))) => {
                // Reject values the session codec cannot represent before
                // anything is persisted.
                match self.codec.encode(&value) {
                    Ok(_) => ExecutionOutcome::Resolved(value),
                    Err(e) => ExecutionOutcome::Failed(CallError::NonSerializableResult {
                        reason: e.to_string(),
                    }),
                }
            }
            Ok(Ok(CallOutput::Call(spec))) => ExecutionOutcome::Continuation(spec),
            Ok(Err(node_error)) => {
                ExecutionOutcome::Failed(CallError::execution(node_error.to_string()))
            }
            Err(panic) => ExecutionOutcome::Failed(CallError::execution(panic_message(&panic))),
        };
        Ok(outcome)
    }

    /// Resolve one slot to a concrete value. `Ref` and `Group` lookups
    /// follow forward redirects until a value or error is found.
    async fn materialize(
        &self,
        slot: &StoredSlot,
    ) -> Result<Result<Value, CallError>, ExecutorError> {
        match slot {
            StoredSlot::Literal { value } => Ok(Ok(value.clone())),
            StoredSlot::Ref { id } => self.resolve_value(*id).await,
            StoredSlot::Group { ids } => {
                let mut values = Vec::with_capacity(ids.len());
                for id in ids {
                    match self.resolve_value(*id).await? {
                        Ok(value) => values.push(value),
                        Err(error) => return Ok(Err(error)),
                    }
                }
                Ok(Ok(Value::Array(values)))
            }
        }
    }

    async fn resolve_value(
        &self,
        mut id: CallId,
    ) -> Result<Result<Value, CallError>, ExecutorError> {
        // Bounded walk: forward chains are acyclic in practice, but a
        // corrupt store must not spin the worker.
        for _ in 0..64 {
            match self.storage.get_result(id).await? {
                ResultLookup::Value(value) => return Ok(Ok(value)),
                ResultLookup::Forward(target) => id = target,
                ResultLookup::Error(error) => return Ok(Err(error)),
                ResultLookup::Missing => {
                    return Err(ExecutorError::Storage(StorageError::Corrupt {
                        id,
                        reason: "dependency has no recorded result".to_string(),
                    }))
                }
            }
        }
        Err(ExecutorError::Storage(StorageError::Corrupt {
            id,
            reason: "forward chain exceeded depth limit".to_string(),
        }))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("node body panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("node body panicked: {s}")
    } else {
        "node body panicked".to_string()
    }
}
