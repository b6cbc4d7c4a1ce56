//! Node bodies and their execution contract.
//!
//! A node is an asynchronous procedure registered on a
//! [`Graph`](crate::graph::Graph). At run time it receives a
//! [`RunContext`] and a [`CallInput`] of fully materialized argument
//! values, and finishes one of three ways:
//!
//! - `Ok(CallOutput::Value(_))`: a concrete result, recorded as RESOLVED;
//! - `Ok(CallOutput::Call(_))`: a tail call; the returned call supplants
//!   this one in the dependency graph and its eventual result becomes this
//!   call's result;
//! - `Err(NodeError)`: recorded as FAILED and propagated to dependents.
//!
//! Node bodies must be idempotent: delivery is at-least-once, and a body
//! may run again after a lost claim even though only one result is ever
//! recorded.

use crate::call::{CallSpec, Deferred};
use crate::event_bus::{Event, TraceEmitter};
use crate::types::CallId;
use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur when using RunContext methods.
#[derive(Debug, Error, Diagnostic)]
pub enum RunContextError {
    /// Event could not be sent due to event bus disconnection.
    #[error("failed to emit event: event bus unavailable")]
    #[diagnostic(
        code(mycelia::node::event_bus_unavailable),
        help("The event bus may have shut down with the session.")
    )]
    EventBusUnavailable,
}

/// Failures of a background submission.
#[derive(Debug, Error, Diagnostic)]
pub enum SubmitError {
    #[error("a concrete value cannot be submitted; submit a pending call")]
    #[diagnostic(code(mycelia::node::submit_value))]
    NothingToSubmit,

    #[error("submission rejected: {reason}")]
    #[diagnostic(code(mycelia::node::submit_rejected))]
    Rejected { reason: String },

    #[error("session is shutting down")]
    #[diagnostic(code(mycelia::node::submit_cancelled))]
    SessionClosed,
}

/// Acknowledgement that a submitted call is durably registered and
/// enqueued. It says nothing about completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubmitAck {
    pub call_id: CallId,
}

/// Internal hook the session installs so contexts can register background
/// calls without holding a reference cycle.
#[async_trait]
pub(crate) trait Submitter: Send + Sync {
    async fn submit(&self, spec: Arc<CallSpec>) -> Result<SubmitAck, SubmitError>;
}

/// Execution context handed to a node body for one call.
///
/// Exposes the call's identity, scoped event emission, and
/// [`submit`](Self::submit) for registering background calls that run
/// concurrently with (and may outlive) the submitting body.
#[derive(Clone)]
pub struct RunContext {
    /// Session this execution belongs to.
    pub session_id: Uuid,
    /// Identity of the call being executed.
    pub call_id: CallId,
    pub(crate) events: TraceEmitter,
    pub(crate) submitter: Arc<dyn Submitter>,
}

impl RunContext {
    /// Emit a node-scoped event enriched with this call's identity.
    pub fn emit(
        &self,
        scope: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<(), RunContextError> {
        if self
            .events
            .emit(Event::node_message(self.call_id, scope, message))
        {
            Ok(())
        } else {
            Err(RunContextError::EventBusUnavailable)
        }
    }

    /// Register a call for background execution.
    ///
    /// No dependency edge is added from the current call: the submitted
    /// call runs concurrently with the submitter and is not awaited unless
    /// some other call takes it as a dependency. Returns once the call is
    /// durably registered and enqueued; at-least-once delivery to the
    /// broker is guaranteed from that point.
    pub async fn submit<O>(&self, call: &Deferred<O>) -> Result<SubmitAck, SubmitError> {
        match call {
            Deferred::Call(spec) => self.submitter.submit(Arc::clone(spec)).await,
            Deferred::Value(_) => Err(SubmitError::NothingToSubmit),
        }
    }
}

/// Materialized arguments for one execution, in declaration order.
#[derive(Clone, Debug, Default)]
pub struct CallInput {
    pub args: Vec<Value>,
    pub kwargs: FxHashMap<String, Value>,
}

impl CallInput {
    /// Positional argument by index, decoded into a concrete type.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, NodeError> {
        let value = self
            .args
            .get(index)
            .ok_or(NodeError::MissingInput { what: "positional" })?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Keyword argument by name, decoded into a concrete type.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<T, NodeError> {
        let value = self
            .kwargs
            .get(name)
            .ok_or(NodeError::MissingInput { what: "keyword" })?;
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// What a node body finished with.
#[derive(Clone, Debug)]
pub enum CallOutput {
    /// A concrete result value.
    Value(Value),
    /// A tail call supplanting the current one.
    Call(Arc<CallSpec>),
}

impl CallOutput {
    /// A unit result (`null`).
    #[must_use]
    pub fn unit() -> Self {
        CallOutput::Value(Value::Null)
    }

    /// Serialize a concrete result.
    pub fn value<T: Serialize>(value: T) -> Result<Self, NodeError> {
        Ok(CallOutput::Value(serde_json::to_value(value)?))
    }

    /// Finish by handing off to another call. A `Deferred::Value` is
    /// serialized and treated as a concrete result.
    pub fn from_deferred<O: Serialize>(deferred: Deferred<O>) -> Result<Self, NodeError> {
        match deferred {
            Deferred::Call(spec) => Ok(CallOutput::Call(spec)),
            Deferred::Value(v) => Self::value(v),
        }
    }
}

/// Core trait for executable node bodies.
///
/// Implementations must be `Send + Sync`; one instance serves every call
/// targeting the node, potentially concurrently.
///
/// # Examples
///
/// ```rust,no_run
/// use mycelia::node::{CallInput, CallOutput, NodeError, NodeHandler, RunContext};
/// use async_trait::async_trait;
///
/// struct Add;
///
/// #[async_trait]
/// impl NodeHandler for Add {
///     async fn run(&self, _ctx: RunContext, input: CallInput) -> Result<CallOutput, NodeError> {
///         let a: i64 = input.arg(0)?;
///         let b: i64 = input.arg(1)?;
///         CallOutput::value(a + b)
///     }
/// }
/// ```
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn run(&self, ctx: RunContext, input: CallInput) -> Result<CallOutput, NodeError>;
}

/// Fatal errors from a node body. Recorded against the call and
/// propagated to dependents as data; never unwound through the scheduler.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    /// Expected argument is missing from the input.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(mycelia::node::missing_input),
        help("Check the call site against the node's schema.")
    )]
    MissingInput { what: &'static str },

    /// External provider or service error.
    #[error("provider error ({provider}): {message}")]
    #[diagnostic(code(mycelia::node::provider))]
    Provider {
        provider: &'static str,
        message: String,
    },

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    #[diagnostic(code(mycelia::node::serde_json))]
    Serde(#[from] serde_json::Error),

    /// Input validation failed.
    #[error("validation failed: {0}")]
    #[diagnostic(code(mycelia::node::validation))]
    ValidationFailed(String),

    /// Free-form failure from user code.
    #[error("{0}")]
    #[diagnostic(code(mycelia::node::other))]
    Other(String),
}

impl NodeError {
    pub fn msg(message: impl Into<String>) -> Self {
        NodeError::Other(message.into())
    }
}
