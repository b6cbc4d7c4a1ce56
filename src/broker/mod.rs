//! Broker contract between the scheduler and worker executors.
//!
//! The broker carries two flows: ready call ids travelling scheduler →
//! workers (claimed with a visibility timeout, acknowledged on completion)
//! and completion events travelling workers → scheduler. Delivery is
//! at-least-once with FIFO per producer; no global order is assumed
//! anywhere. Concrete message-queue drivers implement [`Broker`]; the
//! in-process [`InMemoryBroker`](local::InMemoryBroker) backs tests and
//! single-process deployments.

mod local;

pub use local::InMemoryBroker;

use crate::call::CallSpec;
use crate::errors::CallError;
use crate::types::CallId;
use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Exclusive lease on one ready call. Exactly one executor holds a live
/// claim for a given call; losing it (crash, visibility timeout) returns
/// the call to the queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Claim {
    pub call_id: CallId,
    pub token: Uuid,
}

/// What an executor finished with, shipped back to the scheduler.
#[derive(Clone, Debug)]
pub enum ExecutionOutcome {
    /// The body returned a concrete value.
    Resolved(Value),
    /// The body returned another call; tail-call substitution applies.
    Continuation(Arc<CallSpec>),
    /// The body failed; the descriptor propagates to dependents.
    Failed(CallError),
}

/// Completion event for one call.
#[derive(Clone, Debug)]
pub struct CompletionEvent {
    pub call_id: CallId,
    pub outcome: ExecutionOutcome,
}

/// Infrastructure failures. The runtime retries these with backoff; they
/// never mark a call failed.
#[derive(Debug, Error, Diagnostic)]
pub enum BrokerError {
    #[error("broker unavailable: {reason}")]
    #[diagnostic(
        code(mycelia::broker::unavailable),
        help("The runtime retries with exponential backoff; check broker connectivity.")
    )]
    Unavailable { reason: String },
}

/// Message transport consumed by the scheduler and executors.
///
/// Ordering: FIFO per producer, no global order. Delivery: at-least-once;
/// an unacknowledged claim is redelivered after the visibility timeout.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue a ready call for execution.
    async fn publish(&self, call_id: CallId) -> Result<(), BrokerError>;

    /// Wait for and claim the next ready call.
    async fn claim(&self) -> Result<Claim, BrokerError>;

    /// Acknowledge a finished claim; the call will not be redelivered.
    async fn ack(&self, claim: &Claim) -> Result<(), BrokerError>;

    /// Return a claim to the queue for immediate redelivery.
    async fn nack(&self, claim: &Claim) -> Result<(), BrokerError>;

    /// Ship a completion event back to the scheduler.
    async fn publish_completion(&self, event: CompletionEvent) -> Result<(), BrokerError>;

    /// Stream of completion events. A single scheduler consumes the
    /// stream; multiple receivers would steal from each other.
    fn completions(&self) -> flume::Receiver<CompletionEvent>;
}
