//! Session lifecycle: the bounded window in which calls execute.
//!
//! [`Session::open`] seals the graph, connects the broker and storage
//! adapters, and starts the worker loops. [`Session::execute`] registers a
//! call tree and awaits its terminal resolution, following forwards.
//! [`Session::close`] cancels outstanding work, resolves every waiting
//! `execute` with a cancellation error, and tears the loops down.
//!
//! Two background task kinds run per session:
//!
//! - **worker loops** claim ready calls from the broker, run the
//!   [`Executor`], win (or lose) the terminal compare-and-swap in storage,
//!   and publish completion events;
//! - the **completion loop** feeds completion events into the scheduler
//!   state machine and carries out the resulting effects: persisting
//!   outcomes, publishing newly ready calls, waking `execute` waiters.
//!
//! Broker and storage faults are retried with the configured backoff and
//! never fail a call.

use crate::broker::{Broker, BrokerError, CompletionEvent, ExecutionOutcome};
use crate::call::{CallSpec, Deferred};
use crate::codec::{Codec, JsonCodec};
use crate::config::RuntimeConfig;
use crate::dag;
use crate::errors::CallError;
use crate::event_bus::{CallPhase, Event, EventBus, TraceEmitter};
use crate::executor::Executor;
use crate::graph::Graph;
use crate::node::{SubmitAck, SubmitError, Submitter, RunContext};
use crate::scheduler::{Effects, SchedulerState, TerminalOutcome};
use crate::storage::{ResultLookup, Storage, StorageError};
use crate::types::{CallId, CallStatus};
use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::instrument;
use uuid::Uuid;

/// Faults opening or operating a session.
#[derive(Debug, Error, Diagnostic)]
pub enum SessionError {
    #[error(transparent)]
    #[diagnostic(code(mycelia::session::broker))]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    #[diagnostic(code(mycelia::session::storage))]
    Storage(#[from] StorageError),
}

/// How a root invocation can fail.
#[derive(Debug, Error, Diagnostic)]
pub enum ExecuteError {
    /// The call (or one of its dependencies) failed; the descriptor is
    /// exactly what storage recorded.
    #[error("call failed: {0}")]
    #[diagnostic(code(mycelia::session::call_failed))]
    Call(#[source] CallError),

    #[error("result did not decode into the requested type: {0}")]
    #[diagnostic(code(mycelia::session::decode))]
    Decode(#[source] serde_json::Error),

    #[error("session closed before the call settled")]
    #[diagnostic(code(mycelia::session::closed))]
    Closed,

    #[error(transparent)]
    #[diagnostic(code(mycelia::session::broker))]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    #[diagnostic(code(mycelia::session::storage))]
    Storage(#[from] StorageError),
}

impl From<SessionError> for ExecuteError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Broker(e) => ExecuteError::Broker(e),
            SessionError::Storage(e) => ExecuteError::Storage(e),
        }
    }
}

struct Inner {
    scheduler: SchedulerState,
    watchers: FxHashMap<CallId, Vec<oneshot::Sender<TerminalOutcome>>>,
}

pub(crate) struct SessionCore {
    id: Uuid,
    graph: Arc<Graph>,
    broker: Arc<dyn Broker>,
    storage: Arc<dyn Storage>,
    codec: Arc<dyn Codec>,
    config: RuntimeConfig,
    inner: Mutex<Inner>,
    events: TraceEmitter,
    bus: EventBus,
    cancelled: AtomicBool,
}

/// A connected runtime over one graph.
///
/// # Examples
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use mycelia::broker::InMemoryBroker;
/// # use mycelia::config::RuntimeConfig;
/// # use mycelia::graph::{Graph, NodeSchema};
/// # use mycelia::session::Session;
/// # async fn example(graph: Arc<Graph>, hello: mycelia::graph::NodeHandle) -> Result<(), Box<dyn std::error::Error>> {
/// let broker = Arc::new(InMemoryBroker::new());
/// let storage = Arc::new(mycelia::storage::InMemoryStorage::new());
/// let session = Session::open(graph, broker, storage, RuntimeConfig::default()).await?;
///
/// let call = hello.call().build::<serde_json::Value>()?;
/// let result = session.execute(&call).await?;
/// println!("{result}");
///
/// session.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Session {
    core: Arc<SessionCore>,
    tasks: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl Session {
    /// Connect the runtime: seal the graph, start the completion loop and
    /// the configured number of worker loops.
    #[instrument(skip_all, fields(graph = graph.name()))]
    pub async fn open(
        graph: Arc<Graph>,
        broker: Arc<dyn Broker>,
        storage: Arc<dyn Storage>,
        config: RuntimeConfig,
    ) -> Result<Self, SessionError> {
        graph.seal();
        let bus = config.event_bus.build_event_bus();
        let events = bus.emitter();

        let core = Arc::new(SessionCore {
            id: Uuid::new_v4(),
            graph,
            broker,
            storage,
            codec: Arc::new(JsonCodec),
            config,
            inner: Mutex::new(Inner {
                scheduler: SchedulerState::new(),
                watchers: FxHashMap::default(),
            }),
            events,
            bus,
            cancelled: AtomicBool::new(false),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let completions = core.broker.completions();
        tasks.push(tokio::spawn(completion_loop(
            Arc::clone(&core),
            completions,
            shutdown_rx.clone(),
        )));
        for _ in 0..core.config.worker_concurrency.max(1) {
            tasks.push(tokio::spawn(worker_loop(
                Arc::clone(&core),
                shutdown_rx.clone(),
            )));
        }

        Ok(Self {
            core,
            tasks,
            shutdown,
        })
    }

    pub fn id(&self) -> Uuid {
        self.core.id
    }

    /// Register a call tree and await its terminal resolution, following
    /// forward records to the final value.
    #[instrument(skip_all, fields(session = %self.core.id))]
    pub async fn execute<O>(&self, call: &Deferred<O>) -> Result<O, ExecuteError>
    where
        O: Serialize + DeserializeOwned + Clone,
    {
        let spec = match call {
            Deferred::Value(v) => return Ok(v.clone()),
            Deferred::Call(spec) => Arc::clone(spec),
        };
        if self.core.cancelled.load(Ordering::SeqCst) {
            return Err(ExecuteError::Closed);
        }

        self.core.register_tree(&spec).await?;

        let rx = {
            let mut inner = self.core.inner.lock();
            match inner.scheduler.settled_outcome(spec.id()) {
                Some(outcome) => return decode_outcome(outcome),
                None => {
                    let (tx, rx) = oneshot::channel();
                    inner.watchers.entry(spec.id()).or_default().push(tx);
                    rx
                }
            }
        };

        match rx.await {
            Ok(outcome) => decode_outcome(outcome),
            Err(_) => Err(ExecuteError::Closed),
        }
    }

    /// Register a call for background execution without awaiting it.
    /// Equivalent to [`RunContext::submit`] from outside a node body.
    pub async fn submit<O>(&self, call: &Deferred<O>) -> Result<SubmitAck, SubmitError> {
        match call {
            Deferred::Call(spec) => Submitter::submit(self.core.as_ref(), Arc::clone(spec)).await,
            Deferred::Value(_) => Err(SubmitError::NothingToSubmit),
        }
    }

    /// Cancel all in-flight and pending work without tearing the loops
    /// down: every non-terminal call fails with `SessionCancelled` and
    /// waiting `execute` calls are woken with the same error.
    #[instrument(skip_all, fields(session = %self.core.id))]
    pub async fn cancel(&self) {
        self.core.cancelled.store(true, Ordering::SeqCst);
        let effects = {
            let mut inner = self.core.inner.lock();
            inner.scheduler.cancel_all()
        };
        if let Err(e) = self.core.apply_effects(effects).await {
            self.core
                .events
                .emit(Event::diagnostic("session", format!("cancel flush: {e}")));
        }
    }

    /// Cancel outstanding work and tear the session down: stop claiming,
    /// hand outstanding claims back to the broker, disconnect.
    #[instrument(skip_all, fields(session = %self.core.id))]
    pub async fn close(mut self) {
        self.cancel().await;
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.core.bus.shutdown().await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

fn decode_outcome<O: DeserializeOwned>(outcome: TerminalOutcome) -> Result<O, ExecuteError> {
    match outcome {
        TerminalOutcome::Value(value) => {
            serde_json::from_value(value).map_err(ExecuteError::Decode)
        }
        TerminalOutcome::Error(error) => Err(ExecuteError::Call(error)),
    }
}

impl SessionCore {
    /// Insert a call tree into the scheduler, persist the new rows, adopt
    /// memoized results when configured, and publish whatever is ready.
    async fn register_tree(&self, spec: &Arc<CallSpec>) -> Result<CallId, SessionError> {
        let mut effects = {
            let mut inner = self.inner.lock();
            dag::register(&mut inner.scheduler, spec).effects
        };

        if self.config.cross_session_memoization {
            self.adopt_stored_results(&mut effects).await?;
        }

        self.apply_effects(effects).await?;
        Ok(spec.id())
    }

    /// Cross-session memoization: registered calls whose terminal result
    /// already sits in storage settle without executing.
    async fn adopt_stored_results(&self, effects: &mut Effects) -> Result<(), SessionError> {
        let candidates: Vec<CallId> = effects.new_rows.iter().map(|row| row.id).collect();
        for id in candidates {
            let lookup = self
                .retry("storage.get_result", || self.storage.get_result(id))
                .await?;
            let outcome = match lookup {
                ResultLookup::Value(value) => TerminalOutcome::Value(value),
                ResultLookup::Error(error) => TerminalOutcome::Error(error),
                ResultLookup::Forward(_) | ResultLookup::Missing => continue,
            };
            let mut adopted = Effects::default();
            {
                let mut inner = self.inner.lock();
                inner.scheduler.finalize(id, outcome, &mut adopted);
            }
            // A settled call must not be handed to an executor.
            effects.ready.retain(|ready| *ready != id);
            effects.merge(adopted);
        }
        Ok(())
    }

    /// Carry out scheduler effects: persist, notify, publish. Rows are
    /// persisted before their ids are published so an executor always
    /// finds the record.
    async fn apply_effects(&self, effects: Effects) -> Result<(), SessionError> {
        for row in &effects.new_rows {
            let row = row.clone();
            self.retry("storage.put_call", || self.storage.put_call(row.clone()))
                .await?;
        }
        for (id, outcome) in &effects.outcomes {
            let (id, outcome) = (*id, outcome.clone());
            self.retry("storage.put_result", || {
                self.storage.put_result(id, outcome.clone())
            })
            .await?;
        }

        // Wake execute() waiters and emit span ends.
        let names: FxHashMap<CallId, String> = {
            let mut inner = self.inner.lock();
            for (id, outcome) in &effects.terminal {
                if let Some(txs) = inner.watchers.remove(id) {
                    for tx in txs {
                        let _ = tx.send(outcome.clone());
                    }
                }
            }
            effects
                .terminal
                .iter()
                .map(|(id, _)| *id)
                .chain(effects.forwards.iter().map(|(caller, _)| *caller))
                .map(|id| {
                    let name = inner
                        .scheduler
                        .node_of(id)
                        .map(|n| n.encode())
                        .unwrap_or_default();
                    (id, name)
                })
                .collect()
        };
        for (caller, target) in &effects.forwards {
            let name = names.get(caller).cloned().unwrap_or_default();
            self.events.emit(Event::forwarded(*caller, *target, name));
        }
        for (id, outcome) in &effects.terminal {
            let name = names.get(id).cloned().unwrap_or_default();
            let phase = match outcome {
                TerminalOutcome::Value(_) => CallPhase::Resolved,
                TerminalOutcome::Error(_) => CallPhase::Failed,
            };
            self.events.emit(Event::span_end(*id, name, phase));
        }

        for id in &effects.ready {
            let id = *id;
            self.retry("storage.set_status", || {
                self.storage.set_status(id, CallStatus::Ready)
            })
            .await?;
            self.retry("broker.publish", || self.broker.publish(id))
                .await?;
        }
        Ok(())
    }

    /// Retry an infrastructure operation with capped exponential backoff.
    /// Gives up only once the session is cancelled.
    async fn retry<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if self.cancelled.load(Ordering::SeqCst) {
                        return Err(e);
                    }
                    self.events
                        .emit(Event::diagnostic(label, format!("{e}; retrying")));
                    tokio::time::sleep(self.config.retry.delay(attempt)).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    fn run_context(self: &Arc<Self>, call_id: CallId) -> RunContext {
        RunContext {
            session_id: self.id,
            call_id,
            events: self.events.clone(),
            submitter: Arc::clone(self) as Arc<dyn Submitter>,
        }
    }
}

#[async_trait]
impl Submitter for SessionCore {
    async fn submit(&self, spec: Arc<CallSpec>) -> Result<SubmitAck, SubmitError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(SubmitError::SessionClosed);
        }
        let call_id = self
            .register_tree(&spec)
            .await
            .map_err(|e| SubmitError::Rejected {
                reason: e.to_string(),
            })?;
        Ok(SubmitAck { call_id })
    }
}

/// Feed completion events into the scheduler until shutdown.
async fn completion_loop(
    core: Arc<SessionCore>,
    completions: flume::Receiver<CompletionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = completions.recv_async() => {
                let Ok(event) = event else { break };
                let effects = {
                    let mut inner = core.inner.lock();
                    inner.scheduler.complete(event.call_id, event.outcome)
                };
                if let Err(e) = core.apply_effects(effects).await {
                    core.events
                        .emit(Event::diagnostic("completion", format!("{e}")));
                }
            }
        }
    }
}

/// Claim, execute, report; repeat until shutdown.
async fn worker_loop(core: Arc<SessionCore>, mut shutdown: watch::Receiver<bool>) {
    let executor = Executor::new(
        Arc::clone(&core.graph),
        Arc::clone(&core.storage),
        Arc::clone(&core.codec),
    );
    let mut attempt: u32 = 0;

    loop {
        let claim = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            claimed = core.broker.claim() => match claimed {
                Ok(claim) => {
                    attempt = 0;
                    claim
                }
                Err(e) => {
                    if core.cancelled.load(Ordering::SeqCst) {
                        break;
                    }
                    core.events
                        .emit(Event::diagnostic("broker.claim", format!("{e}; retrying")));
                    tokio::time::sleep(core.config.retry.delay(attempt)).await;
                    attempt = attempt.saturating_add(1);
                    continue;
                }
            }
        };

        let call_id = claim.call_id;
        let accepted = {
            let mut inner = core.inner.lock();
            inner.scheduler.mark_running(call_id)
        };
        if !accepted {
            // Stale redelivery of a settled call.
            let _ = core.broker.ack(&claim).await;
            continue;
        }

        // Conditional so a terminal status written by a faster worker is
        // never clobbered.
        let _ = core
            .storage
            .cas_status(call_id, CallStatus::Ready, CallStatus::Running)
            .await;

        let node_name = {
            let inner = core.inner.lock();
            inner
                .scheduler
                .node_of(call_id)
                .map(|n| n.encode())
                .unwrap_or_default()
        };
        core.events.emit(Event::span_start(call_id, node_name));

        let ctx = core.run_context(call_id);
        let result = tokio::select! {
            changed = shutdown.changed() => {
                // Cooperative cancel: hand the claim back for a possible
                // resume, then stop.
                let _ = changed;
                let _ = core.broker.nack(&claim).await;
                break;
            }
            result = executor.execute(call_id, ctx) => result,
        };

        match result {
            Err(e) => {
                // Host fault: requeue and let redelivery try again.
                core.events
                    .emit(Event::diagnostic("executor", format!("{e}; requeued")));
                tokio::time::sleep(core.config.retry.delay(0)).await;
                let _ = core.broker.nack(&claim).await;
            }
            Ok(outcome) => {
                report_outcome(&core, &claim, outcome).await;
            }
        }
    }
}

/// Win the terminal CAS and publish the completion; a lost CAS means
/// another worker finished first, so reconcile from the stored outcome.
async fn report_outcome(
    core: &Arc<SessionCore>,
    claim: &crate::broker::Claim,
    outcome: ExecutionOutcome,
) {
    let call_id = claim.call_id;
    let terminal_status = match &outcome {
        ExecutionOutcome::Resolved(_) | ExecutionOutcome::Continuation(_) => CallStatus::Resolved,
        ExecutionOutcome::Failed(_) => CallStatus::Failed,
    };

    let won = core
        .retry("storage.cas_status", || {
            core.storage
                .cas_status(call_id, CallStatus::Running, terminal_status)
        })
        .await
        .unwrap_or(false);

    let publish = if won {
        Some(outcome)
    } else {
        // Idempotent bodies make outcomes agree; take the stored one.
        match core.storage.get_result(call_id).await {
            Ok(ResultLookup::Value(value)) => Some(ExecutionOutcome::Resolved(value)),
            Ok(ResultLookup::Error(error)) => Some(ExecutionOutcome::Failed(error)),
            Ok(ResultLookup::Forward(target)) => match outcome {
                ExecutionOutcome::Continuation(spec) if spec.id() == target => {
                    Some(ExecutionOutcome::Continuation(spec))
                }
                _ => None,
            },
            Ok(ResultLookup::Missing) | Err(_) => None,
        }
    };

    if let Some(outcome) = publish {
        let event = CompletionEvent { call_id, outcome };
        let _ = core
            .retry("broker.publish_completion", || {
                core.broker.publish_completion(event.clone())
            })
            .await;
    }
    let _ = core.broker.ack(claim).await;
}
