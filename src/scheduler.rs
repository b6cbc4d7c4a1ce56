//! Central call state machine.
//!
//! `SchedulerState` tracks every call the session knows about: lifecycle
//! status, unresolved dependency counts, the dependents waiting on each
//! call, and forwarding links left behind by tail calls. It is pure
//! bookkeeping, no I/O. Mutations return [`Effects`] describing what the
//! session must do next (rows to persist, ready ids to publish, terminal
//! outcomes to deliver), which keeps the state machine synchronous and
//! testable while all broker/storage traffic stays in the session layer.
//!
//! State transitions:
//!
//! ```text
//! PENDING --(last dep resolves)--> READY --(claim)--> RUNNING
//! RUNNING --(value)--> RESOLVED
//! RUNNING --(error)--> FAILED ──propagates──> dependents FAILED
//! RUNNING --(returns call C)--> forward(C); dependents re-pointed at C
//! ```
//!
//! Failure propagation is eager: a failed dependency fails every
//! transitive dependent immediately, and their bodies never run.

use crate::broker::ExecutionOutcome;
use crate::errors::CallError;
use crate::storage::{CallRow, StoredOutcome};
use crate::types::{CallId, CallStatus, NodeRef};
use rustc_hash::FxHashMap;
use serde_json::Value;

/// Concrete terminal outcome of a call, after any forwarding.
#[derive(Clone, Debug, PartialEq)]
pub enum TerminalOutcome {
    Value(Value),
    Error(CallError),
}

impl TerminalOutcome {
    fn stored(&self) -> StoredOutcome {
        match self {
            TerminalOutcome::Value(v) => StoredOutcome::Value { value: v.clone() },
            TerminalOutcome::Error(e) => StoredOutcome::Error { error: e.clone() },
        }
    }

    fn status(&self) -> CallStatus {
        match self {
            TerminalOutcome::Value(_) => CallStatus::Resolved,
            TerminalOutcome::Error(_) => CallStatus::Failed,
        }
    }
}

/// Side effects of a state transition, to be carried out by the session.
#[derive(Debug, Default)]
pub struct Effects {
    /// Newly created call records, children before parents.
    pub new_rows: Vec<CallRow>,
    /// Calls whose dependencies are now all resolved.
    pub ready: Vec<CallId>,
    /// Outcome blobs to persist (terminal results, errors, forwards).
    pub outcomes: Vec<(CallId, StoredOutcome)>,
    /// Calls that reached a concrete terminal outcome, aliases included.
    pub terminal: Vec<(CallId, TerminalOutcome)>,
    /// Forwarding links established this transition (caller, target).
    pub forwards: Vec<(CallId, CallId)>,
}

impl Effects {
    pub(crate) fn merge(&mut self, other: Effects) {
        self.new_rows.extend(other.new_rows);
        self.ready.extend(other.ready);
        self.outcomes.extend(other.outcomes);
        self.terminal.extend(other.terminal);
        self.forwards.extend(other.forwards);
    }
}

/// Shape an error takes when it crosses a dependency edge: a plain error
/// is wrapped once in `DependencyFailed`; an already-wrapped error and a
/// session cancellation propagate unchanged.
pub(crate) fn propagated_error(source: CallId, error: &CallError) -> CallError {
    match error {
        CallError::DependencyFailed { .. } | CallError::SessionCancelled => error.clone(),
        other => CallError::dependency(source, other.clone()),
    }
}

pub(crate) struct CallRecord {
    pub(crate) node: NodeRef,
    pub(crate) status: CallStatus,
    /// Unresolved dependencies; the call is ready at zero.
    pub(crate) pending_deps: usize,
    /// Dependents re-checked when this call settles. May contain a waiter
    /// twice when it depends on this call through two distinct edges.
    pub(crate) waiters: Vec<CallId>,
    /// Tail-call target, when the body returned another call.
    pub(crate) forward: Option<CallId>,
    /// Calls aliased to this one by forwarding.
    pub(crate) forwarded_from: Vec<CallId>,
    /// Concrete terminal outcome; `None` while pending or while a forward
    /// chain is still unsettled.
    pub(crate) outcome: Option<TerminalOutcome>,
}

impl CallRecord {
    fn is_settled(&self) -> bool {
        self.outcome.is_some()
    }
}

/// In-memory map of call records for one session. The authoritative state
/// lives in storage; this cache is kept coherent by the completion stream.
#[derive(Default)]
pub struct SchedulerState {
    calls: FxHashMap<CallId, CallRecord>,
}

impl SchedulerState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: CallId) -> bool {
        self.calls.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn status(&self, id: CallId) -> Option<CallStatus> {
        self.calls.get(&id).map(|r| r.status)
    }

    pub(crate) fn node_of(&self, id: CallId) -> Option<NodeRef> {
        self.calls.get(&id).map(|r| r.node.clone())
    }

    /// Concrete terminal outcome, if the call has settled.
    pub(crate) fn settled_outcome(&self, id: CallId) -> Option<TerminalOutcome> {
        self.calls.get(&id).and_then(|r| r.outcome.clone())
    }

    pub(crate) fn insert(&mut self, id: CallId, record: CallRecord) {
        self.calls.insert(id, record);
    }

    pub(crate) fn record_mut(&mut self, id: CallId) -> Option<&mut CallRecord> {
        self.calls.get_mut(&id)
    }

    /// Follow forwarding links to the call currently owning the result.
    pub(crate) fn resolve_alias(&self, id: CallId) -> CallId {
        let mut current = id;
        let mut hops = 0usize;
        while let Some(record) = self.calls.get(&current) {
            match record.forward {
                Some(next) if hops < self.calls.len() => {
                    current = next;
                    hops += 1;
                }
                _ => break,
            }
        }
        current
    }

    /// Claim transition. Accepts a repeat claim of a RUNNING call (a lost
    /// claim being redelivered); refuses settled or forwarded calls.
    pub(crate) fn mark_running(&mut self, id: CallId) -> bool {
        match self.calls.get_mut(&id) {
            Some(record)
                if !record.is_settled()
                    && record.forward.is_none()
                    && matches!(record.status, CallStatus::Ready | CallStatus::Running) =>
            {
                record.status = CallStatus::Running;
                true
            }
            _ => false,
        }
    }

    /// Apply one completion event.
    pub(crate) fn complete(&mut self, id: CallId, outcome: ExecutionOutcome) -> Effects {
        let mut effects = Effects::default();
        let Some(record) = self.calls.get(&id) else {
            return effects;
        };
        // Duplicate delivery of an already-settled completion.
        if record.is_settled() || record.forward.is_some() {
            return effects;
        }

        match outcome {
            ExecutionOutcome::Resolved(value) => {
                self.finalize(id, TerminalOutcome::Value(value), &mut effects);
            }
            ExecutionOutcome::Failed(error) => {
                self.finalize(id, TerminalOutcome::Error(error), &mut effects);
            }
            ExecutionOutcome::Continuation(spec) => {
                let registration = crate::dag::register(self, &spec);
                effects.merge(registration.effects);
                self.forward_to(id, spec.id(), &mut effects);
            }
        }
        effects
    }

    /// Tail-call substitution: re-point the caller's dependents at the
    /// continuation target and leave a forward record behind.
    fn forward_to(&mut self, caller: CallId, target: CallId, effects: &mut Effects) {
        let target = self.resolve_alias(target);
        if target == caller {
            // A forward chain closing on itself can never settle.
            self.finalize(
                caller,
                TerminalOutcome::Error(CallError::execution("continuation cycle detected")),
                effects,
            );
            return;
        }

        let transferred = {
            let record = self
                .calls
                .get_mut(&caller)
                .expect("forwarding caller must exist");
            record.status = CallStatus::Resolved;
            record.forward = Some(target);
            std::mem::take(&mut record.waiters)
        };
        effects.outcomes.push((caller, StoredOutcome::Forward { target }));
        effects.forwards.push((caller, target));

        let target_outcome = self
            .calls
            .get(&target)
            .and_then(|record| record.outcome.clone());
        match target_outcome {
            Some(outcome) => {
                // Already settled: deliver to the transferred waiters and
                // the caller right away.
                self.settle_waiters(target, transferred, &outcome, effects);
                self.finalize(caller, outcome, effects);
            }
            None => {
                let record = self
                    .calls
                    .get_mut(&target)
                    .expect("forward target must be registered");
                record.waiters.extend(transferred);
                record.forwarded_from.push(caller);
            }
        }
    }

    /// Record a concrete terminal outcome and cascade to waiters and
    /// forward aliases.
    pub(crate) fn finalize(
        &mut self,
        id: CallId,
        outcome: TerminalOutcome,
        effects: &mut Effects,
    ) {
        let (waiters, aliases) = {
            let Some(record) = self.calls.get_mut(&id) else {
                return;
            };
            if record.is_settled() {
                return;
            }
            record.status = outcome.status();
            record.outcome = Some(outcome.clone());
            (
                std::mem::take(&mut record.waiters),
                std::mem::take(&mut record.forwarded_from),
            )
        };

        // A forward record in storage stays a redirect; concrete outcomes
        // are persisted only for calls that own their result.
        let is_alias = self
            .calls
            .get(&id)
            .map(|r| r.forward.is_some())
            .unwrap_or(false);
        if !is_alias {
            effects.outcomes.push((id, outcome.stored()));
        }
        effects.terminal.push((id, outcome.clone()));

        self.settle_waiters(id, waiters, &outcome, effects);
        for alias in aliases {
            self.finalize(alias, outcome.clone(), effects);
        }
    }

    /// Deliver a settled outcome to dependents: decrement dependency
    /// counts on success, fail eagerly on error. Errors propagate
    /// unchanged once wrapped: a transitive dependent records the same
    /// `DependencyFailed` as the direct one, keeping the original failing
    /// call visible at every hop.
    fn settle_waiters(
        &mut self,
        source: CallId,
        waiters: Vec<CallId>,
        outcome: &TerminalOutcome,
        effects: &mut Effects,
    ) {
        match outcome {
            TerminalOutcome::Value(_) => {
                for waiter in waiters {
                    if let Some(record) = self.calls.get_mut(&waiter) {
                        record.pending_deps = record.pending_deps.saturating_sub(1);
                        if record.pending_deps == 0 && record.status == CallStatus::Pending {
                            record.status = CallStatus::Ready;
                            effects.ready.push(waiter);
                        }
                    }
                }
            }
            TerminalOutcome::Error(error) => {
                let propagated = propagated_error(source, error);
                let mut unique = waiters;
                unique.dedup();
                for waiter in unique {
                    self.finalize(waiter, TerminalOutcome::Error(propagated.clone()), effects);
                }
            }
        }
    }

    /// Fail every call that has not settled. Forward records keep their
    /// redirect in storage; everything else gets the cancellation error.
    pub(crate) fn cancel_all(&mut self) -> Effects {
        let mut effects = Effects::default();
        let open: Vec<CallId> = self
            .calls
            .iter()
            .filter(|(_, record)| !record.is_settled())
            .map(|(id, _)| *id)
            .collect();
        for id in open {
            if let Some(record) = self.calls.get_mut(&id) {
                if record.is_settled() {
                    continue;
                }
                record.status = CallStatus::Failed;
                record.outcome = Some(TerminalOutcome::Error(CallError::SessionCancelled));
                record.waiters.clear();
                record.forwarded_from.clear();
                if record.forward.is_none() {
                    effects.outcomes.push((
                        id,
                        StoredOutcome::Error {
                            error: CallError::SessionCancelled,
                        },
                    ));
                }
                effects
                    .terminal
                    .push((id, TerminalOutcome::Error(CallError::SessionCancelled)));
            }
        }
        effects
    }
}
