//! DAG builder: turns a call's argument tree into scheduler state.
//!
//! Registration is post-order (children before parents), so every child
//! id is known when the parent record is created, and the resulting
//! subgraph is acyclic by construction: a cycle would need a call whose
//! content id depends on its own id.
//!
//! Structural sharing falls out of content addressing: a call id already
//! present in the scheduler is skipped, so the same deferred value used in
//! ten slots contributes one record and one dependency edge per waiter.

use crate::call::CallSpec;
use crate::scheduler::{propagated_error, CallRecord, Effects, SchedulerState, TerminalOutcome};
use crate::storage::CallRow;
use crate::types::{CallId, CallStatus};
use std::sync::Arc;

/// Result of inserting a call tree.
pub(crate) struct Registration {
    pub root: CallId,
    pub effects: Effects,
}

/// Insert `spec` and all transitive children into the scheduler.
pub(crate) fn register(state: &mut SchedulerState, spec: &Arc<CallSpec>) -> Registration {
    let mut effects = Effects::default();
    register_spec(state, spec, &mut effects);
    Registration {
        root: spec.id(),
        effects,
    }
}

fn register_spec(state: &mut SchedulerState, spec: &Arc<CallSpec>, effects: &mut Effects) {
    if state.contains(spec.id()) {
        return;
    }

    let children = spec.children();
    for child in &children {
        register_spec(state, child, effects);
    }

    // Count unresolved dependencies and wire the reverse edges. A child
    // that already forwarded attaches the waiter at the end of its
    // forward chain, where the result will eventually land.
    let mut pending = 0usize;
    let mut failed_dep: Option<(CallId, crate::errors::CallError)> = None;
    for child in &children {
        let target = state.resolve_alias(child.id());
        match state.settled_outcome(target) {
            Some(TerminalOutcome::Value(_)) => {}
            Some(TerminalOutcome::Error(error)) => {
                if failed_dep.is_none() {
                    failed_dep = Some((target, error));
                }
            }
            None => {
                pending += 1;
                if let Some(record) = state.record_mut(target) {
                    record.waiters.push(spec.id());
                }
            }
        }
    }

    let status = if pending == 0 && failed_dep.is_none() {
        CallStatus::Ready
    } else {
        CallStatus::Pending
    };
    state.insert(
        spec.id(),
        CallRecord {
            node: spec.node().clone(),
            status,
            pending_deps: pending,
            waiters: Vec::new(),
            forward: None,
            forwarded_from: Vec::new(),
            outcome: None,
        },
    );
    effects.new_rows.push(CallRow::new(
        spec.id(),
        spec.node().clone(),
        spec.stored_args(),
        spec.stored_kwargs(),
        spec.gate_ids(),
        status,
    ));

    if let Some((dep, error)) = failed_dep {
        // A dependency already failed: this call never runs.
        let propagated = propagated_error(dep, &error);
        state.finalize(spec.id(), TerminalOutcome::Error(propagated), effects);
    } else if pending == 0 {
        effects.ready.push(spec.id());
    }
}
