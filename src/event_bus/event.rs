use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::CallId;

/// Structured event flowing through the [`EventBus`](super::EventBus).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// Call lifecycle transition observed by the scheduler.
    Call(CallEvent),
    /// Message emitted by a node body through its run context.
    Node(NodeMessageEvent),
    /// Runtime diagnostics (worker loops, adapters).
    Diagnostic(DiagnosticEvent),
}

impl Event {
    pub fn span_start(call_id: CallId, node: impl Into<String>) -> Self {
        Event::Call(CallEvent::new(call_id, node, CallPhase::SpanStart))
    }

    pub fn span_end(call_id: CallId, node: impl Into<String>, phase: CallPhase) -> Self {
        Event::Call(CallEvent::new(call_id, node, phase))
    }

    /// A tail call: the caller's span continues at `target`.
    pub fn forwarded(call_id: CallId, target: CallId, node: impl Into<String>) -> Self {
        let mut event = CallEvent::new(call_id, node, CallPhase::Forwarded);
        event.forwarded_to = Some(target);
        Event::Call(event)
    }

    pub fn node_message(
        call_id: CallId,
        scope: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Event::Node(NodeMessageEvent {
            call_id,
            scope: scope.into(),
            message: message.into(),
        })
    }

    pub fn diagnostic(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Event::Diagnostic(DiagnosticEvent {
            scope: scope.into(),
            message: message.into(),
        })
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Call(ev) => {
                write!(f, "[{}] {} {}", ev.call_id.short(), ev.node, ev.phase)?;
                if let Some(target) = ev.forwarded_to {
                    write!(f, " -> {}", target.short())?;
                }
                if let Some(elapsed) = ev.elapsed_ms {
                    write!(f, " ({elapsed}ms)")?;
                }
                Ok(())
            }
            Event::Node(ev) => {
                write!(f, "[{}] {}: {}", ev.call_id.short(), ev.scope, ev.message)
            }
            Event::Diagnostic(ev) => write!(f, "[{}] {}", ev.scope, ev.message),
        }
    }
}

/// Where in its lifecycle a call was observed.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    /// READY→RUNNING: an executor claimed the call.
    SpanStart,
    /// Terminal with a value.
    Resolved,
    /// Terminal with an error descriptor.
    Failed,
    /// The body returned another call; the span continues there.
    Forwarded,
}

impl CallPhase {
    /// Phases that close a span.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallPhase::Resolved | CallPhase::Failed)
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallPhase::SpanStart => write!(f, "started"),
            CallPhase::Resolved => write!(f, "resolved"),
            CallPhase::Failed => write!(f, "failed"),
            CallPhase::Forwarded => write!(f, "forwarded"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallEvent {
    pub call_id: CallId,
    pub node: String,
    pub phase: CallPhase,
    pub when: DateTime<Utc>,
    /// Continuation target, set on `Forwarded` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_to: Option<CallId>,
    /// Wall time since the span opened. Stamped by the bus on terminal
    /// phases; covers the whole forward chain for tail calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<i64>,
}

impl CallEvent {
    pub fn new(call_id: CallId, node: impl Into<String>, phase: CallPhase) -> Self {
        Self {
            call_id,
            node: node.into(),
            phase,
            when: Utc::now(),
            forwarded_to: None,
            elapsed_ms: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeMessageEvent {
    pub call_id: CallId,
    pub scope: String,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiagnosticEvent {
    pub scope: String,
    pub message: String,
}
