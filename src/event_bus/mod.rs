//! Structured lifecycle events and the span-aware bus dispatching them.
//!
//! The scheduler emits a span-start event when a call moves READY→RUNNING
//! and a span-end event on every terminal transition; node bodies can emit
//! their own scoped messages through
//! [`RunContext::emit`](crate::node::RunContext::emit). The bus tracks
//! open spans across tail-call forwards and stamps terminal events with
//! wall time before fanning them out to the configured sinks.

mod bus;
mod event;
mod sink;

pub use bus::{EventBus, TraceEmitter};
pub use event::{CallEvent, CallPhase, DiagnosticEvent, Event, NodeMessageEvent};
pub use sink::{EventSink, StdOutSink, TraceLog};
