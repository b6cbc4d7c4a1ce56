use std::io::{self, Result as IoResult, Stdout, Write};
use std::sync::{Arc, Mutex};

use super::event::{CallPhase, Event};
use crate::types::CallId;

/// Output target for dispatched events.
pub trait EventSink: Sync + Send {
    /// Handle one event. The sink decides how to render it.
    fn handle(&mut self, event: &Event) -> IoResult<()>;
}

/// Line-per-event stdout sink for development runs.
pub struct StdOutSink {
    handle: Stdout,
}

impl Default for StdOutSink {
    fn default() -> Self {
        Self {
            handle: io::stdout(),
        }
    }
}

impl EventSink for StdOutSink {
    fn handle(&mut self, event: &Event) -> IoResult<()> {
        writeln!(self.handle, "{event}")?;
        self.handle.flush()
    }
}

/// Shared in-memory trace of a session's call lifecycle.
///
/// Cloneable: the bus writes through one handle while a test holds
/// another. Beyond the raw event list it answers the questions suites
/// actually ask about a run, such as which phases a call moved through
/// and how long its span took.
#[derive(Clone, Default)]
pub struct TraceLog {
    inner: Arc<Mutex<Vec<Event>>>,
}

impl TraceLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event observed so far, in dispatch order.
    pub fn events(&self) -> Vec<Event> {
        self.inner.lock().unwrap().clone()
    }

    /// Lifecycle phases recorded for one call, in order.
    pub fn phases(&self, call_id: CallId) -> Vec<CallPhase> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                Event::Call(ev) if ev.call_id == call_id => Some(ev.phase),
                _ => None,
            })
            .collect()
    }

    /// Number of calls observed reaching a terminal phase.
    pub fn terminal_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .filter(|event| matches!(event, Event::Call(ev) if ev.phase.is_terminal()))
            .count()
    }

    /// Span wall time stamped on a call's terminal event, if any.
    pub fn span_millis(&self, call_id: CallId) -> Option<i64> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .find_map(|event| match event {
                Event::Call(ev) if ev.call_id == call_id && ev.phase.is_terminal() => {
                    ev.elapsed_ms
                }
                _ => None,
            })
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

impl EventSink for TraceLog {
    fn handle(&mut self, event: &Event) -> IoResult<()> {
        self.inner.lock().unwrap().push(event.clone());
        Ok(())
    }
}
