//! Call-span dispatcher.
//!
//! Not a generic pub/sub pipe: the bus understands the lifecycle it
//! observes. A span opens when an executor claims a call, survives
//! tail-call forwarding (the continuation target inherits the original
//! start time), and closes on the terminal transition, at which point the
//! dispatcher stamps the event with the span's wall time before handing
//! it to the sinks. A tail-call chain therefore reports one duration,
//! measured from the first claim to the final resolution.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::event::{CallPhase, Event};
use super::sink::{EventSink, StdOutSink};
use crate::types::CallId;

enum Op {
    Emit(Event),
    Close(oneshot::Sender<()>),
}

/// Cloneable producer handle held by the session, worker loops, and node
/// run contexts.
#[derive(Clone)]
pub struct TraceEmitter {
    tx: flume::Sender<Op>,
}

impl TraceEmitter {
    /// Queue an event for dispatch. Returns `false` once the bus has
    /// shut down.
    pub fn emit(&self, event: Event) -> bool {
        self.tx.send(Op::Emit(event)).is_ok()
    }
}

/// Owns the dispatch worker and the sink set for one session.
pub struct EventBus {
    tx: flume::Sender<Op>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_sink(StdOutSink::default())
    }
}

impl EventBus {
    pub fn with_sink<T: EventSink + 'static>(sink: T) -> Self {
        Self::with_sinks(vec![Box::new(sink)])
    }

    /// Start the dispatch worker over the given sinks. Sinks are fixed
    /// for the life of the bus; they move into the worker task.
    pub fn with_sinks(sinks: Vec<Box<dyn EventSink>>) -> Self {
        let (tx, rx) = flume::unbounded();
        let worker = tokio::spawn(dispatch(rx, sinks));
        Self {
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Producer handle for emitting events into this bus.
    pub fn emitter(&self) -> TraceEmitter {
        TraceEmitter {
            tx: self.tx.clone(),
        }
    }

    /// Drain everything queued so far, then stop the dispatcher.
    pub async fn shutdown(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let (ack_tx, ack_rx) = oneshot::channel();
            if self.tx.send(Op::Close(ack_tx)).is_ok() {
                let _ = ack_rx.await;
            }
            let _ = worker.await;
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

async fn dispatch(rx: flume::Receiver<Op>, mut sinks: Vec<Box<dyn EventSink>>) {
    let mut open_spans: FxHashMap<CallId, DateTime<Utc>> = FxHashMap::default();
    while let Ok(op) = rx.recv_async().await {
        match op {
            Op::Emit(event) => {
                let event = track_span(&mut open_spans, event);
                for sink in sinks.iter_mut() {
                    if let Err(e) = sink.handle(&event) {
                        eprintln!("event sink error: {e}");
                    }
                }
            }
            Op::Close(ack) => {
                let _ = ack.send(());
                break;
            }
        }
    }
}

/// Fold a lifecycle event into the open-span table.
///
/// Aliased terminal events (a forwarding caller settling when its target
/// does) carry no open span of their own and pass through unstamped.
fn track_span(open: &mut FxHashMap<CallId, DateTime<Utc>>, event: Event) -> Event {
    let Event::Call(mut ev) = event else {
        return event;
    };
    match ev.phase {
        CallPhase::SpanStart => {
            // A span transferred here by a forwarding caller keeps the
            // caller's earlier start.
            open.entry(ev.call_id).or_insert(ev.when);
        }
        CallPhase::Forwarded => {
            if let (Some(start), Some(target)) = (open.remove(&ev.call_id), ev.forwarded_to) {
                let inherited = open.entry(target).or_insert(start);
                if *inherited > start {
                    *inherited = start;
                }
            }
        }
        CallPhase::Resolved | CallPhase::Failed => {
            if let Some(start) = open.remove(&ev.call_id) {
                ev.elapsed_ms = Some((ev.when - start).num_milliseconds());
            }
        }
    }
    Event::Call(ev)
}

#[cfg(test)]
mod tests {
    use super::super::event::CallEvent;
    use super::super::sink::TraceLog;
    use super::*;
    use crate::identity::call_id;
    use crate::types::NodeRef;
    use chrono::Duration;

    fn some_id(n: &str) -> CallId {
        call_id(&NodeRef::new("t", n), &[], &[], &[])
    }

    fn at(event: CallEvent, when: DateTime<Utc>) -> Event {
        let mut event = event;
        event.when = when;
        Event::Call(event)
    }

    #[tokio::test]
    async fn terminal_events_are_stamped_with_span_time() {
        let log = TraceLog::new();
        let bus = EventBus::with_sink(log.clone());
        let emitter = bus.emitter();
        let id = some_id("a");
        let t0 = Utc::now();

        emitter.emit(at(CallEvent::new(id, "t/a", CallPhase::SpanStart), t0));
        emitter.emit(at(
            CallEvent::new(id, "t/a", CallPhase::Resolved),
            t0 + Duration::milliseconds(40),
        ));
        bus.shutdown().await;

        let events = log.events();
        assert_eq!(events.len(), 2);
        match &events[1] {
            Event::Call(ev) => assert_eq!(ev.elapsed_ms, Some(40)),
            other => panic!("expected call event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forwarded_span_measures_the_whole_chain() {
        let log = TraceLog::new();
        let bus = EventBus::with_sink(log.clone());
        let emitter = bus.emitter();
        let (a, b) = (some_id("a"), some_id("b"));
        let t0 = Utc::now();

        emitter.emit(at(CallEvent::new(a, "t/a", CallPhase::SpanStart), t0));
        emitter.emit(at(
            {
                let mut ev = CallEvent::new(a, "t/a", CallPhase::Forwarded);
                ev.forwarded_to = Some(b);
                ev
            },
            t0 + Duration::milliseconds(10),
        ));
        // b's own claim comes later; the inherited start wins.
        emitter.emit(at(
            CallEvent::new(b, "t/b", CallPhase::SpanStart),
            t0 + Duration::milliseconds(15),
        ));
        emitter.emit(at(
            CallEvent::new(b, "t/b", CallPhase::Resolved),
            t0 + Duration::milliseconds(60),
        ));
        bus.shutdown().await;

        let terminal = log
            .events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Call(ev) if ev.phase.is_terminal() => Some(ev),
                _ => None,
            })
            .next()
            .expect("terminal event");
        assert_eq!(terminal.call_id, b);
        assert_eq!(terminal.elapsed_ms, Some(60));
    }

    #[tokio::test]
    async fn non_lifecycle_events_pass_through_unchanged() {
        let log = TraceLog::new();
        let bus = EventBus::with_sink(log.clone());
        bus.emitter().emit(Event::diagnostic("test", "hello"));
        bus.shutdown().await;
        assert_eq!(log.events(), vec![Event::diagnostic("test", "hello")]);
    }

    #[tokio::test]
    async fn shutdown_drains_the_queue_and_stops_accepting() {
        let log = TraceLog::new();
        let bus = EventBus::with_sink(log.clone());
        let emitter = bus.emitter();
        for i in 0..20 {
            emitter.emit(Event::diagnostic("test", format!("{i}")));
        }
        bus.shutdown().await;
        assert_eq!(log.events().len(), 20);
        assert!(!emitter.emit(Event::diagnostic("test", "late")));
    }
}
