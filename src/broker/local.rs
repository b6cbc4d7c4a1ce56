//! In-process broker backed by unbounded channels.
//!
//! Faithful to the wire contract: claims carry a visibility timeout and an
//! unacknowledged claim is pushed back onto the queue, so at-least-once
//! redelivery is observable in a single process exactly as it would be
//! against a real message queue.

use super::{Broker, BrokerError, Claim, CompletionEvent};
use crate::types::CallId;
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct BrokerInner {
    queue_tx: flume::Sender<CallId>,
    queue_rx: flume::Receiver<CallId>,
    completion_tx: flume::Sender<CompletionEvent>,
    completion_rx: flume::Receiver<CompletionEvent>,
    inflight: Mutex<FxHashMap<Uuid, CallId>>,
    visibility_timeout: Duration,
}

/// Channel-backed [`Broker`] for tests and single-process sessions.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

    #[must_use]
    pub fn new() -> Self {
        Self::with_visibility_timeout(Self::DEFAULT_VISIBILITY_TIMEOUT)
    }

    /// Broker whose unacked claims are redelivered after `timeout`.
    #[must_use]
    pub fn with_visibility_timeout(timeout: Duration) -> Self {
        let (queue_tx, queue_rx) = flume::unbounded();
        let (completion_tx, completion_rx) = flume::unbounded();
        Self {
            inner: Arc::new(BrokerInner {
                queue_tx,
                queue_rx,
                completion_tx,
                completion_rx,
                inflight: Mutex::new(FxHashMap::default()),
                visibility_timeout: timeout,
            }),
        }
    }

    /// Number of claims currently held by executors.
    pub fn inflight_len(&self) -> usize {
        self.inner.inflight.lock().len()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn unavailable(reason: &str) -> BrokerError {
    BrokerError::Unavailable {
        reason: reason.to_string(),
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, call_id: CallId) -> Result<(), BrokerError> {
        self.inner
            .queue_tx
            .send(call_id)
            .map_err(|_| unavailable("queue closed"))
    }

    async fn claim(&self) -> Result<Claim, BrokerError> {
        let call_id = self
            .inner
            .queue_rx
            .recv_async()
            .await
            .map_err(|_| unavailable("queue closed"))?;
        let token = Uuid::new_v4();
        self.inner.inflight.lock().insert(token, call_id);

        // Visibility timer: if the claim is still open when it fires, the
        // call goes back on the queue for another worker.
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.visibility_timeout).await;
            let expired = inner.inflight.lock().remove(&token);
            if let Some(id) = expired {
                let _ = inner.queue_tx.send(id);
            }
        });

        Ok(Claim { call_id, token })
    }

    async fn ack(&self, claim: &Claim) -> Result<(), BrokerError> {
        self.inner.inflight.lock().remove(&claim.token);
        Ok(())
    }

    async fn nack(&self, claim: &Claim) -> Result<(), BrokerError> {
        let held = self.inner.inflight.lock().remove(&claim.token);
        if held.is_some() {
            self.inner
                .queue_tx
                .send(claim.call_id)
                .map_err(|_| unavailable("queue closed"))?;
        }
        Ok(())
    }

    async fn publish_completion(&self, event: CompletionEvent) -> Result<(), BrokerError> {
        self.inner
            .completion_tx
            .send(event)
            .map_err(|_| unavailable("completion channel closed"))
    }

    fn completions(&self) -> flume::Receiver<CompletionEvent> {
        self.inner.completion_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::call_id;
    use crate::types::NodeRef;

    fn some_id(n: &str) -> CallId {
        call_id(&NodeRef::new("g", n), &[], &[], &[])
    }

    #[tokio::test]
    async fn publish_claim_ack_round_trip() {
        let broker = InMemoryBroker::new();
        let id = some_id("a");
        broker.publish(id).await.unwrap();
        let claim = broker.claim().await.unwrap();
        assert_eq!(claim.call_id, id);
        broker.ack(&claim).await.unwrap();
        assert_eq!(broker.inflight_len(), 0);
    }

    #[tokio::test]
    async fn nack_requeues_immediately() {
        let broker = InMemoryBroker::new();
        let id = some_id("a");
        broker.publish(id).await.unwrap();
        let claim = broker.claim().await.unwrap();
        broker.nack(&claim).await.unwrap();
        let again = broker.claim().await.unwrap();
        assert_eq!(again.call_id, id);
        assert_ne!(again.token, claim.token);
    }

    #[tokio::test]
    async fn unacked_claim_is_redelivered_after_visibility_timeout() {
        let broker = InMemoryBroker::with_visibility_timeout(Duration::from_millis(30));
        let id = some_id("a");
        broker.publish(id).await.unwrap();
        let claim = broker.claim().await.unwrap();
        // Simulated crash: the claim is never acked.
        drop(claim);
        let redelivered =
            tokio::time::timeout(Duration::from_secs(2), broker.claim()).await.unwrap().unwrap();
        assert_eq!(redelivered.call_id, id);
    }

    #[tokio::test]
    async fn ack_beats_the_visibility_timer() {
        let broker = InMemoryBroker::with_visibility_timeout(Duration::from_millis(30));
        let id = some_id("a");
        broker.publish(id).await.unwrap();
        let claim = broker.claim().await.unwrap();
        broker.ack(&claim).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        // Nothing should have been redelivered.
        assert!(broker.inner.queue_rx.is_empty());
    }

    #[tokio::test]
    async fn per_producer_order_is_preserved() {
        let broker = InMemoryBroker::new();
        let ids = [some_id("a"), some_id("b"), some_id("c")];
        for id in ids {
            broker.publish(id).await.unwrap();
        }
        for expected in ids {
            assert_eq!(broker.claim().await.unwrap().call_id, expected);
        }
    }
}
