//! At-least-once delivery under lost claims: the body may run more than
//! once, but the status compare-and-swap lets exactly one result land.

mod common;

use common::{setup, RunCounter};

use async_trait::async_trait;
use mycelia::broker::InMemoryBroker;
use mycelia::call::Deferred;
use mycelia::config::{EventBusConfig, RuntimeConfig, SinkConfig};
use mycelia::graph::{NodeHandle, NodeSchema};
use mycelia::node::{CallInput, CallOutput, NodeError, NodeHandler, RunContext};
use mycelia::session::Session;
use mycelia::storage::{Storage, StoredOutcome};
use mycelia::types::CallStatus;
use std::sync::Arc;
use std::time::Duration;

/// Slow body that reports which run it was. Idempotent in effect: only
/// one of the reported ordinals may ever be recorded.
struct SlowOrdinal {
    delay: Duration,
    runs: RunCounter,
}

#[async_trait]
impl NodeHandler for SlowOrdinal {
    async fn run(&self, _ctx: RunContext, _input: CallInput) -> Result<CallOutput, NodeError> {
        let ordinal = self.runs.bump();
        tokio::time::sleep(self.delay).await;
        CallOutput::value(ordinal as i64)
    }
}

#[tokio::test]
async fn lost_claim_reruns_the_body_but_stores_one_result() {
    let (graph, _ignored, storage) = setup("redelivery");
    // Visibility timeout far shorter than the body: the first claim is
    // "lost" while its executor is still working, and a second executor
    // picks the call up.
    let broker = Arc::new(InMemoryBroker::with_visibility_timeout(
        Duration::from_millis(50),
    ));
    let runs = RunCounter::new();
    let node: NodeHandle<i64> = graph
        .register(
            "slow",
            NodeSchema::positional(0),
            SlowOrdinal {
                delay: Duration::from_millis(300),
                runs: runs.clone(),
            },
        )
        .unwrap();

    let config = RuntimeConfig::default()
        .with_worker_concurrency(4)
        .with_event_bus(EventBusConfig {
            sinks: vec![SinkConfig::Memory],
        });
    let session = Session::open(graph, broker, storage.clone(), config)
        .await
        .unwrap();

    let call: Deferred<i64> = node.call().build().unwrap();
    let id = call.call_id().unwrap();
    let result = session.execute(&call).await.unwrap();

    // Give the late executor time to finish and lose the CAS.
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(runs.get() >= 2, "expected a redelivered execution");
    let row = storage.get_call(id).await.unwrap().unwrap();
    assert_eq!(row.status, CallStatus::Resolved);
    // The stored value is the CAS winner's, and execute() saw the same.
    assert_eq!(
        row.result,
        Some(StoredOutcome::Value {
            value: serde_json::json!(result)
        })
    );

    session.close().await;
}

#[tokio::test]
async fn prompt_ack_prevents_redelivery() {
    let (graph, _ignored, storage) = setup("ack");
    let broker = Arc::new(InMemoryBroker::with_visibility_timeout(
        Duration::from_millis(80),
    ));
    let runs = RunCounter::new();
    let node: NodeHandle<i64> = graph
        .register(
            "fast",
            NodeSchema::positional(0),
            SlowOrdinal {
                delay: Duration::from_millis(5),
                runs: runs.clone(),
            },
        )
        .unwrap();

    let config = RuntimeConfig::default()
        .with_worker_concurrency(4)
        .with_event_bus(EventBusConfig {
            sinks: vec![SinkConfig::Memory],
        });
    let session = Session::open(graph, broker, storage.clone(), config)
        .await
        .unwrap();

    let call: Deferred<i64> = node.call().build().unwrap();
    assert_eq!(session.execute(&call).await.unwrap(), 1);

    // Well past the visibility timeout: an unacked claim would have been
    // redelivered and re-run by now.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(runs.get(), 1);

    session.close().await;
}
