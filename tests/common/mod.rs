//! Shared fixtures for the session integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use mycelia::broker::InMemoryBroker;
use mycelia::graph::Graph;
use mycelia::node::{CallInput, CallOutput, NodeError, NodeHandler, RunContext};
use mycelia::storage::InMemoryStorage;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn setup(graph_name: &str) -> (Arc<Graph>, Arc<InMemoryBroker>, Arc<InMemoryStorage>) {
    (
        Arc::new(Graph::new(graph_name)),
        Arc::new(InMemoryBroker::new()),
        Arc::new(InMemoryStorage::new()),
    )
}

/// Counts how many times the body ran across the whole suite run.
#[derive(Clone, Default)]
pub struct RunCounter(Arc<AtomicUsize>);

impl RunCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Increment and return the one-based run ordinal.
    pub fn bump(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Returns its first positional argument unchanged.
pub struct Echo {
    pub runs: RunCounter,
}

#[async_trait]
impl NodeHandler for Echo {
    async fn run(&self, _ctx: RunContext, input: CallInput) -> Result<CallOutput, NodeError> {
        self.runs.bump();
        let value: serde_json::Value = input.arg(0)?;
        Ok(CallOutput::Value(value))
    }
}

/// Sleeps for a fixed duration, then returns its argument.
pub struct Sleeper {
    pub delay: Duration,
    pub runs: RunCounter,
}

#[async_trait]
impl NodeHandler for Sleeper {
    async fn run(&self, _ctx: RunContext, input: CallInput) -> Result<CallOutput, NodeError> {
        self.runs.bump();
        tokio::time::sleep(self.delay).await;
        let value: serde_json::Value = input.arg(0)?;
        Ok(CallOutput::Value(value))
    }
}

/// Always fails with the given message.
pub struct Failing {
    pub message: &'static str,
    pub runs: RunCounter,
}

#[async_trait]
impl NodeHandler for Failing {
    async fn run(&self, _ctx: RunContext, _input: CallInput) -> Result<CallOutput, NodeError> {
        self.runs.bump();
        Err(NodeError::msg(self.message))
    }
}

/// Sums all numeric positional arguments.
pub struct Sum {
    pub runs: RunCounter,
}

#[async_trait]
impl NodeHandler for Sum {
    async fn run(&self, _ctx: RunContext, input: CallInput) -> Result<CallOutput, NodeError> {
        self.runs.bump();
        let mut total = 0i64;
        for index in 0..input.args.len() {
            total += input.arg::<i64>(index)?;
        }
        CallOutput::value(total)
    }
}
