//! ```text
//! Graph::register ──► NodeHandle::call ──► Deferred (content-addressed)
//!                                            │
//!                          Session::execute / RunContext::submit
//!                                            │
//!                       DAG builder ──► SchedulerState ──► Broker ──► Executor
//!                                            │                          │
//!                                            ◄── completion events ─────┘
//!                                            │
//!                                 Storage (status CAS + results)
//! ```
//!
//! Mycelia is a distributed task-graph runtime. Invoking a registered node
//! produces a deferred call: an opaque, content-addressed value that can
//! be passed as an argument to other calls, returned from a node body as a
//! tail call, or submitted for background execution. The runtime
//! materializes those compositions into a dependency DAG, schedules every
//! ready call with maximum parallelism, memoizes identical invocations by
//! content id, persists results through a storage adapter, and distributes
//! work across workers through a broker adapter.

pub mod broker;
pub mod call;
pub mod codec;
pub mod config;
pub mod errors;
pub mod event_bus;
pub mod executor;
pub mod graph;
pub mod identity;
pub mod node;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod types;

mod args;
mod dag;
