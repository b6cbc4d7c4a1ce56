//! Graph registry: the namespace in which calls resolve their target node.
//!
//! A [`Graph`] is a named, register-once collection of nodes. Registration
//! happens at process start and yields a typed [`NodeHandle`] used to
//! construct calls; the graph seals itself when a session first opens over
//! it and rejects registrations afterwards. Every worker that serves a
//! graph must register the same nodes under the same names.
//!
//! # Examples
//!
//! ```rust
//! use mycelia::graph::{Graph, NodeSchema};
//! use mycelia::node::{CallInput, CallOutput, NodeError, NodeHandler, RunContext};
//! use async_trait::async_trait;
//!
//! struct Hello;
//!
//! #[async_trait]
//! impl NodeHandler for Hello {
//!     async fn run(&self, _ctx: RunContext, _input: CallInput) -> Result<CallOutput, NodeError> {
//!         println!("Hello, World!");
//!         Ok(CallOutput::unit())
//!     }
//! }
//!
//! let graph = Graph::new("demo");
//! let hello: mycelia::graph::NodeHandle = graph
//!     .register("hello", NodeSchema::positional(0), Hello)
//!     .unwrap();
//! let call = hello.call().build::<serde_json::Value>().unwrap();
//! ```

use crate::call::CallBuilder;
use crate::node::NodeHandler;
use crate::types::NodeRef;
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

/// Declared argument shape of a node: positional-only count, an optional
/// variadic positional tail, named keyword-only parameters, and an
/// optional variadic keyword flag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeSchema {
    positional: usize,
    variadic_positional: bool,
    keywords: Vec<String>,
    variadic_keywords: bool,
}

impl NodeSchema {
    /// Exactly `count` positional parameters, no keywords.
    #[must_use]
    pub fn positional(count: usize) -> Self {
        Self {
            positional: count,
            variadic_positional: false,
            keywords: Vec::new(),
            variadic_keywords: false,
        }
    }

    /// Any number of positional arguments.
    #[must_use]
    pub fn variadic() -> Self {
        Self {
            positional: 0,
            variadic_positional: true,
            keywords: Vec::new(),
            variadic_keywords: false,
        }
    }

    /// Allow extra positional arguments beyond the declared count.
    #[must_use]
    pub fn with_variadic_positional(mut self) -> Self {
        self.variadic_positional = true;
        self
    }

    /// Declare named keyword-only parameters.
    #[must_use]
    pub fn with_keywords<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords.extend(names.into_iter().map(Into::into));
        self
    }

    /// Accept keyword arguments beyond the declared names.
    #[must_use]
    pub fn with_variadic_keywords(mut self) -> Self {
        self.variadic_keywords = true;
        self
    }

    pub fn positional_count(&self) -> usize {
        self.positional
    }

    pub fn is_variadic(&self) -> bool {
        self.variadic_positional
    }

    pub fn accepts_keyword(&self, name: &str) -> bool {
        self.variadic_keywords || self.keywords.iter().any(|k| k == name)
    }
}

/// Registered node: stable name, schema, and the executable body.
pub(crate) struct NodeEntry {
    pub(crate) node_ref: NodeRef,
    pub(crate) schema: NodeSchema,
    pub(crate) handler: Arc<dyn NodeHandler>,
}

/// Typed handle to a registered node; the entry point for constructing
/// calls. The type parameter documents the node's declared result type
/// and flows into the [`Deferred`](crate::call::Deferred) values the
/// builder produces.
pub struct NodeHandle<O = Value> {
    entry: Arc<NodeEntry>,
    _out: PhantomData<fn() -> O>,
}

impl<O> Clone for NodeHandle<O> {
    fn clone(&self) -> Self {
        Self {
            entry: Arc::clone(&self.entry),
            _out: PhantomData,
        }
    }
}

impl<O> std::fmt::Debug for NodeHandle<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("node_ref", &self.entry.node_ref)
            .finish()
    }
}

impl<O> NodeHandle<O> {
    /// Start building a call against this node.
    #[must_use]
    pub fn call(&self) -> CallBuilder {
        CallBuilder::new(self.entry.node_ref.clone(), self.entry.schema.clone())
    }

    pub fn node_ref(&self) -> &NodeRef {
        &self.entry.node_ref
    }
}

/// Registration failures.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("node `{node}` is already registered in graph `{graph}`")]
    #[diagnostic(
        code(mycelia::graph::duplicate_node),
        help("Node names must be unique within a graph.")
    )]
    DuplicateNode { graph: String, node: String },

    #[error("graph `{graph}` is sealed; register nodes before opening a session")]
    #[diagnostic(code(mycelia::graph::sealed))]
    Sealed { graph: String },
}

/// Named namespace of nodes. Cheap to share (`Arc` internally is not
/// required; `Graph` is usually wrapped in an `Arc` by the session).
pub struct Graph {
    name: String,
    nodes: RwLock<FxHashMap<String, Arc<NodeEntry>>>,
    sealed: RwLock<bool>,
}

impl Graph {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: RwLock::new(FxHashMap::default()),
            sealed: RwLock::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a node under a stable, graph-unique name.
    pub fn register<O>(
        &self,
        name: impl Into<String>,
        schema: NodeSchema,
        handler: impl NodeHandler + 'static,
    ) -> Result<NodeHandle<O>, GraphError> {
        let name = name.into();
        if *self.sealed.read() {
            return Err(GraphError::Sealed {
                graph: self.name.clone(),
            });
        }
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&name) {
            return Err(GraphError::DuplicateNode {
                graph: self.name.clone(),
                node: name,
            });
        }
        let entry = Arc::new(NodeEntry {
            node_ref: NodeRef::new(self.name.clone(), name.clone()),
            schema,
            handler: Arc::new(handler),
        });
        nodes.insert(name, Arc::clone(&entry));
        Ok(NodeHandle {
            entry,
            _out: PhantomData,
        })
    }

    /// Freeze the registry; called when a session opens over this graph.
    pub(crate) fn seal(&self) {
        *self.sealed.write() = true;
    }

    pub(crate) fn entry(&self, node: &str) -> Option<Arc<NodeEntry>> {
        self.nodes.read().get(node).cloned()
    }
}
