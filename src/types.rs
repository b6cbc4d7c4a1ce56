//! Core identifier and state types for the Mycelia runtime.
//!
//! This module defines the fundamental vocabulary shared by every layer of
//! the crate: content-addressed call identifiers, node references, and the
//! call lifecycle states tracked by the scheduler and persisted by storage
//! adapters.
//!
//! # Key Types
//!
//! - [`CallId`]: BLAKE3 content hash identifying one call (node + arguments)
//! - [`NodeRef`]: fully qualified (graph, node) name pair a call targets
//! - [`CallStatus`]: lifecycle state of a call record
//!
//! # Examples
//!
//! ```rust
//! use mycelia::types::{CallStatus, NodeRef};
//!
//! let node = NodeRef::new("billing", "charge_card");
//! assert_eq!(node.encode(), "billing/charge_card");
//! assert_eq!(NodeRef::decode("billing/charge_card"), node);
//!
//! assert!(CallStatus::Resolved.is_terminal());
//! assert!(!CallStatus::Running.is_terminal());
//! ```

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Content-addressed identifier of a single call.
///
/// A `CallId` is the BLAKE3 hash of the call's node reference and its
/// canonically encoded argument slots (child calls contribute their own
/// ids, making the hash a Merkle root of the argument tree). Two calls
/// with the same id are the same call; the scheduler stores at most one
/// record per id.
///
/// Serialized as a lowercase hex string for storage and wire use.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId([u8; 32]);

impl CallId {
    pub(crate) fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Full lowercase hex form, suitable as a storage key.
    #[must_use]
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for byte in self.0 {
            use fmt::Write;
            let _ = write!(out, "{byte:02x}");
        }
        out
    }

    /// Parse the hex form produced by [`to_hex`](Self::to_hex).
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != 64 || !s.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[i] = ((hi << 4) | lo) as u8;
        }
        Some(Self(bytes))
    }

    /// Abbreviated prefix used in logs and event output.
    #[must_use]
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallId({})", self.short())
    }
}

impl Serialize for CallId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for CallId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        CallId::parse(&s).ok_or_else(|| D::Error::custom("invalid call id hex"))
    }
}

/// Fully qualified reference to a registered node: graph name + node name.
///
/// Calls resolve their target through a `NodeRef`; the pair must be stable
/// across every worker process sharing the graph.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub graph: String,
    pub node: String,
}

impl NodeRef {
    pub fn new(graph: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            graph: graph.into(),
            node: node.into(),
        }
    }

    /// Encode into the persisted `graph/node` string form.
    #[must_use]
    pub fn encode(&self) -> String {
        format!("{}/{}", self.graph, self.node)
    }

    /// Decode the persisted string form. Input without a separator is
    /// treated as a node in the default (empty-named) graph.
    pub fn decode(s: &str) -> Self {
        match s.split_once('/') {
            Some((graph, node)) => Self::new(graph, node),
            None => Self::new("", s),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.graph, self.node)
    }
}

/// Lifecycle state of a call record.
///
/// ```text
/// PENDING --(all deps resolved)--> READY --(claimed)--> RUNNING
/// RUNNING --> RESOLVED | FAILED        (terminal)
/// ```
///
/// A call whose body returns another call is recorded as `Resolved` with a
/// forwarding target rather than a value; storage keeps the redirect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Registered, waiting on at least one unresolved dependency.
    Pending,
    /// All dependencies resolved; eligible for claim by an executor.
    Ready,
    /// Claimed by exactly one executor.
    Running,
    /// Terminal: a value or forwarding target is recorded.
    Resolved,
    /// Terminal: an error descriptor is recorded.
    Failed,
}

impl CallStatus {
    /// Encode into the persisted string form used by storage adapters.
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            CallStatus::Pending => "pending",
            CallStatus::Ready => "ready",
            CallStatus::Running => "running",
            CallStatus::Resolved => "resolved",
            CallStatus::Failed => "failed",
        }
    }

    /// Decode the persisted string form; unknown input maps to `Pending`.
    pub fn decode(s: &str) -> Self {
        match s {
            "ready" => CallStatus::Ready,
            "running" => CallStatus::Running,
            "resolved" => CallStatus::Resolved,
            "failed" => CallStatus::Failed,
            _ => CallStatus::Pending,
        }
    }

    /// Terminal states admit no further transitions.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Resolved | CallStatus::Failed)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encode())
    }
}
