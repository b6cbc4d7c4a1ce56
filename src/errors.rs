//! Call outcome errors.
//!
//! A [`CallError`] is data, not control flow: it is recorded against a call
//! in storage, shipped across the broker inside completion events, and
//! propagated along the dependents set. Host-level error types
//! (`BrokerError`, `StorageError`, ...) live next to their adapters and are
//! reserved for infrastructure faults the runtime recovers from locally.

use crate::types::CallId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal error descriptor for a failed call.
///
/// Serializes into the call's result blob. Failure of a dependency wraps
/// the inner error unchanged, so the root cause survives any number of
/// propagation hops.
///
/// # Examples
///
/// ```rust
/// use mycelia::errors::CallError;
///
/// let err = CallError::execution("index out of bounds");
/// let json = serde_json::to_string(&err).unwrap();
/// let back: CallError = serde_json::from_str(&json).unwrap();
/// assert_eq!(err, back);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallError {
    /// The call references a node name absent from the graph.
    NodeNotRegistered { node: String },

    /// The codec rejected the node body's return value.
    NonSerializableResult { reason: String },

    /// The codec rejected an argument literal.
    NonSerializableArgument { slot: String, reason: String },

    /// An argument literal produced different encodings across passes.
    NonDeterministicArgument { slot: String },

    /// A deferred call was nested inside a container literal instead of
    /// occupying an argument slot (or a group) directly.
    UnreachableDeferredCall { slot: String },

    /// The node body returned an error.
    NodeExecutionFailure { message: String },

    /// A dependency failed; this call's body never ran.
    DependencyFailed {
        dependency: CallId,
        inner: Box<CallError>,
    },

    /// The owning session was torn down before the call reached a
    /// terminal state.
    SessionCancelled,
}

impl CallError {
    pub fn execution(message: impl Into<String>) -> Self {
        CallError::NodeExecutionFailure {
            message: message.into(),
        }
    }

    pub fn dependency(dependency: CallId, inner: CallError) -> Self {
        CallError::DependencyFailed {
            dependency,
            inner: Box::new(inner),
        }
    }

    /// Walk `DependencyFailed` wrappers down to the originating error.
    #[must_use]
    pub fn root_cause(&self) -> &CallError {
        match self {
            CallError::DependencyFailed { inner, .. } => inner.root_cause(),
            other => other,
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::NodeNotRegistered { node } => {
                write!(f, "node `{node}` is not registered")
            }
            CallError::NonSerializableResult { reason } => {
                write!(f, "result could not be serialized: {reason}")
            }
            CallError::NonSerializableArgument { slot, reason } => {
                write!(f, "argument `{slot}` could not be serialized: {reason}")
            }
            CallError::NonDeterministicArgument { slot } => {
                write!(f, "argument `{slot}` does not encode deterministically")
            }
            CallError::UnreachableDeferredCall { slot } => {
                write!(
                    f,
                    "argument `{slot}` buries a deferred call inside a container; \
                     pass it as a direct argument or through a group"
                )
            }
            CallError::NodeExecutionFailure { message } => {
                write!(f, "node body failed: {message}")
            }
            CallError::DependencyFailed { dependency, inner } => {
                write!(f, "dependency {} failed: {inner}", dependency.short())
            }
            CallError::SessionCancelled => write!(f, "session cancelled"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallError::DependencyFailed { inner, .. } => Some(inner.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::call_id;
    use crate::types::NodeRef;

    #[test]
    fn dependency_failure_preserves_root_cause() {
        let leaf = call_id(&NodeRef::new("g", "leaf"), &[], &[], &[]);
        let mid = call_id(&NodeRef::new("g", "mid"), &[], &[], &[]);
        let inner = CallError::execution("boom");
        let wrapped = CallError::dependency(mid, CallError::dependency(leaf, inner.clone()));
        assert_eq!(wrapped.root_cause(), &inner);
    }

    #[test]
    fn serde_round_trip_keeps_nesting() {
        let dep = call_id(&NodeRef::new("g", "leaf"), &[], &[], &[]);
        let err = CallError::dependency(dep, CallError::execution("boom"));
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(serde_json::from_str::<CallError>(&json).unwrap(), err);
    }
}
