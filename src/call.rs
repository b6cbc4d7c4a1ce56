//! Deferred call values and the call-construction algebra.
//!
//! Invoking a registered node does not run anything: it produces a
//! [`Deferred`], an opaque handle standing in for the node's eventual
//! result. Deferred values compose three ways:
//!
//! - passed as an argument to another call (a data dependency),
//! - returned from a node body (a tail call; the returned call supplants
//!   the caller in the dependency graph),
//! - submitted through [`RunContext::submit`](crate::node::RunContext::submit)
//!   for background execution with no dependency edge.
//!
//! A call's identity is the content hash of its node reference and
//! argument slots (see [`crate::identity`]); building the same invocation
//! twice yields the same call.
//!
//! # Examples
//!
//! ```rust,no_run
//! # use mycelia::call::Deferred;
//! # use mycelia::graph::NodeHandle;
//! # fn example(add: NodeHandle, double: NodeHandle) -> Result<(), mycelia::call::CallBuildError> {
//! // double(add(1, 2)): `add` runs first, its result feeds `double`.
//! let sum: Deferred = add.call().arg(1)?.arg(2)?.build()?;
//! let call: Deferred = double.call().arg_call(&sum).build()?;
//! # Ok(())
//! # }
//! ```

use crate::graph::NodeSchema;
use crate::identity::{self, SlotDigest};
use crate::types::{CallId, NodeRef};
use miette::Diagnostic;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Marker key a serialized [`Deferred`] call handle emits. The argument
/// walker uses it to reject handles buried inside container literals.
pub(crate) const DEFERRED_SENTINEL_KEY: &str = "__mycelia.deferred__";

/// One argument slot of a call.
#[derive(Clone, Debug)]
pub enum Slot {
    /// A concrete JSON value.
    Literal(Value),
    /// An embedded call whose result fills the slot.
    Call(Arc<CallSpec>),
    /// A group of calls materializing as an array of their results,
    /// in member order.
    Group(Vec<Arc<CallSpec>>),
}

/// Serializable slot form with child calls reduced to their ids; this is
/// what storage adapters persist and executors read back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "slot", rename_all = "snake_case")]
pub enum StoredSlot {
    Literal { value: Value },
    Ref { id: CallId },
    Group { ids: Vec<CallId> },
}

impl Slot {
    fn digest(&self) -> SlotDigest {
        match self {
            Slot::Literal(v) => SlotDigest::Literal(identity::canonical_encode(v)),
            Slot::Call(spec) => SlotDigest::Ref(spec.id()),
            Slot::Group(members) => SlotDigest::Group(members.iter().map(|m| m.id()).collect()),
        }
    }

    fn stored(&self) -> StoredSlot {
        match self {
            Slot::Literal(v) => StoredSlot::Literal { value: v.clone() },
            Slot::Call(spec) => StoredSlot::Ref { id: spec.id() },
            Slot::Group(members) => StoredSlot::Group {
                ids: members.iter().map(|m| m.id()).collect(),
            },
        }
    }
}

/// Fully specified invocation of one node: the central entity of the
/// runtime. Immutable once constructed; the content id is computed at
/// construction time, so equal specs are interchangeable.
#[derive(Clone, Debug)]
pub struct CallSpec {
    node: NodeRef,
    args: Vec<Slot>,
    kwargs: Vec<(String, Slot)>,
    after: Vec<Arc<CallSpec>>,
    id: CallId,
}

impl CallSpec {
    pub(crate) fn new(
        node: NodeRef,
        args: Vec<Slot>,
        kwargs: Vec<(String, Slot)>,
        after: Vec<Arc<CallSpec>>,
    ) -> Self {
        let arg_digests: Vec<SlotDigest> = args.iter().map(Slot::digest).collect();
        let kwarg_digests: Vec<(String, SlotDigest)> = kwargs
            .iter()
            .map(|(k, s)| (k.clone(), s.digest()))
            .collect();
        let gate_ids: Vec<CallId> = after.iter().map(|a| a.id()).collect();
        let id = identity::call_id(&node, &arg_digests, &kwarg_digests, &gate_ids);
        Self {
            node,
            args,
            kwargs,
            after,
            id,
        }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn node(&self) -> &NodeRef {
        &self.node
    }

    /// Direct child calls: embedded argument calls, group members, and
    /// ordering-only gates. Deduplicated by id, in first-appearance order.
    pub fn children(&self) -> Vec<Arc<CallSpec>> {
        let mut seen = Vec::new();
        let mut out: Vec<Arc<CallSpec>> = Vec::new();
        let mut push = |spec: &Arc<CallSpec>, seen: &mut Vec<CallId>, out: &mut Vec<Arc<CallSpec>>| {
            if !seen.contains(&spec.id()) {
                seen.push(spec.id());
                out.push(Arc::clone(spec));
            }
        };
        for slot in self.args.iter().chain(self.kwargs.iter().map(|(_, s)| s)) {
            match slot {
                Slot::Literal(_) => {}
                Slot::Call(spec) => push(spec, &mut seen, &mut out),
                Slot::Group(members) => {
                    for member in members {
                        push(member, &mut seen, &mut out);
                    }
                }
            }
        }
        for gate in &self.after {
            push(gate, &mut seen, &mut out);
        }
        out
    }

    /// Positional slots in their persisted form.
    pub fn stored_args(&self) -> Vec<StoredSlot> {
        self.args.iter().map(Slot::stored).collect()
    }

    /// Keyword slots in their persisted form, in declaration order.
    pub fn stored_kwargs(&self) -> Vec<(String, StoredSlot)> {
        self.kwargs
            .iter()
            .map(|(k, s)| (k.clone(), s.stored()))
            .collect()
    }

    /// Ids of ordering-only dependencies.
    pub fn gate_ids(&self) -> Vec<CallId> {
        self.after.iter().map(|a| a.id()).collect()
    }
}

impl PartialEq for CallSpec {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CallSpec {}

impl std::hash::Hash for CallSpec {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Opaque handle for a value that may not exist yet.
///
/// `Deferred<O>` is either a not-yet-executed call or a concrete value.
/// User code treats it as opaque: store it, pass it as an argument, gate
/// other calls on it, or return it from a node body. The type parameter
/// documents the node's declared result type; the runtime transports
/// results as JSON and does not inspect `O`.
///
/// Serializing a `Deferred::Call` emits a private marker object, which is
/// how the argument walker catches handles smuggled inside ordinary
/// container literals.
#[derive(Clone, Debug)]
pub enum Deferred<O = Value> {
    /// A pending call.
    Call(Arc<CallSpec>),
    /// An already concrete value.
    Value(O),
}

impl<O> Deferred<O> {
    /// The call id, when this handle is a pending call.
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            Deferred::Call(spec) => Some(spec.id()),
            Deferred::Value(_) => None,
        }
    }

    pub(crate) fn spec(&self) -> Option<&Arc<CallSpec>> {
        match self {
            Deferred::Call(spec) => Some(spec),
            Deferred::Value(_) => None,
        }
    }

    /// Gate `next` on this call: `next` will not start until this call has
    /// resolved, without consuming its value. Gating on an already
    /// concrete value is a no-op.
    ///
    /// ```rust,no_run
    /// # use mycelia::call::Deferred;
    /// # use mycelia::graph::NodeHandle;
    /// # fn example(a: NodeHandle, b: NodeHandle) -> Result<(), mycelia::call::CallBuildError> {
    /// let first: Deferred = a.call().build()?;
    /// let second: Deferred = first.then(b.call()).build()?;
    /// # Ok(())
    /// # }
    /// ```
    #[must_use]
    pub fn then(&self, next: CallBuilder) -> CallBuilder {
        match self {
            Deferred::Call(spec) => next.after_spec(Arc::clone(spec)),
            Deferred::Value(_) => next,
        }
    }
}

impl<O: Serialize> Serialize for Deferred<O> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Deferred::Value(v) => v.serialize(serializer),
            Deferred::Call(spec) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(DEFERRED_SENTINEL_KEY, &spec.id().to_hex())?;
                map.end()
            }
        }
    }
}

/// An ordered collection of pending calls usable as a single argument
/// slot; it materializes as the array of member results.
///
/// ```rust,no_run
/// # use mycelia::call::{CallGroup, Deferred};
/// # use mycelia::graph::NodeHandle;
/// # fn example(child: NodeHandle, parent: NodeHandle) -> Result<(), mycelia::call::CallBuildError> {
/// let mut group = CallGroup::new();
/// for i in 0..3 {
///     let member: Deferred = child.call().arg(i)?.build()?;
///     group = group.with(&member);
/// }
/// let all: Deferred = parent.call().arg_group(group).build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct CallGroup {
    members: Vec<Arc<CallSpec>>,
}

impl CallGroup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pending call to the group. A `Deferred::Value` member is
    /// rejected at build time by the walker, not here, so collection
    /// loops stay infallible.
    #[must_use]
    pub fn with<O>(mut self, member: &Deferred<O>) -> Self {
        if let Deferred::Call(spec) = member {
            self.members.push(Arc::clone(spec));
        }
        self
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub(crate) fn into_members(self) -> Vec<Arc<CallSpec>> {
        self.members
    }
}

/// Errors surfaced while constructing a call.
#[derive(Debug, Error, Diagnostic)]
pub enum CallBuildError {
    #[error("node `{node}` takes {expected} positional argument(s), got {got}")]
    #[diagnostic(
        code(mycelia::call::arity),
        help("Check the node's schema: positional count and variadic flag.")
    )]
    ArityMismatch {
        node: NodeRef,
        expected: usize,
        got: usize,
    },

    #[error("node `{node}` has no keyword parameter `{name}`")]
    #[diagnostic(code(mycelia::call::unknown_keyword))]
    UnknownKeyword { node: NodeRef, name: String },

    #[error("keyword `{name}` supplied twice")]
    #[diagnostic(code(mycelia::call::duplicate_keyword))]
    DuplicateKeyword { name: String },

    #[error("argument `{slot}` could not be serialized: {reason}")]
    #[diagnostic(code(mycelia::call::non_serializable_argument))]
    NonSerializableArgument { slot: String, reason: String },

    #[error("argument `{slot}` does not encode deterministically")]
    #[diagnostic(
        code(mycelia::call::non_deterministic_argument),
        help("Argument types must serialize to the same JSON on every pass.")
    )]
    NonDeterministicArgument { slot: String },

    #[error("argument `{slot}` buries a deferred call inside a container")]
    #[diagnostic(
        code(mycelia::call::unreachable_deferred_call),
        help("Pass deferred calls as direct arguments or through a CallGroup.")
    )]
    UnreachableDeferredCall { slot: String },
}

#[derive(Clone, Debug)]
pub(crate) enum RawArg {
    Literal { value: Value, deterministic: bool },
    Unserializable { reason: String },
    Call(Arc<CallSpec>),
    Group(Vec<Arc<CallSpec>>),
}

/// Fluent constructor for one call against a node's schema.
///
/// Obtained from [`NodeHandle::call`](crate::graph::NodeHandle::call).
/// Literal arguments are serialized eagerly; schema validation and the
/// container-nesting check run in [`build`](Self::build).
#[derive(Clone, Debug)]
pub struct CallBuilder {
    node: NodeRef,
    schema: NodeSchema,
    args: Vec<RawArg>,
    kwargs: Vec<(String, RawArg)>,
    after: Vec<Arc<CallSpec>>,
}

impl CallBuilder {
    pub(crate) fn new(node: NodeRef, schema: NodeSchema) -> Self {
        Self {
            node,
            schema,
            args: Vec::new(),
            kwargs: Vec::new(),
            after: Vec::new(),
        }
    }

    fn raw_literal<T: Serialize>(value: &T) -> RawArg {
        let first = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                return RawArg::Unserializable {
                    reason: e.to_string(),
                }
            }
        };
        // Encode twice; a mismatch means the type's serialization is not
        // stable and the content id would be meaningless.
        let second = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                return RawArg::Unserializable {
                    reason: e.to_string(),
                }
            }
        };
        RawArg::Literal {
            deterministic: first == second,
            value: first,
        }
    }

    /// Append a positional literal argument.
    pub fn arg<T: Serialize>(mut self, value: T) -> Result<Self, CallBuildError> {
        self.args.push(Self::raw_literal(&value));
        Ok(self)
    }

    /// Append a positional argument fed by another call's result.
    #[must_use]
    pub fn arg_call<O>(mut self, value: &Deferred<O>) -> Self
    where
        O: Serialize + Clone,
    {
        match value {
            Deferred::Call(spec) => self.args.push(RawArg::Call(Arc::clone(spec))),
            Deferred::Value(v) => self.args.push(Self::raw_literal(v)),
        }
        self
    }

    /// Append a positional argument fed by a group of calls.
    #[must_use]
    pub fn arg_group(mut self, group: CallGroup) -> Self {
        self.args.push(RawArg::Group(group.into_members()));
        self
    }

    /// Set a keyword literal argument.
    pub fn kwarg<T: Serialize>(
        mut self,
        name: impl Into<String>,
        value: T,
    ) -> Result<Self, CallBuildError> {
        self.kwargs.push((name.into(), Self::raw_literal(&value)));
        Ok(self)
    }

    /// Set a keyword argument fed by another call's result.
    #[must_use]
    pub fn kwarg_call<O>(mut self, name: impl Into<String>, value: &Deferred<O>) -> Self
    where
        O: Serialize + Clone,
    {
        let raw = match value {
            Deferred::Call(spec) => RawArg::Call(Arc::clone(spec)),
            Deferred::Value(v) => Self::raw_literal(v),
        };
        self.kwargs.push((name.into(), raw));
        self
    }

    /// Set a keyword argument fed by a group of calls.
    #[must_use]
    pub fn kwarg_group(mut self, name: impl Into<String>, group: CallGroup) -> Self {
        self.kwargs
            .push((name.into(), RawArg::Group(group.into_members())));
        self
    }

    /// Gate this call on another call resolving first, without taking its
    /// value as an argument.
    #[must_use]
    pub fn after<O>(self, dep: &Deferred<O>) -> Self {
        match dep {
            Deferred::Call(spec) => self.after_spec(Arc::clone(spec)),
            Deferred::Value(_) => self,
        }
    }

    pub(crate) fn after_spec(mut self, spec: Arc<CallSpec>) -> Self {
        if !self.after.iter().any(|a| a.id() == spec.id()) {
            self.after.push(spec);
        }
        self
    }

    /// Validate against the node schema and produce the deferred call.
    pub fn build<O>(self) -> Result<Deferred<O>, CallBuildError> {
        let (args, kwargs) =
            crate::args::normalize(&self.node, &self.schema, self.args, self.kwargs)?;
        let spec = CallSpec::new(self.node, args, kwargs, self.after);
        Ok(Deferred::Call(Arc::new(spec)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeSchema;
    use serde_json::json;

    fn builder(node: &str, schema: NodeSchema) -> CallBuilder {
        CallBuilder::new(NodeRef::new("test", node), schema)
    }

    #[test]
    fn identical_invocations_share_an_id() {
        let a: Deferred = builder("n", NodeSchema::positional(2))
            .arg(1)
            .unwrap()
            .arg("x")
            .unwrap()
            .build()
            .unwrap();
        let b: Deferred = builder("n", NodeSchema::positional(2))
            .arg(1)
            .unwrap()
            .arg("x")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(a.call_id(), b.call_id());
    }

    #[test]
    fn argument_values_distinguish_calls() {
        let a: Deferred = builder("n", NodeSchema::positional(1))
            .arg(1)
            .unwrap()
            .build()
            .unwrap();
        let b: Deferred = builder("n", NodeSchema::positional(1))
            .arg(2)
            .unwrap()
            .build()
            .unwrap();
        assert_ne!(a.call_id(), b.call_id());
    }

    #[test]
    fn embedded_call_becomes_a_child() {
        let child: Deferred = builder("child", NodeSchema::positional(0))
            .build()
            .unwrap();
        let parent: Deferred = builder("parent", NodeSchema::positional(1))
            .arg_call(&child)
            .build()
            .unwrap();
        let spec = parent.spec().unwrap();
        let children = spec.children();
        assert_eq!(children.len(), 1);
        assert_eq!(Some(children[0].id()), child.call_id());
    }

    #[test]
    fn shared_child_is_one_dependency() {
        let child: Deferred = builder("child", NodeSchema::positional(0))
            .build()
            .unwrap();
        let mut b = builder("parent", NodeSchema::variadic());
        for _ in 0..10 {
            b = b.arg_call(&child);
        }
        let parent: Deferred = b.build().unwrap();
        assert_eq!(parent.spec().unwrap().children().len(), 1);
    }

    #[test]
    fn group_members_are_children_in_order() {
        let c1: Deferred = builder("c1", NodeSchema::positional(0)).build().unwrap();
        let c2: Deferred = builder("c2", NodeSchema::positional(0)).build().unwrap();
        let group = CallGroup::new().with(&c1).with(&c2);
        let parent: Deferred = builder("parent", NodeSchema::positional(1))
            .arg_group(group)
            .build()
            .unwrap();
        let spec = parent.spec().unwrap();
        assert_eq!(spec.children().len(), 2);
        match &spec.stored_args()[0] {
            StoredSlot::Group { ids } => {
                assert_eq!(ids[0], c1.call_id().unwrap());
                assert_eq!(ids[1], c2.call_id().unwrap());
            }
            other => panic!("expected group slot, got {other:?}"),
        }
    }

    #[test]
    fn gates_change_identity_but_not_arguments() {
        let dep: Deferred = builder("dep", NodeSchema::positional(0)).build().unwrap();
        let plain: Deferred = builder("n", NodeSchema::positional(0)).build().unwrap();
        let gated: Deferred = dep
            .then(builder("n", NodeSchema::positional(0)))
            .build()
            .unwrap();
        assert_ne!(plain.call_id(), gated.call_id());
        assert!(gated.spec().unwrap().stored_args().is_empty());
        assert_eq!(
            gated.spec().unwrap().gate_ids(),
            vec![dep.call_id().unwrap()]
        );
    }

    #[test]
    fn deferred_value_serializes_as_its_value() {
        let d: Deferred<i64> = Deferred::Value(41);
        assert_eq!(serde_json::to_value(&d).unwrap(), json!(41));
    }

    #[test]
    fn deferred_call_serializes_as_sentinel() {
        let d: Deferred = builder("n", NodeSchema::positional(0)).build().unwrap();
        let v = serde_json::to_value(&d).unwrap();
        assert!(v.get(DEFERRED_SENTINEL_KEY).is_some());
    }

    #[test]
    fn value_variant_passed_as_argument_is_a_literal() {
        let d: Deferred<i64> = Deferred::Value(5);
        let call: Deferred = builder("n", NodeSchema::positional(1))
            .arg_call(&d)
            .build()
            .unwrap();
        match &call.spec().unwrap().stored_args()[0] {
            StoredSlot::Literal { value } => assert_eq!(value, &json!(5)),
            other => panic!("expected literal slot, got {other:?}"),
        }
    }
}
