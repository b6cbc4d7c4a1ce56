//! Argument tree walker.
//!
//! Normalizes the raw positional and keyword inputs collected by a
//! [`CallBuilder`](crate::call::CallBuilder) into validated argument
//! slots. The walk is shallow on purpose: a deferred call must occupy an
//! argument slot directly (or sit in an explicit group); a call handle
//! discovered *inside* a container literal is rejected so the dependency
//! graph always stays explicit.

use crate::call::{CallBuildError, RawArg, Slot, DEFERRED_SENTINEL_KEY};
use crate::graph::NodeSchema;
use crate::types::NodeRef;
use serde_json::Value;

/// Validate raw inputs against `schema` and produce final slots.
pub(crate) fn normalize(
    node: &NodeRef,
    schema: &NodeSchema,
    args: Vec<RawArg>,
    kwargs: Vec<(String, RawArg)>,
) -> Result<(Vec<Slot>, Vec<(String, Slot)>), CallBuildError> {
    let expected = schema.positional_count();
    if args.len() < expected || (args.len() > expected && !schema.is_variadic()) {
        return Err(CallBuildError::ArityMismatch {
            node: node.clone(),
            expected,
            got: args.len(),
        });
    }

    for (i, (name, _)) in kwargs.iter().enumerate() {
        if kwargs[..i].iter().any(|(seen, _)| seen == name) {
            return Err(CallBuildError::DuplicateKeyword { name: name.clone() });
        }
        if !schema.accepts_keyword(name) {
            return Err(CallBuildError::UnknownKeyword {
                node: node.clone(),
                name: name.clone(),
            });
        }
    }

    let mut out_args = Vec::with_capacity(args.len());
    for (index, raw) in args.into_iter().enumerate() {
        out_args.push(check_slot(raw, &index.to_string())?);
    }

    let mut out_kwargs = Vec::with_capacity(kwargs.len());
    for (name, raw) in kwargs {
        let slot = check_slot(raw, &name)?;
        out_kwargs.push((name, slot));
    }

    Ok((out_args, out_kwargs))
}

fn check_slot(raw: RawArg, slot_name: &str) -> Result<Slot, CallBuildError> {
    match raw {
        RawArg::Unserializable { reason } => Err(CallBuildError::NonSerializableArgument {
            slot: slot_name.to_string(),
            reason,
        }),
        RawArg::Literal {
            value,
            deterministic,
        } => {
            if !deterministic {
                return Err(CallBuildError::NonDeterministicArgument {
                    slot: slot_name.to_string(),
                });
            }
            if contains_sentinel(&value) {
                return Err(CallBuildError::UnreachableDeferredCall {
                    slot: slot_name.to_string(),
                });
            }
            Ok(Slot::Literal(value))
        }
        RawArg::Call(spec) => Ok(Slot::Call(spec)),
        RawArg::Group(members) => Ok(Slot::Group(members)),
    }
}

/// A serialized `Deferred::Call` anywhere in a literal marks the slot as
/// unusable. That includes a bare handle passed through the literal path,
/// which has already lost its spec.
fn contains_sentinel(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            map.contains_key(DEFERRED_SENTINEL_KEY) || map.values().any(contains_sentinel)
        }
        Value::Array(items) => items.iter().any(contains_sentinel),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{CallBuilder, CallGroup, Deferred};
    use crate::graph::NodeSchema;

    fn builder(schema: NodeSchema) -> CallBuilder {
        CallBuilder::new(NodeRef::new("test", "n"), schema)
    }

    fn pending() -> Deferred {
        CallBuilder::new(NodeRef::new("test", "dep"), NodeSchema::positional(0))
            .build()
            .unwrap()
    }

    #[test]
    fn rejects_missing_positional_arguments() {
        let err = builder(NodeSchema::positional(2))
            .arg(1)
            .unwrap()
            .build::<serde_json::Value>()
            .unwrap_err();
        assert!(matches!(err, CallBuildError::ArityMismatch { got: 1, .. }));
    }

    #[test]
    fn rejects_extra_positional_arguments_unless_variadic() {
        let err = builder(NodeSchema::positional(0))
            .arg(1)
            .unwrap()
            .build::<serde_json::Value>()
            .unwrap_err();
        assert!(matches!(err, CallBuildError::ArityMismatch { .. }));

        let ok = builder(NodeSchema::variadic())
            .arg(1)
            .unwrap()
            .arg(2)
            .unwrap()
            .build::<serde_json::Value>();
        assert!(ok.is_ok());
    }

    #[test]
    fn rejects_unknown_keyword() {
        let err = builder(NodeSchema::positional(0).with_keywords(["label"]))
            .kwarg("colour", "red")
            .unwrap()
            .build::<serde_json::Value>()
            .unwrap_err();
        assert!(matches!(err, CallBuildError::UnknownKeyword { name, .. } if name == "colour"));
    }

    #[test]
    fn variadic_keywords_accept_anything() {
        let ok = builder(NodeSchema::positional(0).with_variadic_keywords())
            .kwarg("anything", 1)
            .unwrap()
            .build::<serde_json::Value>();
        assert!(ok.is_ok());
    }

    #[test]
    fn rejects_duplicate_keyword() {
        let err = builder(NodeSchema::positional(0).with_keywords(["label"]))
            .kwarg("label", "a")
            .unwrap()
            .kwarg("label", "b")
            .unwrap()
            .build::<serde_json::Value>()
            .unwrap_err();
        assert!(matches!(err, CallBuildError::DuplicateKeyword { .. }));
    }

    #[test]
    fn rejects_deferred_buried_in_container() {
        let dep = pending();
        let err = builder(NodeSchema::positional(1))
            .arg(vec![dep])
            .unwrap()
            .build::<serde_json::Value>()
            .unwrap_err();
        assert!(matches!(
            err,
            CallBuildError::UnreachableDeferredCall { slot } if slot == "0"
        ));
    }

    #[test]
    fn rejects_deferred_through_literal_path() {
        let dep = pending();
        let err = builder(NodeSchema::positional(1))
            .arg(&dep)
            .unwrap()
            .build::<serde_json::Value>()
            .unwrap_err();
        assert!(matches!(err, CallBuildError::UnreachableDeferredCall { .. }));
    }

    #[test]
    fn group_slot_is_the_sanctioned_fanin() {
        let group = CallGroup::new().with(&pending());
        let ok = builder(NodeSchema::positional(1))
            .arg_group(group)
            .build::<serde_json::Value>();
        assert!(ok.is_ok());
    }

    #[test]
    fn keyword_slot_names_appear_in_errors() {
        let dep = pending();
        let err = builder(NodeSchema::positional(0).with_keywords(["values"]))
            .kwarg("values", vec![dep])
            .unwrap()
            .build::<serde_json::Value>()
            .unwrap_err();
        assert!(matches!(
            err,
            CallBuildError::UnreachableDeferredCall { slot } if slot == "values"
        ));
    }
}
