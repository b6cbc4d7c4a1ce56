//! Content addressing for calls.
//!
//! Every call is identified by a BLAKE3 hash over its node reference and
//! its argument slots. Embedded calls contribute their own (already
//! computed) ids, so the id of a call is the Merkle root of its argument
//! tree and recursion terminates at literals. Identity-by-content is what
//! gives the runtime memoization and structural sharing without any
//! explicit memo table: the same value used in ten slots is ten references
//! to one call record.
//!
//! Canonical encoding rules:
//! - object keys are sorted lexicographically at every depth;
//! - array order and positional argument order are preserved;
//! - keyword slots are hashed in lexicographic key order;
//! - ordering-only dependencies are hashed as a sorted id list.

use crate::types::{CallId, NodeRef};
use serde_json::Value;

/// Hash input for one argument slot, with child calls reduced to their ids.
#[derive(Clone, Debug)]
pub enum SlotDigest {
    /// Canonical bytes of a literal value.
    Literal(Vec<u8>),
    /// Id of an embedded call.
    Ref(CallId),
    /// Ids of a call group's members, in member order.
    Group(Vec<CallId>),
}

/// Serialize a JSON value into its canonical byte form.
///
/// The encoding is JSON text with objects rewritten in sorted-key order at
/// every nesting level. Two structurally equal values always produce the
/// same bytes regardless of how their maps were built.
#[must_use]
pub fn canonical_encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            // Scalar rendering is stable in serde_json.
            out.extend_from_slice(value.to_string().as_bytes());
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.extend_from_slice(Value::String(key.clone()).to_string().as_bytes());
                out.push(b':');
                write_canonical(&map[key], out);
            }
            out.push(b'}');
        }
    }
}

/// Compute the content id of a call.
///
/// `kwargs` may arrive in any order; they are hashed sorted by key.
/// `after` holds ordering-only dependency ids; they change what the call
/// *is* (a call gated on different predecessors is a different call), so
/// they participate in the hash, sorted for stability.
#[must_use]
pub fn call_id(
    node: &NodeRef,
    args: &[SlotDigest],
    kwargs: &[(String, SlotDigest)],
    after: &[CallId],
) -> CallId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"mycelia.call.v1");
    update_len_prefixed(&mut hasher, node.encode().as_bytes());

    hasher.update(&(args.len() as u64).to_le_bytes());
    for digest in args {
        update_digest(&mut hasher, digest);
    }

    let mut sorted: Vec<&(String, SlotDigest)> = kwargs.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    hasher.update(&(sorted.len() as u64).to_le_bytes());
    for (key, digest) in sorted {
        update_len_prefixed(&mut hasher, key.as_bytes());
        update_digest(&mut hasher, digest);
    }

    let mut gates: Vec<&CallId> = after.iter().collect();
    gates.sort();
    gates.dedup();
    hasher.update(&(gates.len() as u64).to_le_bytes());
    for id in gates {
        hasher.update(id.to_hex().as_bytes());
    }

    CallId::from_bytes(*hasher.finalize().as_bytes())
}

fn update_digest(hasher: &mut blake3::Hasher, digest: &SlotDigest) {
    match digest {
        SlotDigest::Literal(bytes) => {
            hasher.update(b"L");
            update_len_prefixed(hasher, bytes);
        }
        SlotDigest::Ref(id) => {
            hasher.update(b"R");
            hasher.update(id.to_hex().as_bytes());
        }
        SlotDigest::Group(ids) => {
            hasher.update(b"G");
            hasher.update(&(ids.len() as u64).to_le_bytes());
            for id in ids {
                hasher.update(id.to_hex().as_bytes());
            }
        }
    }
}

fn update_len_prefixed(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}
