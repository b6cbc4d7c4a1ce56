//! Result and argument encoding.
//!
//! Storage adapters persist values through a configurable [`Codec`]; the
//! default renders compact JSON text. The executor also runs every result
//! through the session codec before reporting it, so a value the codec
//! cannot represent fails the call with `NonSerializableResult` instead of
//! failing a later storage write.

use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CodecError {
    #[error("value could not be encoded: {reason}")]
    #[diagnostic(code(mycelia::codec::encode))]
    Encode { reason: String },

    #[error("blob could not be decoded: {reason}")]
    #[diagnostic(code(mycelia::codec::decode))]
    Decode { reason: String },
}

/// Bidirectional value/blob conversion used at the storage boundary.
pub trait Codec: Send + Sync {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

/// Default codec: compact JSON text.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode {
            reason: e.to_string(),
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_codec_round_trip() {
        let codec = JsonCodec;
        let value = json!({"a": [1, 2, 3], "b": null});
        let bytes = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), value);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(JsonCodec.decode(b"not json").is_err());
    }
}
