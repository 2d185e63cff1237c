//! Pluggable payload codecs.
//!
//! A codec maps application values to the byte payloads carried inside
//! MSG frames. The trait is object-safe so endpoints can hold
//! `Arc<dyn Codec<T>>` without threading a generic parameter through the
//! whole protocol stack. Decode failures are suppressed at the runtime
//! boundary: the frame is dropped and logged, the session continues.

use crate::error::CodecError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Byte-level encoding of one application value type.
pub trait Codec<T>: Send + Sync {
    /// Encode a value into the MSG payload bytes.
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode MSG payload bytes back into a value.
    ///
    /// Implementations may fail on arbitrary input; the runtime swallows
    /// the error and drops the frame.
    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// Default codec: UTF-8 JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.into()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.into()))
    }
}

/// Compact binary codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl<T> Codec<T> for BincodeCodec
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(value).map_err(|e| CodecError::Encode(e.into()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.into()))
    }
}

/// Wire codec selection carried by the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireCodec {
    /// UTF-8 JSON ([`JsonCodec`]).
    #[default]
    Json,
    /// Compact binary ([`BincodeCodec`]).
    Binary,
}

/// Resolve a configured codec kind for a concrete value type.
pub fn select<T>(kind: WireCodec) -> Arc<dyn Codec<T>>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    match kind {
        WireCodec::Json => json::<T>(),
        WireCodec::Binary => binary::<T>(),
    }
}

/// Shared JSON codec handle for a concrete value type.
pub fn json<T>() -> Arc<dyn Codec<T>>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    Arc::new(JsonCodec)
}

/// Shared bincode codec handle for a concrete value type.
pub fn binary<T>() -> Arc<dyn Codec<T>>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    Arc::new(BincodeCodec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        val: i64,
        tag: String,
    }

    #[test]
    fn test_json_round_trip() {
        let codec = JsonCodec;
        let value = Sample {
            val: 21,
            tag: "double".into(),
        };

        let bytes = codec.encode(&value).unwrap();
        let back: Sample = codec.decode(&bytes).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_json_is_utf8() {
        let bytes = JsonCodec.encode(&Sample { val: 1, tag: "x".into() }).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains("\"val\":1"));
    }

    #[test]
    fn test_json_decode_error_is_reported() {
        let result: Result<Sample, _> = JsonCodec.decode(b"\x00not json");
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_bincode_round_trip() {
        let codec = BincodeCodec;
        let value = Sample {
            val: -7,
            tag: "bin".into(),
        };

        let bytes = codec.encode(&value).unwrap();
        let back: Sample = codec.decode(&bytes).unwrap();
        assert_eq!(back, value);
    }
}
