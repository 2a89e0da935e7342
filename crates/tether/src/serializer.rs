//! Pluggable payload encoding.
//!
//! The engine moves values through serde's data model (`serde_json::Value`)
//! and only asks the serializer to turn them into bytes and back. Swapping
//! JSON for a binary format is a matter of implementing [`Serializer`].

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::bytes::Bytes;

use crate::error::RpcError;

pub trait Serializer: Send + Sync + 'static {
    fn serialize(&self, value: &serde_json::Value) -> Result<Bytes, RpcError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value, RpcError>;
}

/// Default serializer: UTF-8 JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &serde_json::Value) -> Result<Bytes, RpcError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(RpcError::serialization)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value, RpcError> {
        serde_json::from_slice(bytes).map_err(RpcError::serialization)
    }
}

/// Convert a typed value into the engine's value model.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<serde_json::Value, RpcError> {
    serde_json::to_value(value).map_err(RpcError::serialization)
}

/// Convert from the engine's value model into a typed value.
pub fn from_value<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, RpcError> {
    serde_json::from_value(value).map_err(RpcError::serialization)
}

/// Encode a typed envelope with `serializer`.
pub(crate) fn encode<T: Serialize>(serializer: &dyn Serializer, value: &T) -> Result<Bytes, RpcError> {
    serializer.serialize(&to_value(value)?)
}

/// Decode a typed envelope with `serializer`.
pub(crate) fn decode<T: DeserializeOwned>(
    serializer: &dyn Serializer,
    bytes: &[u8],
) -> Result<T, RpcError> {
    from_value(serializer.deserialize(bytes)?)
}

/// Flatten call arguments into the positional list carried on the wire.
///
/// Tuples and sequences become one entry per element, `()` becomes an empty
/// list and anything else is a single argument.
pub fn positional_args<A: Serialize + ?Sized>(args: &A) -> Result<Vec<serde_json::Value>, RpcError> {
    Ok(match to_value(args)? {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Null => Vec::new(),
        other => vec![other],
    })
}
