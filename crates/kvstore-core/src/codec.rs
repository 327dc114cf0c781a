//! Pluggable entity wire encoding.
//!
//! JSON is the default, with field names and casing exactly as the
//! entity's own `Serialize` impl produces them (callers who want
//! camelCase apply `#[serde(rename_all = "camelCase")]` to their own
//! entity type). Backends that want a compact binary form can swap in
//! [`MsgPackCodec`] without changing any other code, since both
//! round-trip the same [`crate::entity::Envelope`] shape.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::StoreError;

/// Encodes and decodes a value to/from its on-disk or on-wire byte form.
pub trait Codec: Send + Sync + 'static {
    /// Serialize a value.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, StoreError>;

    /// Deserialize a value previously produced by [`Codec::encode`].
    fn decode<T: DeserializeOwned>(&self, key: &str, bytes: &[u8]) -> Result<T, StoreError>;
}

/// Default codec: JSON with stable field ordering.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(value).map_err(|e| StoreError::Backend(e.into()))
    }

    fn decode<T: DeserializeOwned>(&self, key: &str, bytes: &[u8]) -> Result<T, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization {
            key: key.to_string(),
            source: e.into(),
        })
    }
}

/// Compact binary codec for callers that care about size over
/// human-readability.
#[derive(Clone, Copy, Debug, Default)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, StoreError> {
        rmp_serde::to_vec_named(value).map_err(|e| StoreError::Backend(e.into()))
    }

    fn decode<T: DeserializeOwned>(&self, key: &str, bytes: &[u8]) -> Result<T, StoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| StoreError::Serialization {
            key: key.to_string(),
            source: e.into(),
        })
    }
}
