//! Pluggable payload serialization.
//!
//! Stores and transports move opaque bytes; the [`Serializer`] decides the
//! format. Two formats ship with Courier: JSON for readability and
//! `MsgPack` (`rmp_serde::to_vec_named`) for compact wire payloads.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::MediatorError;

/// Converts typed values to bytes and back.
pub trait Serializer: Send + Sync + Clone + 'static {
    /// Short format name, used in logs and transport content-type headers.
    fn format(&self) -> &'static str;

    /// # Errors
    ///
    /// Returns `MediatorError::Serialization` if `value` cannot be encoded.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, MediatorError>;

    /// # Errors
    ///
    /// Returns `MediatorError::Serialization` if `bytes` is not a valid `T`.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, MediatorError>;
}

/// JSON via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn format(&self) -> &'static str {
        "json"
    }

    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, MediatorError> {
        serde_json::to_vec(value).map_err(|e| MediatorError::Serialization(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, MediatorError> {
        serde_json::from_slice(bytes).map_err(|e| MediatorError::Serialization(e.to_string()))
    }
}

/// `MsgPack` with named fields via `rmp_serde`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackSerializer;

impl Serializer for MsgPackSerializer {
    fn format(&self) -> &'static str {
        "msgpack"
    }

    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, MediatorError> {
        rmp_serde::to_vec_named(value).map_err(|e| MediatorError::Serialization(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, MediatorError> {
        rmp_serde::from_slice(bytes).map_err(|e| MediatorError::Serialization(e.to_string()))
    }
}
