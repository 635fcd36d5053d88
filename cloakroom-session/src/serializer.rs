//! Pluggable attribute value serialization.

use crate::error::{SessionError, SessionResult};

/// Converts attribute values to and from the bytes stored in the repository.
///
/// The remote repository stores each attribute as one hash field; the wire
/// format is an implementation detail of the serializer, so deployments can
/// swap JSON for something denser without touching the repository.
pub trait AttributeSerializer: Send + Sync {
    /// Serialize a value for storage.
    fn serialize(&self, value: &serde_json::Value) -> SessionResult<Vec<u8>>;

    /// Deserialize a stored value.
    fn deserialize(&self, bytes: &[u8]) -> SessionResult<serde_json::Value>;
}

/// JSON serializer, the default.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonAttributeSerializer;

impl AttributeSerializer for JsonAttributeSerializer {
    fn serialize(&self, value: &serde_json::Value) -> SessionResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| SessionError::Serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> SessionResult<serde_json::Value> {
        serde_json::from_slice(bytes).map_err(|e| SessionError::Deserialization(e.to_string()))
    }
}
