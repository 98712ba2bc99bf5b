//! Payload serializers.
//!
//! The engine never looks inside a payload itself. It hands values to a
//! [`Serializer`] picked by the id carried in every message header, so both
//! ends only have to agree on which format lives under which id.
//!
//! [`JsonSerializer`] (id 2) is the reference implementation and the default.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::error::{PyroError, Result};

/// Method name carried by batch invocations.
pub const BATCH_METHOD: &str = "<batch>";

/// A decoded invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub object: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

/// Payload (de)serialization capability.
pub trait Serializer: Send + Sync {
    /// Id written into the message header.
    fn id(&self) -> u8;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn dumps(&self, value: &Value) -> Result<Vec<u8>>;

    fn loads(&self, data: &[u8]) -> Result<Value>;

    fn dumps_call(
        &self,
        object: &str,
        method: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Vec<u8>>;

    fn loads_call(&self, data: &[u8]) -> Result<CallRequest>;
}

/// JSON payloads.
///
/// Calls are encoded as `{"object": .., "method": .., "args": [..], "kwargs": {..}}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub const ID: u8 = 2;
}

impl Serializer for JsonSerializer {
    fn id(&self) -> u8 {
        Self::ID
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn dumps(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn loads(&self, data: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(data)?)
    }

    fn dumps_call(
        &self,
        object: &str,
        method: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Vec<u8>> {
        let call = serde_json::json!({
            "object": object,
            "method": method,
            "args": args,
            "kwargs": kwargs,
        });
        Ok(serde_json::to_vec(&call)?)
    }

    fn loads_call(&self, data: &[u8]) -> Result<CallRequest> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Serializers known to one endpoint, keyed by id.
#[derive(Clone)]
pub struct SerializerRegistry {
    serializers: HashMap<u8, Arc<dyn Serializer>>,
}

impl SerializerRegistry {
    /// A registry holding only [`JsonSerializer`].
    pub fn new() -> Self {
        let mut registry = Self {
            serializers: HashMap::new(),
        };
        registry.register(Arc::new(JsonSerializer));
        registry
    }

    /// Adds or replaces the serializer under its id.
    pub fn register(&mut self, serializer: Arc<dyn Serializer>) {
        self.serializers.insert(serializer.id(), serializer);
    }

    /// Looks up a serializer.
    ///
    /// # Errors
    ///
    /// Returns `Serialize` for unknown ids.
    pub fn get(&self, id: u8) -> Result<Arc<dyn Serializer>> {
        self.serializers
            .get(&id)
            .cloned()
            .ok_or_else(|| PyroError::Serialize(format!("no serializer registered for id {}", id)))
    }

    pub fn ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.serializers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// An argument that stays serialized in transit.
///
/// The proxy forwards `data` untouched and routes the call through the
/// `BLBI` annotation, so a pass-through dispatcher can forward it again
/// without understanding the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedBlob {
    /// Free-form routing info
    pub info: Value,
    data: Vec<u8>,
    serializer_id: u8,
}

impl SerializedBlob {
    /// Serializes `value` once, up front.
    pub fn new(info: Value, value: &Value, serializer: &dyn Serializer) -> Result<Self> {
        Ok(Self {
            info,
            data: serializer.dumps(value)?,
            serializer_id: serializer.id(),
        })
    }

    /// Wraps bytes that are already serialized with `serializer_id`.
    pub fn from_raw(info: Value, data: Vec<u8>, serializer_id: u8) -> Self {
        Self {
            info,
            data,
            serializer_id,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn serializer_id(&self) -> u8 {
        self.serializer_id
    }

    /// Decodes the payload.
    pub fn deserialized(&self, serializers: &SerializerRegistry) -> Result<Value> {
        serializers.get(self.serializer_id)?.loads(&self.data)
    }
}
