//! Routed message unit

use std::collections::BTreeMap;

use bytes::Bytes;
use serde_json::{json, Value};

/// Property carrying the originating leaf device
pub const PROPERTY_DEVICE_ID: &str = "leafdeviceid";
/// Property carrying this module's identifier
pub const PROPERTY_MODULE_ID: &str = "moduleid";

/// A message forwarded to the edge hub.
///
/// `payload` is the serialized body `{"topic": ..., "payload": ...}`;
/// `properties` always holds [`PROPERTY_DEVICE_ID`] and
/// [`PROPERTY_MODULE_ID`] for envelopes built from broker messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Path segments of the originating broker topic
    pub topic: Vec<String>,
    pub payload: Bytes,
    pub properties: BTreeMap<String, String>,
}

impl Envelope {
    /// Wrap a decoded device message for the edge hub
    pub fn from_device_message(topic: &str, device_id: &str, module_id: &str, payload: Value) -> Self {
        let body = json!({
            "topic": topic,
            "payload": payload,
        });

        let mut properties = BTreeMap::new();
        properties.insert(PROPERTY_DEVICE_ID.to_string(), device_id.to_string());
        properties.insert(PROPERTY_MODULE_ID.to_string(), module_id.to_string());

        Self {
            topic: topic.split('/').map(str::to_string).collect(),
            payload: Bytes::from(body.to_string()),
            properties,
        }
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn device_id(&self) -> Option<&str> {
        self.property(PROPERTY_DEVICE_ID)
    }

    /// Parse the serialized body back into JSON
    pub fn body(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}
