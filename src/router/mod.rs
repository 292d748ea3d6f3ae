//! Bridge Router
//!
//! Turns raw broker messages into envelopes for the edge hub and carries
//! edge hub traffic back down to registered devices.
//!
//! Broker topics are `device/{deviceId}/...`; the second segment names the
//! originating leaf device. Payloads must be UTF-8 JSON. Messages that fail
//! to parse or send are logged and dropped, never retried.

mod envelope;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use envelope::{Envelope, PROPERTY_DEVICE_ID, PROPERTY_MODULE_ID};

use crate::broker::MessageHandler;
use crate::edgehub::{EdgeHubConnection, EdgeHubError, InputMessage};
use crate::mqtt::MqttError;
use crate::registry::{DeviceCredential, DeviceRegistry, RegistryError};

/// Twin desired property listing devices to register
pub const LEAF_DEVICES_PROPERTY: &str = "leafDevices";

/// A broker message queued for the router worker
pub type BrokerMessage = (String, Bytes);

/// Why a payload could not be turned into JSON
#[derive(Debug)]
pub enum PayloadDecodeError {
    Utf8(std::str::Utf8Error),
    Json(serde_json::Error),
}

impl std::fmt::Display for PayloadDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadDecodeError::Utf8(e) => write!(f, "payload is not UTF-8: {}", e),
            PayloadDecodeError::Json(e) => write!(f, "payload is not JSON: {}", e),
        }
    }
}

impl std::error::Error for PayloadDecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PayloadDecodeError::Utf8(e) => Some(e),
            PayloadDecodeError::Json(e) => Some(e),
        }
    }
}

/// Routing errors
#[derive(Debug)]
pub enum RouteError {
    /// Topic has no device segment
    MalformedTopic(String),
    PayloadDecode(PayloadDecodeError),
    /// Edge hub did not accept the envelope
    Send(EdgeHubError),
    /// No session registered under this name
    UnknownDevice(String),
    /// The device session did not accept the message
    DeviceSend { device: String, source: MqttError },
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteError::MalformedTopic(topic) => write!(f, "malformed topic: {:?}", topic),
            RouteError::PayloadDecode(e) => write!(f, "{}", e),
            RouteError::Send(e) => write!(f, "{}", e),
            RouteError::UnknownDevice(name) => write!(f, "unknown device '{}'", name),
            RouteError::DeviceSend { device, source } => {
                write!(f, "send as device '{}' failed: {}", device, source)
            }
        }
    }
}

impl std::error::Error for RouteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RouteError::PayloadDecode(e) => Some(e),
            RouteError::Send(e) => Some(e),
            RouteError::DeviceSend { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<PayloadDecodeError> for RouteError {
    fn from(e: PayloadDecodeError) -> Self {
        RouteError::PayloadDecode(e)
    }
}

impl From<EdgeHubError> for RouteError {
    fn from(e: EdgeHubError) -> Self {
        RouteError::Send(e)
    }
}

/// Device id is the second topic segment: `device/{id}/...`
pub fn device_id_from_topic(topic: &str) -> Result<&str, RouteError> {
    match topic.split('/').nth(1) {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(RouteError::MalformedTopic(topic.to_string())),
    }
}

pub fn decode_payload(payload: &[u8]) -> Result<Value, PayloadDecodeError> {
    let text = std::str::from_utf8(payload).map_err(PayloadDecodeError::Utf8)?;
    serde_json::from_str(text).map_err(PayloadDecodeError::Json)
}

/// Routes messages between the broker, the edge hub and device sessions
pub struct BridgeRouter {
    edge_hub: Arc<EdgeHubConnection>,
    registry: Arc<DeviceRegistry>,
    module_id: String,
    output_name: String,
}

impl BridgeRouter {
    pub fn new(
        edge_hub: Arc<EdgeHubConnection>,
        registry: Arc<DeviceRegistry>,
        module_id: impl Into<String>,
        output_name: impl Into<String>,
    ) -> Self {
        Self {
            edge_hub,
            registry,
            module_id: module_id.into(),
            output_name: output_name.into(),
        }
    }

    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    /// Forward one broker message to the edge hub output
    pub async fn on_broker_message(&self, topic: &str, payload: &[u8]) -> Result<(), RouteError> {
        let device_id = device_id_from_topic(topic)?;
        let body = decode_payload(payload)?;

        let envelope = Envelope::from_device_message(topic, device_id, &self.module_id, body);
        self.edge_hub
            .send_to_output(&envelope, &self.output_name)
            .await?;
        debug!("Router: Forwarded {} from device '{}'", topic, device_id);
        Ok(())
    }

    /// Send `body` through a registered device's own session
    pub async fn relay_to_device(&self, name: &str, body: &Value) -> Result<(), RouteError> {
        let session = self
            .registry
            .lookup(name)
            .ok_or_else(|| RouteError::UnknownDevice(name.to_string()))?;
        session
            .send(body)
            .await
            .map_err(|source| RouteError::DeviceSend {
                device: name.to_string(),
                source,
            })?;
        debug!("Router: Relayed message to device '{}'", name);
        Ok(())
    }

    /// Relay an input message addressed to a leaf device via `leafdeviceid`
    pub async fn on_input_message(&self, message: InputMessage) -> Result<(), RouteError> {
        let Some(device) = message.property(PROPERTY_DEVICE_ID) else {
            debug!(
                "Router: Ignoring message on input '{}' without {}",
                message.input, PROPERTY_DEVICE_ID
            );
            return Ok(());
        };
        let body = decode_payload(&message.payload)?;
        self.relay_to_device(device, &body).await
    }

    /// Log a desired-properties patch and apply its `leafDevices` entries.
    ///
    /// `{"leafDevices": {"name": "<sas token>", "gone": null}}` registers
    /// `name` unless it already has a live session and deregisters `gone`.
    pub async fn on_twin_patch(&self, patch: Value) {
        info!("Router: Twin desired properties patch: {}", patch);

        let Some(devices) = patch.get(LEAF_DEVICES_PROPERTY).and_then(Value::as_object) else {
            return;
        };
        if !self.registry.is_enabled() {
            warn!(
                "Router: Ignoring {} in twin patch, device sessions are disabled",
                LEAF_DEVICES_PROPERTY
            );
            return;
        }

        for (name, entry) in devices {
            match entry {
                Value::String(token) => {
                    if self
                        .registry
                        .lookup(name)
                        .is_some_and(|session| session.is_connected())
                    {
                        debug!("Router: Device '{}' already registered", name);
                        continue;
                    }
                    if let Err(e) = self
                        .registry
                        .register(name, DeviceCredential::new(token.as_str()))
                        .await
                    {
                        warn!("Router: Registering device '{}' failed: {}", name, e);
                    }
                }
                Value::Null => match self.registry.deregister(name).await {
                    Ok(()) | Err(RegistryError::NotRegistered(_)) => {}
                    Err(e) => warn!("Router: Deregistering device '{}' failed: {}", name, e),
                },
                other => warn!(
                    "Router: Ignoring device '{}' with non-string credential {}",
                    name, other
                ),
            }
        }
    }

    /// Broker handler queuing messages for the worker. Messages arriving
    /// while the queue is full are dropped.
    pub fn queue_handler(tx: mpsc::Sender<BrokerMessage>) -> MessageHandler {
        Arc::new(move |topic: String, payload: Bytes| {
            match tx.try_send((topic, payload)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full((topic, _))) => {
                    error!("Router: Queue full, dropped message on {}", topic);
                }
                Err(mpsc::error::TrySendError::Closed((topic, _))) => {
                    debug!("Router: Worker stopped, dropped message on {}", topic);
                }
            }
        })
    }

    /// Spawn the single consumer of the broker queue
    pub fn spawn_worker(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<BrokerMessage>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            debug!("Router: Worker started");
            loop {
                tokio::select! {
                    message = rx.recv() => {
                        let Some((topic, payload)) = message else {
                            debug!("Router: Queue closed");
                            return;
                        };
                        if let Err(e) = router.on_broker_message(&topic, &payload).await {
                            error!("Router: Dropped message on {}: {}", topic, e);
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Router: Worker stopped");
                        return;
                    }
                }
            }
        })
    }
}
