//! Edge Hub Connection
//!
//! The module's session with the edge hub runtime. Outbound, envelopes are
//! delivered to a named output. Inbound, two independent listeners receive
//! desired-property patches of the module twin and (optionally) messages
//! routed to one of the module's inputs.
//!
//! The runtime itself sits behind the [`ModuleClient`] trait; the production
//! implementation speaks MQTT to the edge hub gateway
//! ([`MqttModuleClient`]).

mod mqtt_module;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use mqtt_module::{decode_property_bag, encode_property_bag, parse_input_topic, MqttModuleClient};

use crate::mqtt::{ConnectionStatus, MqttError};
use crate::router::Envelope;

/// A message routed to one of the module's inputs
#[derive(Debug, Clone, PartialEq)]
pub struct InputMessage {
    /// Input name the message arrived on
    pub input: String,
    /// Application and system properties
    pub properties: BTreeMap<String, String>,
    pub payload: Bytes,
}

impl InputMessage {
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }
}

/// Edge hub errors
#[derive(Debug)]
pub enum EdgeHubError {
    /// Session could not be established
    Connection(MqttError),
    /// Operation attempted before `connect()` succeeded
    NotConnected,
    /// Runtime did not accept the message
    Send(MqttError),
    /// Receive channel closed; the listener stops
    Closed,
}

impl std::fmt::Display for EdgeHubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeHubError::Connection(e) => write!(f, "edge hub connection failed: {}", e),
            EdgeHubError::NotConnected => write!(f, "edge hub not connected"),
            EdgeHubError::Send(e) => write!(f, "edge hub send failed: {}", e),
            EdgeHubError::Closed => write!(f, "edge hub receive channel closed"),
        }
    }
}

impl std::error::Error for EdgeHubError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EdgeHubError::Connection(e) | EdgeHubError::Send(e) => Some(e),
            _ => None,
        }
    }
}

/// The edge hub runtime as seen by the bridge
#[async_trait]
pub trait ModuleClient: Send + Sync {
    /// Establish the module session
    async fn connect(&self) -> Result<(), EdgeHubError>;

    /// Deliver an envelope to a named output; returns once accepted
    async fn send_message_to_output(
        &self,
        envelope: &Envelope,
        output: &str,
    ) -> Result<(), EdgeHubError>;

    /// Wait for the next desired-properties patch
    async fn receive_twin_desired_patch(&self) -> Result<Value, EdgeHubError>;

    /// Wait for the next message routed to `input`
    async fn receive_message_on_input(&self, input: &str) -> Result<InputMessage, EdgeHubError>;

    async fn disconnect(&self);

    fn status(&self) -> ConnectionStatus;

    fn status_watch(&self) -> watch::Receiver<ConnectionStatus>;
}

/// Edge hub session used by the bridge
pub struct EdgeHubConnection {
    client: Arc<dyn ModuleClient>,
}

impl EdgeHubConnection {
    pub fn new(client: Arc<dyn ModuleClient>) -> Self {
        Self { client }
    }

    pub async fn connect(&self) -> Result<(), EdgeHubError> {
        if self.is_connected() {
            return Ok(());
        }
        self.client.connect().await?;
        info!("Edge hub: Connected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.client.status() == ConnectionStatus::Connected
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.client.status_watch()
    }

    pub async fn disconnect(&self) {
        self.client.disconnect().await;
    }

    /// Deliver an envelope to `output`. Never retried here.
    pub async fn send_to_output(&self, envelope: &Envelope, output: &str) -> Result<(), EdgeHubError> {
        if !self.is_connected() {
            return Err(EdgeHubError::NotConnected);
        }
        self.client.send_message_to_output(envelope, output).await?;
        debug!(
            "Edge hub: Sent message from {:?} to output '{}'",
            envelope.device_id(),
            output
        );
        Ok(())
    }

    /// Spawn the twin patch listener. `callback` runs once per patch, in
    /// receive order; the task stops on shutdown or when the channel closes.
    pub fn listen_twin_patches<F, Fut>(
        &self,
        callback: F,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let client = self.client.clone();
        tokio::spawn(async move {
            debug!("Edge hub: Twin patch listener started");
            loop {
                tokio::select! {
                    result = client.receive_twin_desired_patch() => {
                        match result {
                            Ok(patch) => callback(patch).await,
                            Err(EdgeHubError::Closed) => {
                                debug!("Edge hub: Twin patch channel closed");
                                return;
                            }
                            Err(e) => warn!("Edge hub: Twin patch receive failed: {}", e),
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Edge hub: Twin patch listener stopped");
                        return;
                    }
                }
            }
        })
    }

    /// Spawn a listener for messages routed to `input`
    pub fn listen_input<F, Fut>(
        &self,
        input: impl Into<String>,
        callback: F,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()>
    where
        F: Fn(InputMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let client = self.client.clone();
        let input = input.into();
        tokio::spawn(async move {
            debug!("Edge hub: Listening on input '{}'", input);
            loop {
                tokio::select! {
                    result = client.receive_message_on_input(&input) => {
                        match result {
                            Ok(message) => callback(message).await,
                            Err(EdgeHubError::Closed) => {
                                debug!("Edge hub: Input '{}' channel closed", input);
                                return;
                            }
                            Err(e) => warn!("Edge hub: Receive on input '{}' failed: {}", input, e),
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Edge hub: Input '{}' listener stopped", input);
                        return;
                    }
                }
            }
        })
    }
}
