//! MQTT module client
//!
//! Speaks the IoT Hub module topic scheme to the edge hub gateway:
//!
//! | Purpose | Topic |
//! |---|---|
//! | output send | `devices/{d}/modules/{m}/messages/events/{property bag}` |
//! | twin patches | `$iothub/twin/PATCH/properties/desired/?$version={n}` |
//! | input messages | `devices/{d}/modules/{m}/inputs/{input}/{property bag}` |

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};
use url::form_urlencoded;

use super::{EdgeHubError, InputMessage, ModuleClient};
use crate::config::{EdgeHubConfig, ModuleIdentity};
use crate::mqtt::{ConnectionStatus, MqttClient, MqttError, MqttOptions};
use crate::protocol::QoS;
use crate::router::Envelope;

const TWIN_PATCH_FILTER: &str = "$iothub/twin/PATCH/properties/desired/#";
const TWIN_PATCH_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";

/// Edge hub module session over MQTT
pub struct MqttModuleClient {
    client: MqttClient,
    device_id: String,
    module_id: String,
    twin_rx: Mutex<mpsc::UnboundedReceiver<Value>>,
    input_rx: Mutex<mpsc::UnboundedReceiver<InputMessage>>,
}

impl MqttModuleClient {
    /// Only `input` is subscribed among the module inputs; with `None` the
    /// module takes no input traffic at all
    pub fn new(identity: &ModuleIdentity, config: &EdgeHubConfig, input: Option<&str>) -> Self {
        let device_id = &identity.device_id;
        let module_id = &identity.module_id;

        let mut options = MqttOptions::new(
            identity.gateway_hostname.clone(),
            config.port,
            format!("{}/{}", device_id, module_id),
        )
        .with_credentials(
            format!(
                "{}/{}/{}/?api-version={}",
                identity.iothub_hostname, device_id, module_id, config.api_version
            ),
            identity.sas_token.clone(),
        );
        options.keep_alive = config.keep_alive;
        options.connect_timeout = config.connect_timeout;
        options.ack_timeout = config.ack_timeout;
        if let Some(ca_cert) = &config.ca_cert {
            options = options.with_ca_cert(ca_cert.clone());
        }

        Self::with_options(device_id, module_id, input, options)
    }

    /// Build from explicit session options; module topics are subscribed on
    /// top of whatever `options` already lists
    pub fn with_options(
        device_id: &str,
        module_id: &str,
        input: Option<&str>,
        options: MqttOptions,
    ) -> Self {
        let mut options = options.subscribe(TWIN_PATCH_FILTER, QoS::AtMostOnce);
        if let Some(input) = input {
            options = options.subscribe(
                format!("devices/{}/modules/{}/inputs/{}/#", device_id, module_id, input),
                QoS::AtLeastOnce,
            );
        }
        let client = MqttClient::new(options);

        let (twin_tx, twin_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let input_tx = input.map(|name| (name.to_string(), input_tx));
        client.set_inbound_callback(Arc::new(move |topic: String, payload: Bytes| {
            dispatch(&topic, payload, &twin_tx, input_tx.as_ref());
        }));

        Self {
            client,
            device_id: device_id.to_string(),
            module_id: module_id.to_string(),
            twin_rx: Mutex::new(twin_rx),
            input_rx: Mutex::new(input_rx),
        }
    }

    /// Telemetry topic for a message sent to `output`
    pub fn events_topic(&self, envelope: &Envelope, output: &str) -> String {
        let system = [
            ("$.on", output),
            ("$.ct", "application/json"),
            ("$.ce", "utf-8"),
        ];
        let bag = encode_property_bag(
            system.into_iter().chain(
                envelope
                    .properties
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str())),
            ),
        );
        format!(
            "devices/{}/modules/{}/messages/events/{}",
            self.device_id, self.module_id, bag
        )
    }
}

/// Sort an inbound publish onto the twin or input channel
fn dispatch(
    topic: &str,
    payload: Bytes,
    twin_tx: &mpsc::UnboundedSender<Value>,
    input_tx: Option<&(String, mpsc::UnboundedSender<InputMessage>)>,
) {
    if topic.starts_with(TWIN_PATCH_PREFIX) {
        match serde_json::from_slice::<Value>(&payload) {
            Ok(patch) => {
                let _ = twin_tx.send(patch);
            }
            Err(e) => warn!("Edge hub: Discarding twin patch that is not JSON: {}", e),
        }
        return;
    }

    match (parse_input_topic(topic), input_tx) {
        (Some((input, properties)), Some((listened, tx))) if input == *listened => {
            let _ = tx.send(InputMessage {
                input,
                properties,
                payload,
            });
        }
        (Some((input, _)), _) => {
            debug!("Edge hub: Dropping message for unattended input '{}'", input)
        }
        (None, _) => debug!("Edge hub: Ignoring message on unexpected topic {}", topic),
    }
}

/// Split `devices/{d}/modules/{m}/inputs/{input}/{bag}` into the input name
/// and its decoded properties
pub fn parse_input_topic(topic: &str) -> Option<(String, BTreeMap<String, String>)> {
    let segments: Vec<&str> = topic.splitn(7, '/').collect();
    if segments.len() < 6
        || segments[0] != "devices"
        || segments[2] != "modules"
        || segments[4] != "inputs"
        || segments[5].is_empty()
    {
        return None;
    }
    let bag = segments.get(6).copied().unwrap_or("");
    Some((segments[5].to_string(), decode_property_bag(bag)))
}

/// URL-encode `key=value` pairs joined by `&`. System keys keep their
/// literal `$.` prefix.
pub fn encode_property_bag<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    pairs
        .into_iter()
        .map(|(key, value)| format!("{}={}", encode_key(key), encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

pub fn decode_property_bag(bag: &str) -> BTreeMap<String, String> {
    form_urlencoded::parse(bag.as_bytes()).into_owned().collect()
}

/// `+` would read as a wildcard in the topic, so spaces become `%20`
fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

fn encode_key(key: &str) -> String {
    match key.strip_prefix("$.") {
        Some(rest) => format!("$.{}", encode(rest)),
        None => encode(key),
    }
}

fn map_send_error(e: MqttError) -> EdgeHubError {
    match e {
        MqttError::NotConnected => EdgeHubError::NotConnected,
        other => EdgeHubError::Send(other),
    }
}

#[async_trait]
impl ModuleClient for MqttModuleClient {
    async fn connect(&self) -> Result<(), EdgeHubError> {
        self.client.connect().await.map_err(EdgeHubError::Connection)
    }

    async fn send_message_to_output(
        &self,
        envelope: &Envelope,
        output: &str,
    ) -> Result<(), EdgeHubError> {
        let topic = self.events_topic(envelope, output);
        self.client
            .publish(topic, envelope.payload.clone(), QoS::AtLeastOnce)
            .await
            .map_err(map_send_error)
    }

    async fn receive_twin_desired_patch(&self) -> Result<Value, EdgeHubError> {
        self.twin_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(EdgeHubError::Closed)
    }

    async fn receive_message_on_input(&self, input: &str) -> Result<InputMessage, EdgeHubError> {
        let mut rx = self.input_rx.lock().await;
        loop {
            let message = rx.recv().await.ok_or(EdgeHubError::Closed)?;
            if message.input == input {
                return Ok(message);
            }
            debug!(
                "Edge hub: Dropping message for unattended input '{}'",
                message.input
            );
        }
    }

    async fn disconnect(&self) {
        self.client.disconnect().await;
    }

    fn status(&self) -> ConnectionStatus {
        self.client.status()
    }

    fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.client.status_watch()
    }
}
