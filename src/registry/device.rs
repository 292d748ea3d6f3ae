//! Per-device MQTT sessions
//!
//! Each leaf device authenticates to the edge hub with its own identity:
//! client id is the device name, the user name follows the IoT Hub device
//! scheme and the password is the device's SAS token.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::{DeviceConnector, DeviceCredential, DeviceLink};
use crate::config::DeviceEndpoint;
use crate::mqtt::{MqttClient, MqttError, MqttOptions};
use crate::protocol::QoS;

const DEVICE_API_VERSION: &str = "2016-11-14";

/// MQTT session for one device
pub struct DeviceClient {
    name: String,
    client: MqttClient,
}

impl DeviceClient {
    pub fn new(name: &str, credential: &DeviceCredential, endpoint: &DeviceEndpoint) -> Self {
        let mut options = MqttOptions::new(endpoint.edge_hub_hostname.clone(), endpoint.port, name)
            .with_credentials(
                format!(
                    "{}.azure-devices.net/{}/api-version={}",
                    endpoint.iot_hub_name, name, DEVICE_API_VERSION
                ),
                credential.expose(),
            )
            .with_ca_cert(endpoint.root_cert.clone());
        options.keep_alive = endpoint.keep_alive;
        options.connect_timeout = endpoint.connect_timeout;
        options.ack_timeout = endpoint.ack_timeout;
        Self::with_options(name, options)
    }

    pub fn with_options(name: &str, options: MqttOptions) -> Self {
        Self {
            name: name.to_string(),
            client: MqttClient::new(options),
        }
    }

    pub fn events_topic(&self) -> String {
        format!("devices/{}/messages/events/", self.name)
    }

    pub fn options(&self) -> &MqttOptions {
        self.client.options()
    }
}

#[async_trait]
impl DeviceLink for DeviceClient {
    async fn connect(&self) -> Result<(), MqttError> {
        self.client.connect().await
    }

    async fn send_event(&self, body: Bytes) -> Result<(), MqttError> {
        self.client
            .publish(self.events_topic(), body, QoS::AtLeastOnce)
            .await
    }

    async fn disconnect(&self) {
        self.client.disconnect().await;
    }

    fn is_connected(&self) -> bool {
        self.client.is_connected()
    }
}

/// Opens [`DeviceClient`] sessions against the configured edge hub
pub struct MqttDeviceConnector {
    endpoint: DeviceEndpoint,
}

impl MqttDeviceConnector {
    pub fn new(endpoint: DeviceEndpoint) -> Self {
        Self { endpoint }
    }
}

impl DeviceConnector for MqttDeviceConnector {
    fn create(&self, name: &str, credential: &DeviceCredential) -> Arc<dyn DeviceLink> {
        Arc::new(DeviceClient::new(name, credential, &self.endpoint))
    }
}
