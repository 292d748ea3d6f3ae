//! Local Broker Connection
//!
//! The session to the MQTT broker that leaf devices publish to. Every
//! successful connect (re)subscribes to the device filter, and every
//! matching PUBLISH is handed to a single registered handler as
//! `(topic, payload)` in arrival order.
//!
//! A dropped session only flips the status to `Disconnected`; the bridge
//! supervisor watches the status and calls [`BrokerConnection::connect`]
//! again.


use tokio::sync::watch;
use tracing::info;

use crate::config::BrokerConfig;
use crate::mqtt::{ConnectionStatus, InboundCallback, MqttClient, MqttError, MqttOptions};
use crate::protocol::QoS;

/// Receiver for every message matching the device filter: `(topic, payload)`
pub type MessageHandler = InboundCallback;

/// Session to the local broker
pub struct BrokerConnection {
    client: MqttClient,
}

impl BrokerConnection {
    pub fn new(config: &BrokerConfig, client_id: impl Into<String>) -> Self {
        let mut options = MqttOptions::new(config.address.clone(), config.port, client_id)
            .subscribe(config.subscribe_filter.clone(), QoS::AtMostOnce);
        options.keep_alive = config.keep_alive;
        options.connect_timeout = config.connect_timeout;
        if let Some(tls) = &config.tls {
            options = options.with_ca_cert(tls.ca_cert.clone());
        }
        Self::with_options(options)
    }

    pub fn with_options(options: MqttOptions) -> Self {
        Self {
            client: MqttClient::new(options),
        }
    }

    /// Register the single message handler, replacing any previous one
    pub fn on_message(&self, handler: MessageHandler) {
        self.client.set_inbound_callback(handler);
    }

    /// Connect and subscribe; returns immediately when already connected
    pub async fn connect(&self) -> Result<(), MqttError> {
        if self.client.is_connected() {
            return Ok(());
        }
        self.client.connect().await?;
        info!(
            "Broker: Connected to {}, subscribed to {:?}",
            self.client.options().address(),
            self.client
                .options()
                .subscriptions
                .iter()
                .map(|s| s.filter.as_str())
                .collect::<Vec<_>>()
        );
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.client.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.client.status()
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.client.status_watch()
    }
}
