//! MQTT Client Sessions
//!
//! A small MQTT v3.1.1 client used for every outbound session the bridge
//! keeps: the local broker, the edge hub module identity and one session per
//! registered leaf device.
//!
//! Each [`MqttClient`] owns a single background network loop per successful
//! connect. The loop delivers inbound PUBLISH packets to the registered
//! callback in arrival order, answers QoS 1 deliveries, resolves PUBACK
//! waiters and sends PINGREQ on the keep-alive interval. When the transport
//! drops, the loop ends and the status flips to
//! [`ConnectionStatus::Disconnected`]; reconnecting is the caller's job.

mod client;
mod tls;


use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub use client::{InboundCallback, MqttClient};
pub use tls::{load_root_store, TlsError};

use crate::protocol::{ConnectReturnCode, DecodeError, EncodeError, QoS, Subscription};

/// Connection state of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// No session; `connect()` may be called
    #[default]
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// CONNACK accepted, network loop running
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
        }
    }
}

/// Session parameters for an [`MqttClient`]
#[derive(Clone)]
pub struct MqttOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Root CA used to verify the server; plain TCP when unset
    pub ca_cert: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    /// Filters (re)subscribed after every accepted CONNACK
    pub subscriptions: Vec<Subscription>,
}

impl MqttOptions {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            username: None,
            password: None,
            ca_cert: None,
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(30),
            subscriptions: Vec::new(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert = Some(path.into());
        self
    }

    pub fn subscribe(mut self, filter: impl Into<String>, qos: QoS) -> Self {
        self.subscriptions.push(Subscription::new(filter, qos));
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for MqttOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("ca_cert", &self.ca_cert)
            .field("subscriptions", &self.subscriptions)
            .finish()
    }
}

/// Errors raised by a client session
#[derive(Debug)]
pub enum MqttError {
    /// Transport failed or the peer closed the connection
    ConnectionLost(String),
    /// Server refused the CONNECT
    Rejected(ConnectReturnCode),
    /// Connect or CONNACK did not complete in time
    Timeout,
    /// TLS setup or handshake failure
    Tls(TlsError),
    /// Peer sent bytes that do not decode, or a packet could not be encoded
    Protocol(String),
    /// Operation requires an established session
    NotConnected,
    /// No PUBACK arrived within the ack timeout
    AckTimeout,
}

impl fmt::Display for MqttError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MqttError::ConnectionLost(msg) => write!(f, "connection lost: {}", msg),
            MqttError::Rejected(code) => write!(f, "connection refused: {}", code),
            MqttError::Timeout => write!(f, "connect timed out"),
            MqttError::Tls(e) => write!(f, "TLS error: {}", e),
            MqttError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            MqttError::NotConnected => write!(f, "not connected"),
            MqttError::AckTimeout => write!(f, "timed out waiting for PUBACK"),
        }
    }
}

impl std::error::Error for MqttError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MqttError::Tls(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TlsError> for MqttError {
    fn from(e: TlsError) -> Self {
        MqttError::Tls(e)
    }
}

impl From<std::io::Error> for MqttError {
    fn from(e: std::io::Error) -> Self {
        MqttError::ConnectionLost(e.to_string())
    }
}

impl From<DecodeError> for MqttError {
    fn from(e: DecodeError) -> Self {
        MqttError::Protocol(e.to_string())
    }
}

impl From<EncodeError> for MqttError {
    fn from(e: EncodeError) -> Self {
        MqttError::Protocol(e.to_string())
    }
}
