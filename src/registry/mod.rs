//! Device Registry
//!
//! Maps leaf device names to dedicated sessions toward the edge hub, so
//! each device appears under its own identity. Sessions are opened on
//! registration, greeted with a first message, and kept until explicitly
//! deregistered or the bridge shuts down. A session whose link dropped
//! reconnects on its next send and can be replaced by registering again.
//!
//! Registration and deregistration are serialized; lookups only take a
//! short read lock and never wait on network I/O.

mod device;


use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

pub use device::{DeviceClient, MqttDeviceConnector};

use crate::mqtt::MqttError;

/// Device secret (a SAS token); never printed
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceCredential(String);

impl DeviceCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for DeviceCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DeviceCredential(<redacted>)")
    }
}

/// One device's connection toward the edge hub
#[async_trait]
pub trait DeviceLink: Send + Sync {
    async fn connect(&self) -> Result<(), MqttError>;

    /// Publish a telemetry event as this device
    async fn send_event(&self, body: Bytes) -> Result<(), MqttError>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;
}

/// Creates unconnected device links
pub trait DeviceConnector: Send + Sync {
    fn create(&self, name: &str, credential: &DeviceCredential) -> Arc<dyn DeviceLink>;
}

/// A registered device
pub struct DeviceSession {
    name: String,
    credential: DeviceCredential,
    link: Arc<dyn DeviceLink>,
    registered_at: Instant,
}

impl DeviceSession {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn credential(&self) -> &DeviceCredential {
        &self.credential
    }

    pub fn registered_at(&self) -> Instant {
        self.registered_at
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Send a JSON body as this device, reopening a dropped link first
    pub async fn send(&self, body: &Value) -> Result<(), MqttError> {
        if !self.link.is_connected() {
            debug!("Registry: Reconnecting device '{}'", self.name);
            self.link.connect().await?;
        }
        self.link.send_event(Bytes::from(body.to_string())).await
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("name", &self.name)
            .field("credential", &self.credential)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Registry errors
#[derive(Debug)]
pub enum RegistryError {
    /// Name empty or containing MQTT topic separators/wildcards
    InvalidName(String),
    /// A session for this name already exists
    AlreadyRegistered(String),
    /// Capacity reached
    Full(usize),
    /// The device session could not be opened
    Connection { device: String, source: MqttError },
    /// No session for this name
    NotRegistered(String),
    /// Device sessions are turned off in configuration
    Disabled,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::InvalidName(name) => write!(f, "invalid device name: {:?}", name),
            RegistryError::AlreadyRegistered(name) => {
                write!(f, "device '{}' is already registered", name)
            }
            RegistryError::Full(max) => write!(f, "registry full ({} sessions)", max),
            RegistryError::Connection { device, source } => {
                write!(f, "device '{}' failed to connect: {}", device, source)
            }
            RegistryError::NotRegistered(name) => write!(f, "device '{}' is not registered", name),
            RegistryError::Disabled => write!(f, "device sessions are disabled"),
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistryError::Connection { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// First message sent by every newly registered device
pub fn greeting(name: &str) -> Value {
    json!({ "content": format!("Hello from device {}", name) })
}

fn validate_name(name: &str) -> Result<(), RegistryError> {
    if name.is_empty() || name.contains(|c: char| c == '/' || c == '+' || c == '#') {
        return Err(RegistryError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Insertion-ordered set of device sessions keyed by name
pub struct DeviceRegistry {
    connector: Option<Arc<dyn DeviceConnector>>,
    sessions: RwLock<Vec<Arc<DeviceSession>>>,
    /// Single writer for register/deregister
    write_lock: tokio::sync::Mutex<()>,
    max_sessions: usize,
}

impl DeviceRegistry {
    pub fn new(connector: Arc<dyn DeviceConnector>, max_sessions: usize) -> Self {
        Self {
            connector: Some(connector),
            sessions: RwLock::new(Vec::new()),
            write_lock: tokio::sync::Mutex::new(()),
            max_sessions,
        }
    }

    /// A registry that refuses every registration
    pub fn disabled() -> Self {
        Self {
            connector: None,
            sessions: RwLock::new(Vec::new()),
            write_lock: tokio::sync::Mutex::new(()),
            max_sessions: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.connector.is_some()
    }

    /// Open a session for `name` and greet through it.
    ///
    /// A name with a live session is rejected without touching it. A
    /// session whose link dropped is closed and replaced. A failed greeting
    /// is logged; the session stays registered.
    pub async fn register(
        &self,
        name: &str,
        credential: DeviceCredential,
    ) -> Result<Arc<DeviceSession>, RegistryError> {
        let connector = self.connector.as_ref().ok_or(RegistryError::Disabled)?;
        validate_name(name)?;

        let _guard = self.write_lock.lock().await;
        if let Some(existing) = self.lookup(name) {
            if existing.is_connected() {
                return Err(RegistryError::AlreadyRegistered(name.to_string()));
            }
            self.sessions
                .write()
                .retain(|session| !Arc::ptr_eq(session, &existing));
            existing.link.disconnect().await;
            info!("Registry: Replacing disconnected session for device '{}'", name);
        }
        if self.len() >= self.max_sessions {
            return Err(RegistryError::Full(self.max_sessions));
        }

        let link = connector.create(name, &credential);
        link.connect()
            .await
            .map_err(|source| RegistryError::Connection {
                device: name.to_string(),
                source,
            })?;

        let session = Arc::new(DeviceSession {
            name: name.to_string(),
            credential,
            link,
            registered_at: Instant::now(),
        });
        self.sessions.write().push(session.clone());
        info!("Registry: Registered device '{}'", name);

        if let Err(e) = session.send(&greeting(name)).await {
            warn!("Registry: Greeting from device '{}' failed: {}", name, e);
        }

        Ok(session)
    }

    /// Find a session by name
    pub fn lookup(&self, name: &str) -> Option<Arc<DeviceSession>> {
        self.sessions
            .read()
            .iter()
            .find(|session| session.name == name)
            .cloned()
    }

    /// Remove a session and close its connection
    pub async fn deregister(&self, name: &str) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().await;
        let removed = {
            let mut sessions = self.sessions.write();
            let position = sessions.iter().position(|session| session.name == name);
            position.map(|index| sessions.remove(index))
        };

        match removed {
            Some(session) => {
                session.link.disconnect().await;
                info!("Registry: Deregistered device '{}'", name);
                Ok(())
            }
            None => Err(RegistryError::NotRegistered(name.to_string())),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Registered names in registration order
    pub fn device_names(&self) -> Vec<String> {
        self.sessions
            .read()
            .iter()
            .map(|session| session.name.clone())
            .collect()
    }

    /// Disconnect and drop every session
    pub async fn shutdown(&self) {
        let _guard = self.write_lock.lock().await;
        let sessions = std::mem::take(&mut *self.sessions.write());
        for session in sessions {
            session.link.disconnect().await;
            debug!("Registry: Closed session for device '{}'", session.name);
        }
    }
}
