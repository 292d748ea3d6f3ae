//! Edge Hub and Device Configuration
//!
//! Identity and endpoint settings for the module's own edge hub session and
//! for the per-device sessions opened by the registry. Most of these values
//! are injected by the IoT Edge runtime through environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;

/// Module ID assigned by the IoT Edge runtime
pub const ENV_MODULE_ID: &str = "IOTEDGE_MODULEID";
/// Edge device ID
pub const ENV_DEVICE_ID: &str = "IOTEDGE_DEVICEID";
/// IoT Hub host name, e.g. `myhub.azure-devices.net`
pub const ENV_IOTHUB_HOSTNAME: &str = "IOTEDGE_IOTHUBHOSTNAME";
/// Host name of the edge hub gateway
pub const ENV_GATEWAY_HOSTNAME: &str = "IOTEDGE_GATEWAYHOSTNAME";
/// CA bundle the edge hub's server certificate chains to
pub const ENV_CA_CERT: &str = "EdgeModuleCACertificateFile";
/// Pre-provisioned SAS token for the module identity
pub const ENV_SAS_TOKEN: &str = "IOTEDGE_SASTOKEN";
/// Root CA used by device sessions
pub const ENV_DEVICE_ROOT_CERT: &str = "DEVICE_ROOT_CERT";

/// Edge hub connection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EdgeHubConfig {
    pub module_id: Option<String>,
    pub device_id: Option<String>,
    pub iothub_hostname: Option<String>,
    pub gateway_hostname: Option<String>,
    /// Gateway MQTT port
    #[serde(default = "default_edge_port")]
    pub port: u16,
    /// CA bundle for the gateway; plain TCP when unset
    pub ca_cert: Option<PathBuf>,
    pub sas_token: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_keep_alive", with = "humantime_serde")]
    pub keep_alive: Duration,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Bound on waiting for the gateway's PUBACK
    #[serde(default = "default_ack_timeout", with = "humantime_serde")]
    pub ack_timeout: Duration,
}

fn default_edge_port() -> u16 {
    8883
}

fn default_api_version() -> String {
    "2018-06-30".to_string()
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(60)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for EdgeHubConfig {
    fn default() -> Self {
        Self {
            module_id: None,
            device_id: None,
            iothub_hostname: None,
            gateway_hostname: None,
            port: default_edge_port(),
            ca_cert: None,
            sas_token: None,
            api_version: default_api_version(),
            keep_alive: default_keep_alive(),
            connect_timeout: default_connect_timeout(),
            ack_timeout: default_ack_timeout(),
        }
    }
}

/// Fully resolved module identity
#[derive(Clone)]
pub struct ModuleIdentity {
    pub module_id: String,
    pub device_id: String,
    pub iothub_hostname: String,
    pub gateway_hostname: String,
    pub sas_token: String,
}

impl std::fmt::Debug for ModuleIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleIdentity")
            .field("module_id", &self.module_id)
            .field("device_id", &self.device_id)
            .field("iothub_hostname", &self.iothub_hostname)
            .field("gateway_hostname", &self.gateway_hostname)
            .finish_non_exhaustive()
    }
}

impl EdgeHubConfig {
    /// Resolve required identity fields, naming the variable that is missing
    pub fn identity(&self) -> Result<ModuleIdentity, ConfigError> {
        Ok(ModuleIdentity {
            module_id: required(&self.module_id, ENV_MODULE_ID)?,
            device_id: required(&self.device_id, ENV_DEVICE_ID)?,
            iothub_hostname: required(&self.iothub_hostname, ENV_IOTHUB_HOSTNAME)?,
            gateway_hostname: required(&self.gateway_hostname, ENV_GATEWAY_HOSTNAME)?,
            sas_token: required(&self.sas_token, ENV_SAS_TOKEN)?,
        })
    }
}

/// Leaf device session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// Open per-device sessions for registered devices
    pub enabled: bool,
    pub root_cert: Option<PathBuf>,
    pub edge_hub_hostname: Option<String>,
    /// IoT Hub name without the `.azure-devices.net` suffix
    pub iot_hub_name: Option<String>,
    #[serde(default = "default_edge_port")]
    pub port: u16,
    /// Upper bound on concurrently registered devices
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_keep_alive", with = "humantime_serde")]
    pub keep_alive: Duration,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default = "default_ack_timeout", with = "humantime_serde")]
    pub ack_timeout: Duration,
}

fn default_max_sessions() -> usize {
    1000
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            root_cert: None,
            edge_hub_hostname: None,
            iot_hub_name: None,
            port: default_edge_port(),
            max_sessions: default_max_sessions(),
            keep_alive: default_keep_alive(),
            connect_timeout: default_connect_timeout(),
            ack_timeout: default_ack_timeout(),
        }
    }
}

/// Where and how device sessions connect
#[derive(Debug, Clone)]
pub struct DeviceEndpoint {
    pub root_cert: PathBuf,
    pub edge_hub_hostname: String,
    pub iot_hub_name: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
}

impl DevicesConfig {
    pub fn endpoint(&self) -> Result<DeviceEndpoint, ConfigError> {
        let root_cert = self
            .root_cert
            .clone()
            .ok_or_else(|| ConfigError::Missing(ENV_DEVICE_ROOT_CERT.to_string()))?;
        Ok(DeviceEndpoint {
            root_cert,
            edge_hub_hostname: required(&self.edge_hub_hostname, ENV_GATEWAY_HOSTNAME)?,
            iot_hub_name: required(&self.iot_hub_name, ENV_IOTHUB_HOSTNAME)?,
            port: self.port,
            keep_alive: self.keep_alive,
            connect_timeout: self.connect_timeout,
            ack_timeout: self.ack_timeout,
        })
    }
}

fn required(value: &Option<String>, var: &str) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v.clone()),
        _ => Err(ConfigError::Missing(var.to_string())),
    }
}
