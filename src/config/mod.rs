//! Configuration Module
//!
//! Provides TOML-based configuration for the bridge with support for:
//! - Local broker connection settings
//! - Edge hub module identity and endpoint
//! - Leaf device session settings
//! - Routing and retry behaviour
//! - IoT Edge runtime environment variables (IOTEDGE_*)
//! - Environment variable overrides (LEAFBRIDGE__* prefix)

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use edge::{
    DeviceEndpoint, DevicesConfig, EdgeHubConfig, ModuleIdentity, ENV_CA_CERT, ENV_DEVICE_ID,
    ENV_DEVICE_ROOT_CERT, ENV_GATEWAY_HOSTNAME, ENV_IOTHUB_HOSTNAME, ENV_MODULE_ID, ENV_SAS_TOKEN,
};

mod edge;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = match Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Required value absent; names the environment variable that supplies it
    Missing(String),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Missing(var) => {
                write!(f, "Missing required setting: {} is not set", var)
            }
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Local broker connection
    pub broker: BrokerConfig,
    /// Edge hub module connection
    pub edge_hub: EdgeHubConfig,
    /// Per-device sessions toward the edge hub
    pub devices: DevicesConfig,
    /// Routing and retry behaviour
    pub bridge: BridgeConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Local broker connection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host name or IP address
    #[serde(default = "default_broker_address")]
    pub address: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    /// Client identifier; `{module_id}_client` when unset
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive", with = "humantime_serde")]
    pub keep_alive: Duration,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Filter subscribed on every (re)connect
    #[serde(default = "default_subscribe_filter")]
    pub subscribe_filter: String,
    /// TLS toward the broker (optional)
    pub tls: Option<BrokerTlsConfig>,
}

/// TLS configuration for the broker connection
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BrokerTlsConfig {
    /// Path to CA certificate file (PEM format)
    pub ca_cert: PathBuf,
}

fn default_broker_address() -> String {
    "127.0.0.1".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(60)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_subscribe_filter() -> String {
    "device/#".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: default_broker_address(),
            port: default_broker_port(),
            client_id: None,
            keep_alive: default_keep_alive(),
            connect_timeout: default_connect_timeout(),
            subscribe_filter: default_subscribe_filter(),
            tls: None,
        }
    }
}

/// Routing and retry configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Edge hub output that device messages are sent to
    #[serde(default = "default_output_name")]
    pub output_name: String,
    /// Edge hub input relayed back to devices (optional)
    pub input_name: Option<String>,
    /// Fixed pause between connection attempts
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Broker messages buffered ahead of the router
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_output_name() -> String {
    "ptm_output".to_string()
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            output_name: default_output_name(),
            input_name: None,
            retry_interval: default_retry_interval(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports three forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `LEAFBRIDGE__` prefix with double underscores for nesting:
    ///    - `LEAFBRIDGE__BROKER__PORT=1884` overrides `broker.port`
    ///    - `LEAFBRIDGE__BRIDGE__RETRY_INTERVAL=5s` overrides `bridge.retry_interval`
    /// 3. IoT Edge runtime variables (`IOTEDGE_MODULEID`, ...) fill identity
    ///    fields that neither the file nor an override set
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_with_env(path, |var| std::env::var(var).ok())
    }

    /// Load configuration resolving runtime variables through `lookup`
    pub fn load_with_env<P, F>(path: P, lookup: F) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("broker.address", "127.0.0.1")?
            .set_default("broker.port", 1883)?
            .set_default("broker.subscribe_filter", "device/#")?
            .set_default("edge_hub.port", 8883)?
            .set_default("edge_hub.api_version", "2018-06-30")?
            .set_default("devices.enabled", false)?
            .set_default("devices.max_sessions", 1000)?
            .set_default("bridge.output_name", "ptm_output")?
            .set_default("bridge.retry_interval", "1s")?
            .set_default("bridge.channel_capacity", 1024)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (LEAFBRIDGE__BROKER__PORT, etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("LEAFBRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = cfg.try_deserialize()?;
        config.apply_runtime_env(lookup);
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only (no file)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Fill unset identity fields from IoT Edge runtime variables
    pub fn apply_runtime_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |var: &str| lookup(var).filter(|v| !v.is_empty());

        fill(&mut self.edge_hub.module_id, lookup(ENV_MODULE_ID));
        fill(&mut self.edge_hub.device_id, lookup(ENV_DEVICE_ID));
        fill(&mut self.edge_hub.sas_token, lookup(ENV_SAS_TOKEN));
        fill(&mut self.edge_hub.ca_cert, lookup(ENV_CA_CERT).map(PathBuf::from));
        fill(&mut self.devices.root_cert, lookup(ENV_DEVICE_ROOT_CERT).map(PathBuf::from));

        if let Some(hostname) = lookup(ENV_IOTHUB_HOSTNAME) {
            let hub_name = hostname.split('.').next().map(str::to_string);
            fill(&mut self.devices.iot_hub_name, hub_name);
            fill(&mut self.edge_hub.iothub_hostname, Some(hostname));
        }
        if let Some(gateway) = lookup(ENV_GATEWAY_HOSTNAME) {
            fill(&mut self.devices.edge_hub_hostname, Some(gateway.clone()));
            fill(&mut self.edge_hub.gateway_hostname, Some(gateway));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.edge_hub.identity()?;

        if self.devices.enabled {
            self.devices.endpoint()?;
            if self.devices.max_sessions == 0 {
                return Err(ConfigError::Validation(
                    "devices.max_sessions must be at least 1".to_string(),
                ));
            }
        }

        if self.broker.subscribe_filter.is_empty() {
            return Err(ConfigError::Validation(
                "broker.subscribe_filter cannot be empty".to_string(),
            ));
        }

        if self.bridge.output_name.is_empty() {
            return Err(ConfigError::Validation(
                "bridge.output_name cannot be empty".to_string(),
            ));
        }

        if matches!(self.bridge.input_name.as_deref(), Some("")) {
            return Err(ConfigError::Validation(
                "bridge.input_name cannot be empty when set".to_string(),
            ));
        }

        if self.bridge.retry_interval.is_zero() {
            return Err(ConfigError::Validation(
                "bridge.retry_interval must be greater than zero".to_string(),
            ));
        }

        if self.bridge.channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "bridge.channel_capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Module identifier carried on every routed message
    pub fn module_id(&self) -> &str {
        self.edge_hub.module_id.as_deref().unwrap_or_default()
    }

    /// Client identifier used toward the local broker
    pub fn broker_client_id(&self) -> String {
        match &self.broker.client_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!("{}_client", self.module_id()),
        }
    }
}

fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}
