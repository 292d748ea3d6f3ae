//! LeafBridge - MQTT bridge between leaf devices and an IoT Edge hub
//!
//! Usage:
//!   leafbridge [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help
//!
//! Without `--config` the identity is taken from the IoT Edge runtime
//! environment and `LEAFBRIDGE__*` overrides.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use leafbridge::bridge::Bridge;
use leafbridge::config::Config;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Connection lifecycle
    #[default]
    Info,
    /// Per-message routing
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// LeafBridge - forwards leaf device telemetry to an IoT Edge hub
#[derive(Parser, Debug)]
#[command(name = "leafbridge")]
#[command(author = "LeafBridge Contributors")]
#[command(version)]
#[command(about = "Bridge between a local MQTT broker and an IoT Edge hub module")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides config, config overrides default (info)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error setting up logging: {}", e);
        std::process::exit(1);
    }

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }
    info!("Starting LeafBridge");
    info!(
        "  Broker: {}:{} (filter {})",
        config.broker.address, config.broker.port, config.broker.subscribe_filter
    );
    info!("  Module: {}", config.module_id());
    info!("  Output: {}", config.bridge.output_name);
    match &config.bridge.input_name {
        Some(input) => info!("  Input: {}", input),
        None => info!("  Input: disabled"),
    }
    if config.devices.enabled {
        info!(
            "  Device sessions: enabled (max {})",
            config.devices.max_sessions
        );
    } else {
        info!("  Device sessions: disabled");
    }

    let bridge = match Bridge::from_config(config) {
        Ok(bridge) => bridge,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = bridge.shutdown_on_signals() {
        error!("Error setting up signal handlers: {}", e);
    }

    bridge.run().await;
}
