//! LeafBridge - MQTT bridge for IoT Edge leaf devices
//!
//! Subscribes to `device/#` on a local broker, wraps every message in an
//! envelope tagged with the originating device and forwards it to an edge
//! hub module output. Leaf devices can additionally be given their own
//! sessions toward the edge hub through the device registry.

pub mod bridge;
pub mod broker;
pub mod codec;
pub mod config;
pub mod edgehub;
pub mod mqtt;
pub mod protocol;
pub mod registry;
pub mod router;

#[cfg(test)]
mod testing;

pub use bridge::Bridge;
pub use broker::BrokerConnection;
pub use config::Config;
pub use edgehub::{EdgeHubConnection, ModuleClient};
pub use protocol::QoS;
pub use registry::DeviceRegistry;
pub use router::{BridgeRouter, Envelope};
