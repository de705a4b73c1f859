//! Local-network bridge for BHK smart-home gateways.
//!
//! Discovers gateways over UDP broadcast, receives their event datagrams
//! on one shared socket, keeps per-kind device registries in sync, tracks
//! gateway liveness and sends commands back over UDP or a gateway's
//! WebSocket. [`Bridge`] wires it all together per setup entry.

pub mod bridge;
pub mod bus;
pub mod command;
pub mod config;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod service;
pub mod socket;
pub mod watchdog;

pub use bridge::{Bridge, EntrySetup, WebSocketSettings};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use protocol::{DeviceKind, GatewayDescriptor};
pub use registry::{DeviceEvent, DeviceRecord, DeviceSink, DeviceState};
