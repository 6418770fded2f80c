//! BLE device-control core for classroom robots.
//!
//! This crate drives hummingbird-style robots over Bluetooth Low Energy: it
//! scans for peripherals, brokers connections, runs the per-device actuator
//! synchronization protocol, decodes telemetry, and derives the friendly
//! display names the robots are known by.
//!
//! The host application constructs a [`CentralManager`] over a
//! [`RadioTransport`] (normally [`BluezTransport`]), subscribes to
//! [`BridgeEvent`]s, and talks to connected robots through their
//! [`DeviceSession`] handles.

pub mod bluetooth;
pub mod config;
pub mod error;
pub mod event;
pub mod naming;
pub mod robot;

pub use bluetooth::{
   bluez::BluezTransport,
   manager::{CentralManager, DiscoveredDevice, ScanState},
   transport::{DeviceId, PoweredState, RadioTransport, TransportEvent},
};
pub use config::Config;
pub use error::{BridgeError, Result};
pub use event::{BridgeEvent, EventBus, EventSender, NullEventBus};
pub use naming::derive_friendly_name;
pub use robot::session::{DeviceKind, DeviceSession, Lifecycle};
