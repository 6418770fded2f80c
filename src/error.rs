//! Error types for the bridge core.
//!
//! This module defines all error types that can occur while managing BLE
//! connections and driving device sessions, including Bluetooth, I/O, and
//! configuration errors.

use thiserror::Error;
use uuid::Uuid;

use crate::bluetooth::transport::DeviceId;

/// Main error type for the bridge core.
#[derive(Error, Debug)]
pub enum BridgeError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Invalid device address: {0}")]
   InvalidAddress(DeviceId),

   #[error("Device not found: {0}")]
   DeviceNotFound(DeviceId),

   #[error("Device has not been discovered: {0}")]
   DeviceNotDiscovered(DeviceId),

   #[error("Device not connected")]
   DeviceNotConnected,

   #[error("Radio is not powered on")]
   RadioNotPowered,

   #[error("Connection to {0} failed")]
   ConnectionFailed(DeviceId),

   #[error("Connection lost")]
   ConnectionLost,

   #[error("Already connecting to device")]
   AlreadyConnecting,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Service not found: {0}")]
   ServiceNotFound(Uuid),

   #[error("Characteristic not found: {0}")]
   CharacteristicNotFound(Uuid),

   #[error("Operation not supported for this device kind")]
   NotSupported,

   #[error("Manager has been shut down")]
   ManagerShutdown,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

/// Convenience type alias for Results with `BridgeError`.
pub type Result<T> = std::result::Result<T, BridgeError>;
