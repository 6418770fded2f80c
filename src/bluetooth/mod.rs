//! Bluetooth central: transport abstraction, BlueZ backend, scan and
//! connection management.

pub mod bluez;
pub mod manager;
pub mod transport;
