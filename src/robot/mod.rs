//! Robot protocol engine: per-device sessions, wire encoding, sensor
//! conversions.

pub mod protocol;
pub mod sensors;
pub mod session;
pub mod state;
