//! Event handling system for bridge status updates.
//!
//! This module provides the event infrastructure for notifying the host
//! application about device discovery, connection state changes, and scan
//! lifecycle.

use std::sync::Arc;

use smol_str::SmolStr;

use crate::bluetooth::{manager::ScanState, transport::DeviceId};

/// Events that can be emitted by the bridge core.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
   /// A peripheral showed up during a searching scan.
   DeviceDiscovered { id: DeviceId, display_name: SmolStr },
   DeviceConnected(DeviceId),
   DeviceDisconnected(DeviceId),
   ConnectionFailed(DeviceId),
   /// A scan ended, either explicitly or through its watchdog.
   ScanStopped(ScanState),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: BridgeEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Event bus that drops everything, for hosts that do not care.
pub struct NullEventBus;

impl EventBus for NullEventBus {
   fn emit(&self, _event: BridgeEvent) {}
}
