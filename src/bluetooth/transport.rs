//! Radio transport abstraction.
//!
//! The rest of the core talks to the platform BLE stack exclusively through
//! the [`RadioTransport`] trait and the [`TransportEvent`] stream. A transport
//! implementation owns its platform handles and delivers every callback as an
//! event on a single mpsc channel, so consumers see transport activity in
//! order, one event at a time.

use async_trait::async_trait;
use smallvec::SmallVec;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::error::Result;

/// Stable radio address string identifying a peripheral.
pub type DeviceId = SmolStr;

/// Inbound characteristic payload. BLE values are MTU-bounded and small.
pub type Payload = SmallVec<[u8; 24]>;

/// Power state of the radio as last reported by the platform stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum PoweredState {
   Unknown,
   PoweredOn,
   PoweredOff,
   Unauthorized,
   Unsupported,
}

impl PoweredState {
   pub const fn is_usable(self) -> bool {
      matches!(self, Self::PoweredOn)
   }
}

/// Events emitted by a transport implementation.
///
/// One adapter produces one ordered stream; no two events for the same
/// adapter are ever delivered concurrently.
#[derive(Debug, Clone)]
pub enum TransportEvent {
   PoweredStateChanged(PoweredState),
   DeviceDiscovered {
      id: DeviceId,
      advertised_name: SmolStr,
      rssi: Option<i16>,
   },
   Connected(DeviceId),
   ConnectFailed(DeviceId, String),
   Disconnected {
      id: DeviceId,
      error: Option<String>,
   },
   ServicesDiscovered {
      id: DeviceId,
      services: Vec<Uuid>,
   },
   CharacteristicsDiscovered {
      id: DeviceId,
      service: Uuid,
      characteristics: Vec<Uuid>,
   },
   WriteComplete {
      id: DeviceId,
      characteristic: Uuid,
      error: Option<String>,
   },
   ValueUpdated {
      id: DeviceId,
      characteristic: Uuid,
      value: Payload,
   },
}

/// Capability facade over the platform BLE central stack.
///
/// Methods resolve when the platform accepted the request; completion is
/// reported through [`TransportEvent`]s.
#[async_trait]
pub trait RadioTransport: Send + Sync {
   /// Starts scanning for peripherals advertising one of the given services.
   /// An empty filter scans unfiltered.
   async fn start_scan(&self, service_filter: &[Uuid]) -> Result<()>;

   async fn stop_scan(&self) -> Result<()>;

   async fn connect(&self, id: &DeviceId, notify_on_disconnect: bool) -> Result<()>;

   async fn disconnect(&self, id: &DeviceId) -> Result<()>;

   async fn discover_services(&self, id: &DeviceId, service_filter: &[Uuid]) -> Result<()>;

   async fn discover_characteristics(
      &self,
      id: &DeviceId,
      service: Uuid,
      characteristic_filter: &[Uuid],
   ) -> Result<()>;

   async fn set_notify(&self, id: &DeviceId, characteristic: Uuid, enabled: bool) -> Result<()>;

   async fn write(
      &self,
      id: &DeviceId,
      characteristic: Uuid,
      payload: &[u8],
      with_response: bool,
   ) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod mock {
   //! Scriptable in-memory transport for exercising the manager and sessions.

   use std::sync::atomic::{AtomicBool, Ordering};

   use parking_lot::Mutex;
   use tokio::sync::mpsc;

   use super::*;
   use crate::error::BridgeError;

   /// A call observed by the mock, in invocation order.
   #[derive(Debug, Clone, PartialEq, Eq)]
   pub enum Call {
      StartScan(Vec<Uuid>),
      StopScan,
      Connect(DeviceId),
      Disconnect(DeviceId),
      DiscoverServices(DeviceId),
      DiscoverCharacteristics(DeviceId, Uuid),
      SetNotify(DeviceId, Uuid, bool),
      Write {
         id: DeviceId,
         characteristic: Uuid,
         payload: Vec<u8>,
         with_response: bool,
      },
   }

   pub struct MockTransport {
      calls: Mutex<Vec<Call>>,
      events: mpsc::Sender<TransportEvent>,
      /// When set, every `write` immediately produces a `WriteComplete`.
      pub auto_ack_writes: AtomicBool,
      /// When set, `connect` fails without producing any event.
      pub fail_connects: AtomicBool,
      /// When set, `write` fails without producing a `WriteComplete`.
      pub fail_writes: AtomicBool,
   }

   impl MockTransport {
      pub fn new(events: mpsc::Sender<TransportEvent>) -> Self {
         Self {
            calls: Mutex::new(Vec::new()),
            events,
            auto_ack_writes: AtomicBool::new(false),
            fail_connects: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
         }
      }

      pub fn calls(&self) -> Vec<Call> {
         self.calls.lock().clone()
      }

      pub fn written_payloads(&self) -> Vec<Vec<u8>> {
         self
            .calls
            .lock()
            .iter()
            .filter_map(|c| match c {
               Call::Write { payload, .. } => Some(payload.clone()),
               _ => None,
            })
            .collect()
      }

      pub async fn push_event(&self, event: TransportEvent) {
         let _ = self.events.send(event).await;
      }

      fn record(&self, call: Call) {
         self.calls.lock().push(call);
      }
   }

   #[async_trait]
   impl RadioTransport for MockTransport {
      async fn start_scan(&self, service_filter: &[Uuid]) -> Result<()> {
         self.record(Call::StartScan(service_filter.to_vec()));
         Ok(())
      }

      async fn stop_scan(&self) -> Result<()> {
         self.record(Call::StopScan);
         Ok(())
      }

      async fn connect(&self, id: &DeviceId, _notify_on_disconnect: bool) -> Result<()> {
         self.record(Call::Connect(id.clone()));
         if self.fail_connects.load(Ordering::Relaxed) {
            return Err(BridgeError::ConnectionFailed(id.clone()));
         }
         Ok(())
      }

      async fn disconnect(&self, id: &DeviceId) -> Result<()> {
         self.record(Call::Disconnect(id.clone()));
         Ok(())
      }

      async fn discover_services(&self, id: &DeviceId, _service_filter: &[Uuid]) -> Result<()> {
         self.record(Call::DiscoverServices(id.clone()));
         Ok(())
      }

      async fn discover_characteristics(
         &self,
         id: &DeviceId,
         service: Uuid,
         _characteristic_filter: &[Uuid],
      ) -> Result<()> {
         self.record(Call::DiscoverCharacteristics(id.clone(), service));
         Ok(())
      }

      async fn set_notify(&self, id: &DeviceId, characteristic: Uuid, enabled: bool) -> Result<()> {
         self.record(Call::SetNotify(id.clone(), characteristic, enabled));
         Ok(())
      }

      async fn write(
         &self,
         id: &DeviceId,
         characteristic: Uuid,
         payload: &[u8],
         with_response: bool,
      ) -> Result<()> {
         self.record(Call::Write {
            id: id.clone(),
            characteristic,
            payload: payload.to_vec(),
            with_response,
         });
         if self.fail_writes.load(Ordering::Relaxed) {
            return Err(BridgeError::CharacteristicNotFound(characteristic));
         }
         if self.auto_ack_writes.load(Ordering::Relaxed) {
            let _ = self
               .events
               .send(TransportEvent::WriteComplete {
                  id: id.clone(),
                  characteristic,
                  error: None,
               })
               .await;
         }
         Ok(())
      }
   }
}
