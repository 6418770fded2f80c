//! BlueZ-backed implementation of the radio transport.
//!
//! Translates bluer adapter, device, and GATT streams into the ordered
//! [`TransportEvent`] stream the rest of the core consumes. BlueZ resolves
//! GATT services on connect, so the explicit discovery requests here wait for
//! resolution and then report what the daemon already cached.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bluer::{
   Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceProperty, Session,
   gatt::{
      WriteOp,
      remote::{Characteristic, CharacteristicWriteRequest, Service},
   },
};
use futures::stream::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::{SmolStr, ToSmolStr};
use tokio::{sync::mpsc, task::JoinHandle, time};
use uuid::Uuid;

use crate::{
   bluetooth::transport::{DeviceId, Payload, PoweredState, RadioTransport, TransportEvent},
   error::{BridgeError, Result},
};

/// How long to wait for BlueZ to finish resolving GATT services.
const SERVICE_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
/// Poll interval while waiting for service resolution.
const SERVICE_RESOLVE_POLL: Duration = Duration::from_millis(100);

struct DeviceEntry {
   device: Device,
   watch_task: Option<JoinHandle<()>>,
   services: HashMap<Uuid, Service>,
   characteristics: HashMap<Uuid, Characteristic>,
   notify_tasks: HashMap<Uuid, JoinHandle<()>>,
}

impl DeviceEntry {
   fn new(device: Device) -> Self {
      Self {
         device,
         watch_task: None,
         services: HashMap::new(),
         characteristics: HashMap::new(),
         notify_tasks: HashMap::new(),
      }
   }
}

impl Drop for DeviceEntry {
   fn drop(&mut self) {
      if let Some(handle) = self.watch_task.take() {
         handle.abort();
      }
      for (_, handle) in self.notify_tasks.drain() {
         handle.abort();
      }
   }
}

#[derive(Default)]
struct TransportState {
   scan_task: Option<JoinHandle<()>>,
   devices: HashMap<Address, DeviceEntry>,
}

/// Radio transport over the BlueZ daemon.
pub struct BluezTransport {
   adapter: Adapter,
   events: mpsc::Sender<TransportEvent>,
   state: Mutex<TransportState>,
   power_task: JoinHandle<()>,
}

impl BluezTransport {
   /// Connects to the BlueZ session and starts monitoring the default
   /// adapter's power state.
   pub async fn new(events: mpsc::Sender<TransportEvent>) -> Result<Arc<Self>> {
      let session = Session::new().await?;
      let adapter = session.default_adapter().await?;
      info!("Using Bluetooth adapter {}", adapter.name());

      let power_task = Self::start_power_monitor(adapter.clone(), events.clone()).await?;

      Ok(Arc::new(Self {
         adapter,
         events,
         state: Mutex::new(TransportState::default()),
         power_task,
      }))
   }

   async fn start_power_monitor(
      adapter: Adapter,
      events: mpsc::Sender<TransportEvent>,
   ) -> Result<JoinHandle<()>> {
      let mut adapter_events = adapter.events().await?;
      let initial = if adapter.is_powered().await.unwrap_or(false) {
         PoweredState::PoweredOn
      } else {
         PoweredState::PoweredOff
      };
      let _ = events
         .send(TransportEvent::PoweredStateChanged(initial))
         .await;

      Ok(tokio::spawn(async move {
         while let Some(event) = adapter_events.next().await {
            if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
               let state = if powered {
                  PoweredState::PoweredOn
               } else {
                  PoweredState::PoweredOff
               };
               if events
                  .send(TransportEvent::PoweredStateChanged(state))
                  .await
                  .is_err()
               {
                  break;
               }
            }
         }
      }))
   }

   fn parse_addr(id: &DeviceId) -> Result<Address> {
      id.parse::<Address>()
         .map_err(|_| BridgeError::InvalidAddress(id.clone()))
   }

   fn device(&self, id: &DeviceId) -> Result<Device> {
      let addr = Self::parse_addr(id)?;
      let state = self.state.lock();
      state
         .devices
         .get(&addr)
         .map(|entry| entry.device.clone())
         .ok_or_else(|| BridgeError::DeviceNotFound(id.clone()))
   }

   fn start_disconnect_watch(&self, id: DeviceId, device: Device) -> JoinHandle<()> {
      let events = self.events.clone();
      tokio::spawn(async move {
         let Ok(mut stream) = device.events().await else {
            return;
         };
         while let Some(event) = stream.next().await {
            let bluer::DeviceEvent::PropertyChanged(DeviceProperty::Connected(connected)) = event
            else {
               continue;
            };
            if !connected {
               debug!("{id}: link reported down by bluetoothd");
               let _ = events
                  .send(TransportEvent::Disconnected {
                     id: id.clone(),
                     error: None,
                  })
                  .await;
               break;
            }
         }
      })
   }

   async fn wait_services_resolved(device: &Device) -> Result<()> {
      let deadline = time::Instant::now() + SERVICE_RESOLVE_TIMEOUT;
      loop {
         if device.is_services_resolved().await? {
            return Ok(());
         }
         if time::Instant::now() >= deadline {
            return Err(BridgeError::RequestTimeout);
         }
         time::sleep(SERVICE_RESOLVE_POLL).await;
      }
   }
}

impl Drop for BluezTransport {
   fn drop(&mut self) {
      self.power_task.abort();
      let mut state = self.state.lock();
      if let Some(handle) = state.scan_task.take() {
         handle.abort();
      }
      state.devices.clear();
   }
}

#[async_trait::async_trait]
impl RadioTransport for BluezTransport {
   async fn start_scan(&self, service_filter: &[Uuid]) -> Result<()> {
      let adapter = self.adapter.clone();
      let events = self.events.clone();
      let filter = service_filter.to_vec();

      let handle = tokio::spawn(async move {
         let discover = match adapter.discover_devices().await {
            Ok(stream) => stream,
            Err(e) => {
               warn!("Failed to start device discovery: {e}");
               return;
            },
         };
         futures::pin_mut!(discover);

         while let Some(event) = discover.next().await {
            let AdapterEvent::DeviceAdded(addr) = event else {
               continue;
            };
            let Ok(device) = adapter.device(addr) else {
               continue;
            };

            if !filter.is_empty() {
               let advertised = device.uuids().await.ok().flatten().unwrap_or_default();
               if !filter.iter().any(|uuid| advertised.contains(uuid)) {
                  continue;
               }
            }

            let advertised_name = device
               .name()
               .await
               .ok()
               .flatten()
               .map(SmolStr::from)
               .unwrap_or_else(|| addr.to_smolstr());
            let rssi = device.rssi().await.ok().flatten();

            if events
               .send(TransportEvent::DeviceDiscovered {
                  id: addr.to_smolstr(),
                  advertised_name,
                  rssi,
               })
               .await
               .is_err()
            {
               break;
            }
         }
      });

      let mut state = self.state.lock();
      if let Some(previous) = state.scan_task.replace(handle) {
         previous.abort();
      }
      Ok(())
   }

   async fn stop_scan(&self) -> Result<()> {
      // Dropping the discovery stream releases the bluetoothd scan session.
      if let Some(handle) = self.state.lock().scan_task.take() {
         handle.abort();
      }
      Ok(())
   }

   async fn connect(&self, id: &DeviceId, notify_on_disconnect: bool) -> Result<()> {
      let addr = Self::parse_addr(id)?;
      let device = self.adapter.device(addr)?;

      if let Err(e) = device.connect().await {
         let _ = self
            .events
            .send(TransportEvent::ConnectFailed(id.clone(), e.to_string()))
            .await;
         return Err(e.into());
      }

      let mut entry = DeviceEntry::new(device.clone());
      if notify_on_disconnect {
         entry.watch_task = Some(self.start_disconnect_watch(id.clone(), device));
      }
      self.state.lock().devices.insert(addr, entry);

      let _ = self
         .events
         .send(TransportEvent::Connected(id.clone()))
         .await;
      Ok(())
   }

   async fn disconnect(&self, id: &DeviceId) -> Result<()> {
      let addr = Self::parse_addr(id)?;
      // Remove the entry first so its watch task cannot race a second
      // Disconnected event.
      let entry = self.state.lock().devices.remove(&addr);
      let Some(entry) = entry else {
         return Ok(());
      };

      let device = entry.device.clone();
      drop(entry);
      if let Err(e) = device.disconnect().await {
         warn!("{id}: disconnect request failed: {e}");
      }

      let _ = self
         .events
         .send(TransportEvent::Disconnected {
            id: id.clone(),
            error: None,
         })
         .await;
      Ok(())
   }

   async fn discover_services(&self, id: &DeviceId, service_filter: &[Uuid]) -> Result<()> {
      let addr = Self::parse_addr(id)?;
      let device = self.device(id)?;

      Self::wait_services_resolved(&device).await?;

      let mut found = Vec::new();
      let mut handles = HashMap::new();
      for service in device.services().await? {
         let uuid = service.uuid().await?;
         if service_filter.is_empty() || service_filter.contains(&uuid) {
            found.push(uuid);
            handles.insert(uuid, service);
         }
      }

      if let Some(entry) = self.state.lock().devices.get_mut(&addr) {
         entry.services.extend(handles);
      }

      let _ = self
         .events
         .send(TransportEvent::ServicesDiscovered {
            id: id.clone(),
            services: found,
         })
         .await;
      Ok(())
   }

   async fn discover_characteristics(
      &self,
      id: &DeviceId,
      service: Uuid,
      characteristic_filter: &[Uuid],
   ) -> Result<()> {
      let addr = Self::parse_addr(id)?;
      let service_handle = {
         let state = self.state.lock();
         state
            .devices
            .get(&addr)
            .and_then(|entry| entry.services.get(&service))
            .cloned()
            .ok_or(BridgeError::ServiceNotFound(service))?
      };

      let mut found = Vec::new();
      let mut handles = HashMap::new();
      for characteristic in service_handle.characteristics().await? {
         let uuid = characteristic.uuid().await?;
         if characteristic_filter.is_empty() || characteristic_filter.contains(&uuid) {
            found.push(uuid);
            handles.insert(uuid, characteristic);
         }
      }

      if let Some(entry) = self.state.lock().devices.get_mut(&addr) {
         entry.characteristics.extend(handles);
      }

      let _ = self
         .events
         .send(TransportEvent::CharacteristicsDiscovered {
            id: id.clone(),
            service,
            characteristics: found,
         })
         .await;
      Ok(())
   }

   async fn set_notify(&self, id: &DeviceId, characteristic: Uuid, enabled: bool) -> Result<()> {
      let addr = Self::parse_addr(id)?;

      if !enabled {
         if let Some(entry) = self.state.lock().devices.get_mut(&addr)
            && let Some(handle) = entry.notify_tasks.remove(&characteristic)
         {
            handle.abort();
         }
         return Ok(());
      }

      let handle = {
         let state = self.state.lock();
         state
            .devices
            .get(&addr)
            .and_then(|entry| entry.characteristics.get(&characteristic))
            .cloned()
            .ok_or(BridgeError::CharacteristicNotFound(characteristic))?
      };

      let mut stream = Box::pin(handle.notify().await?);
      let events = self.events.clone();
      let id = id.clone();
      let task = tokio::spawn(async move {
         while let Some(value) = stream.next().await {
            if events
               .send(TransportEvent::ValueUpdated {
                  id: id.clone(),
                  characteristic,
                  value: Payload::from_slice(&value),
               })
               .await
               .is_err()
            {
               break;
            }
         }
      });

      if let Some(entry) = self.state.lock().devices.get_mut(&addr)
         && let Some(previous) = entry.notify_tasks.insert(characteristic, task)
      {
         previous.abort();
      }
      Ok(())
   }

   async fn write(
      &self,
      id: &DeviceId,
      characteristic: Uuid,
      payload: &[u8],
      with_response: bool,
   ) -> Result<()> {
      let addr = Self::parse_addr(id)?;
      let handle = {
         let state = self.state.lock();
         state
            .devices
            .get(&addr)
            .and_then(|entry| entry.characteristics.get(&characteristic))
            .cloned()
            .ok_or(BridgeError::CharacteristicNotFound(characteristic))?
      };

      let request = CharacteristicWriteRequest {
         op_type: if with_response {
            WriteOp::Request
         } else {
            WriteOp::Command
         },
         ..Default::default()
      };

      let result = handle.write_ext(payload, &request).await;
      let _ = self
         .events
         .send(TransportEvent::WriteComplete {
            id: id.clone(),
            characteristic,
            error: result.as_ref().err().map(ToString::to_string),
         })
         .await;
      result.map_err(Into::into)
   }
}
