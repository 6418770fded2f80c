//! Bluetooth central manager.
//!
//! This module owns scanning, the discovery registry, and connection
//! brokering. A single actor task serializes every state change: user
//! commands, watchdog expirations, and transport events all funnel into one
//! `select!` loop, so scan state and the device tables never need locks.

use std::{collections::HashMap, sync::Arc, time::Duration};

use log::{debug, info, warn};
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time,
};
use uuid::Uuid;

use crate::{
   bluetooth::transport::{DeviceId, PoweredState, RadioTransport, TransportEvent},
   config::Config,
   error::{BridgeError, Result},
   event::{BridgeEvent, EventSender},
   naming,
   robot::session::{DeviceKind, DeviceSession},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

// === Scanning ===

/// Current scanning mode of the central.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ScanState {
   NotScanning,
   /// Discovery scan populating the registry, limited by its watchdog.
   SearchingScan,
   /// Unfiltered counting scan incrementing a counter only.
   CountingScan,
}

/// One registry entry produced by a searching scan.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
   pub id: DeviceId,
   pub advertised_name: SmolStr,
   pub display_name: SmolStr,
   pub rssi: Option<i16>,
}

// === Commands ===

enum ManagerCommand {
   StartDiscoveryScan(Vec<Uuid>, oneshot::Sender<Result<()>>),
   StartCountingScan(oneshot::Sender<Result<()>>),
   StopScan(oneshot::Sender<Result<()>>),
   ScanWatchdog(u64),

   Connect(DeviceId, DeviceKind, oneshot::Sender<Result<DeviceSession>>),
   ConnectTimeout(DeviceId, u64),
   Disconnect(DeviceId, oneshot::Sender<Result<()>>),

   GetScanState(oneshot::Sender<ScanState>),
   GetDeviceCount(oneshot::Sender<u32>),
   GetDiscovered(oneshot::Sender<Vec<DiscoveredDevice>>),
   GetSession(DeviceId, oneshot::Sender<Option<DeviceSession>>),
   GetAllSessions(oneshot::Sender<Vec<DeviceSession>>),
}

// === Main Manager ===

/// High-level interface to the Bluetooth central.
///
/// All methods are safe to call concurrently; they forward to the manager
/// actor and await its reply.
pub struct CentralManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl CentralManager {
   pub fn new(
      transport: Arc<dyn RadioTransport>,
      transport_rx: mpsc::Receiver<TransportEvent>,
      config: Config,
      event_tx: EventSender,
   ) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(ManagerActor::new(transport, transport_rx, config, event_tx, command_rx).run());
      Self { inbox: command_tx }
   }

   /// Starts a discovery scan for peripherals advertising one of the given
   /// services. A no-op while a discovery scan is already running.
   pub async fn start_discovery_scan(&self, service_filter: Vec<Uuid>) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::StartDiscoveryScan(service_filter, tx))
         .await
         .map_err(|_| BridgeError::ManagerShutdown)?;
      rx.await.map_err(|_| BridgeError::ManagerShutdown)?
   }

   /// Starts an unfiltered counting scan.
   pub async fn start_counting_scan(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::StartCountingScan(tx))
         .await
         .map_err(|_| BridgeError::ManagerShutdown)?;
      rx.await.map_err(|_| BridgeError::ManagerShutdown)?
   }

   /// Stops whatever scan is running. Succeeds if nothing is scanning.
   pub async fn stop_scan(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::StopScan(tx))
         .await
         .map_err(|_| BridgeError::ManagerShutdown)?;
      rx.await.map_err(|_| BridgeError::ManagerShutdown)?
   }

   /// Connects to a previously discovered peripheral and resolves once its
   /// session exists or the attempt failed.
   pub async fn connect(&self, id: DeviceId, kind: DeviceKind) -> Result<DeviceSession> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Connect(id, kind, tx))
         .await
         .map_err(|_| BridgeError::ManagerShutdown)?;
      rx.await.map_err(|_| BridgeError::ManagerShutdown)?
   }

   /// Tears down the session for a connected peripheral.
   pub async fn disconnect(&self, id: DeviceId) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Disconnect(id, tx))
         .await
         .map_err(|_| BridgeError::ManagerShutdown)?;
      rx.await.map_err(|_| BridgeError::ManagerShutdown)?
   }

   pub async fn scan_state(&self) -> ScanState {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::GetScanState(tx))
         .await
         .is_err()
      {
         return ScanState::NotScanning;
      }
      rx.await.unwrap_or(ScanState::NotScanning)
   }

   /// Number of advertisements seen by the current counting scan.
   pub async fn device_count(&self) -> u32 {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::GetDeviceCount(tx))
         .await
         .is_err()
      {
         return 0;
      }
      rx.await.unwrap_or_default()
   }

   pub async fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::GetDiscovered(tx))
         .await
         .is_err()
      {
         return Vec::new();
      }
      rx.await.unwrap_or_default()
   }

   pub async fn session(&self, id: DeviceId) -> Option<DeviceSession> {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::GetSession(id, tx))
         .await
         .is_err()
      {
         return None;
      }
      rx.await.ok().flatten()
   }

   pub async fn connected_devices(&self) -> Vec<DeviceSession> {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::GetAllSessions(tx))
         .await
         .is_err()
      {
         return Vec::new();
      }
      rx.await.unwrap_or_default()
   }
}

// === Manager Actor ===

struct PendingConnect {
   kind: DeviceKind,
   advertised_name: SmolStr,
   reply: Option<oneshot::Sender<Result<DeviceSession>>>,
   generation: u64,
   watchdog: JoinHandle<()>,
}

struct ManagerActor {
   transport: Arc<dyn RadioTransport>,
   transport_rx: mpsc::Receiver<TransportEvent>,
   config: Config,
   event_tx: EventSender,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::Receiver<ManagerCommand>,
   loopback_tx: mpsc::Sender<ManagerCommand>,

   // State
   powered: PoweredState,
   scan_state: ScanState,
   scan_watchdog: Option<JoinHandle<()>>,
   scan_generation: u64,
   connect_generation: u64,
   device_count: u32,
   discovered: HashMap<DeviceId, DiscoveredDevice>,
   pending: HashMap<DeviceId, PendingConnect>,
   connected: HashMap<DeviceId, DeviceSession>,
}

impl ManagerActor {
   fn new(
      transport: Arc<dyn RadioTransport>,
      transport_rx: mpsc::Receiver<TransportEvent>,
      config: Config,
      event_tx: EventSender,
      command_rx: mpsc::Receiver<ManagerCommand>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         transport,
         transport_rx,
         config,
         event_tx,
         command_rx,
         loopback_rx,
         loopback_tx,
         powered: PoweredState::Unknown,
         scan_state: ScanState::NotScanning,
         scan_watchdog: None,
         scan_generation: 0,
         connect_generation: 0,
         device_count: 0,
         discovered: HashMap::new(),
         pending: HashMap::new(),
         connected: HashMap::new(),
      }
   }

   async fn run(mut self) {
      info!("Bluetooth central manager starting up");

      loop {
         select! {
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Bluetooth central manager shutting down");
                     break;
                 };
                 self.handle_command(cmd).await;
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 self.handle_command(cmd).await;
             }
             event = self.transport_rx.recv() => {
                 let Some(event) = event else {
                     warn!("Transport event stream closed, shutting down");
                     break;
                 };
                 self.handle_transport_event(event).await;
             }
         }
      }

      self.cleanup().await;
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::StartDiscoveryScan(filter, reply) => {
            let _ = reply.send(self.start_discovery_scan(filter).await);
         },
         ManagerCommand::StartCountingScan(reply) => {
            let _ = reply.send(self.start_counting_scan().await);
         },
         ManagerCommand::StopScan(reply) => {
            self.stop_scan().await;
            let _ = reply.send(Ok(()));
         },
         ManagerCommand::ScanWatchdog(generation) => {
            if generation == self.scan_generation && self.scan_state != ScanState::NotScanning {
               info!("Scan watchdog fired, stopping {} scan", self.scan_state);
               self.stop_scan().await;
            }
         },
         ManagerCommand::Connect(id, kind, reply) => {
            self.handle_connect(id, kind, reply).await;
         },
         ManagerCommand::ConnectTimeout(id, generation) => {
            self.handle_connect_timeout(id, generation).await;
         },
         ManagerCommand::Disconnect(id, reply) => {
            let _ = reply.send(self.handle_disconnect(id).await);
         },
         ManagerCommand::GetScanState(reply) => {
            let _ = reply.send(self.scan_state);
         },
         ManagerCommand::GetDeviceCount(reply) => {
            let _ = reply.send(self.device_count);
         },
         ManagerCommand::GetDiscovered(reply) => {
            let _ = reply.send(self.discovered.values().cloned().collect());
         },
         ManagerCommand::GetSession(id, reply) => {
            let _ = reply.send(self.connected.get(&id).cloned());
         },
         ManagerCommand::GetAllSessions(reply) => {
            let _ = reply.send(self.connected.values().cloned().collect());
         },
      }
   }

   // === Scanning ===

   async fn start_discovery_scan(&mut self, filter: Vec<Uuid>) -> Result<()> {
      match self.scan_state {
         ScanState::SearchingScan => return Ok(()),
         ScanState::CountingScan => self.stop_scan().await,
         ScanState::NotScanning => {},
      }
      if !self.powered.is_usable() {
         return Err(BridgeError::RadioNotPowered);
      }

      // Stale registry entries would offer connections to absent devices.
      self.discovered.clear();
      self.transport.start_scan(&filter).await?;
      self.arm_scan_watchdog(Duration::from_secs(self.config.discovery_scan_secs));
      self.scan_state = ScanState::SearchingScan;
      info!("Started discovery scan");
      Ok(())
   }

   async fn start_counting_scan(&mut self) -> Result<()> {
      match self.scan_state {
         ScanState::CountingScan => return Ok(()),
         ScanState::SearchingScan => self.stop_scan().await,
         ScanState::NotScanning => {},
      }
      if !self.powered.is_usable() {
         return Err(BridgeError::RadioNotPowered);
      }

      self.device_count = 0;
      self.transport.start_scan(&[]).await?;
      self.arm_scan_watchdog(Duration::from_secs(self.config.counting_scan_secs));
      self.scan_state = ScanState::CountingScan;
      info!("Started counting scan");
      Ok(())
   }

   async fn stop_scan(&mut self) {
      if self.scan_state == ScanState::NotScanning {
         return;
      }
      if let Err(e) = self.transport.stop_scan().await {
         warn!("Failed to stop scan: {e}");
      }
      if let Some(handle) = self.scan_watchdog.take() {
         handle.abort();
      }
      let previous = std::mem::replace(&mut self.scan_state, ScanState::NotScanning);
      info!("Stopped {previous} scan");
      self.event_tx.emit(BridgeEvent::ScanStopped(previous));
   }

   fn arm_scan_watchdog(&mut self, duration: Duration) {
      self.scan_generation += 1;
      let generation = self.scan_generation;
      let loopback = self.loopback_tx.clone();
      self.scan_watchdog = Some(tokio::spawn(async move {
         time::sleep(duration).await;
         let _ = loopback.send(ManagerCommand::ScanWatchdog(generation)).await;
      }));
   }

   // === Connections ===

   async fn handle_connect(
      &mut self,
      id: DeviceId,
      kind: DeviceKind,
      reply: oneshot::Sender<Result<DeviceSession>>,
   ) {
      if let Some(session) = self.connected.get(&id) {
         let _ = reply.send(Ok(session.clone()));
         return;
      }
      if self.pending.contains_key(&id) {
         let _ = reply.send(Err(BridgeError::AlreadyConnecting));
         return;
      }
      let Some(discovered) = self.discovered.get(&id) else {
         let _ = reply.send(Err(BridgeError::DeviceNotDiscovered(id)));
         return;
      };
      let advertised_name = discovered.advertised_name.clone();

      if let Err(e) = self.transport.connect(&id, true).await {
         warn!("Connection to {id} failed: {e}");
         let _ = reply.send(Err(e));
         self.event_tx.emit(BridgeEvent::ConnectionFailed(id));
         return;
      }

      self.connect_generation += 1;
      let generation = self.connect_generation;
      let loopback = self.loopback_tx.clone();
      let timeout = Duration::from_secs(self.config.connect_timeout_secs);
      let watchdog = {
         let id = id.clone();
         tokio::spawn(async move {
            time::sleep(timeout).await;
            let _ = loopback
               .send(ManagerCommand::ConnectTimeout(id, generation))
               .await;
         })
      };

      self.pending.insert(
         id,
         PendingConnect {
            kind,
            advertised_name,
            reply: Some(reply),
            generation,
            watchdog,
         },
      );
   }

   async fn handle_connect_timeout(&mut self, id: DeviceId, generation: u64) {
      let timed_out = self
         .pending
         .get(&id)
         .is_some_and(|p| p.generation == generation);
      if !timed_out {
         return;
      }

      warn!("Connection to {id} timed out");
      if let Some(mut pending) = self.pending.remove(&id)
         && let Some(reply) = pending.reply.take()
      {
         let _ = reply.send(Err(BridgeError::RequestTimeout));
      }
      // Cancel whatever the platform still has in flight.
      if let Err(e) = self.transport.disconnect(&id).await {
         debug!("Cleanup disconnect for {id} failed: {e}");
      }
      self.event_tx.emit(BridgeEvent::ConnectionFailed(id));
   }

   async fn handle_disconnect(&mut self, id: DeviceId) -> Result<()> {
      let Some(session) = self.connected.remove(&id) else {
         return Err(BridgeError::DeviceNotFound(id));
      };
      session.disconnect().await;
      self.event_tx.emit(BridgeEvent::DeviceDisconnected(id));
      Ok(())
   }

   // === Transport events ===

   async fn handle_transport_event(&mut self, event: TransportEvent) {
      match event {
         TransportEvent::PoweredStateChanged(state) => {
            self.handle_powered_state(state).await;
         },
         TransportEvent::DeviceDiscovered {
            id,
            advertised_name,
            rssi,
         } => {
            self.handle_device_discovered(id, advertised_name, rssi);
         },
         TransportEvent::Connected(id) => {
            self.handle_connected(id).await;
         },
         TransportEvent::ConnectFailed(id, reason) => {
            self.handle_connect_failed(id, &reason);
         },
         TransportEvent::Disconnected { id, error } => {
            self.handle_disconnected(id, error.as_deref());
         },
         TransportEvent::ServicesDiscovered { id, services } => {
            if let Some(session) = self.connected.get(&id) {
               session.handle_services_discovered(&services).await;
            }
         },
         TransportEvent::CharacteristicsDiscovered {
            id,
            service,
            characteristics,
         } => {
            if let Some(session) = self.connected.get(&id) {
               session
                  .handle_characteristics_discovered(service, &characteristics)
                  .await;
            }
         },
         TransportEvent::WriteComplete { id, error, .. } => {
            if let Some(session) = self.connected.get(&id) {
               session.on_write_complete(error.as_deref());
            }
         },
         TransportEvent::ValueUpdated {
            id,
            characteristic,
            value,
         } => {
            if let Some(session) = self.connected.get(&id) {
               session.on_value_updated(characteristic, &value);
            }
         },
      }
   }

   async fn handle_powered_state(&mut self, state: PoweredState) {
      if state == self.powered {
         return;
      }
      info!("Radio power state changed: {} -> {state}", self.powered);
      self.powered = state;

      if !state.is_usable() && self.scan_state != ScanState::NotScanning {
         warn!("Radio no longer usable, stopping scan");
         self.stop_scan().await;
      }
   }

   fn handle_device_discovered(
      &mut self,
      id: DeviceId,
      advertised_name: SmolStr,
      rssi: Option<i16>,
   ) {
      match self.scan_state {
         ScanState::SearchingScan => {
            // Connected devices stop advertising; anything still in the air
            // under a live session is a stale report.
            if self.connected.contains_key(&id) {
               return;
            }
            let display_name = self.display_name(&id, &advertised_name);
            debug!("Discovered {id} ({display_name}), rssi {rssi:?}");
            self.discovered.insert(
               id.clone(),
               DiscoveredDevice {
                  id: id.clone(),
                  advertised_name,
                  display_name: display_name.clone(),
                  rssi,
               },
            );
            self
               .event_tx
               .emit(BridgeEvent::DeviceDiscovered { id, display_name });
         },
         ScanState::CountingScan => {
            self.device_count += 1;
         },
         ScanState::NotScanning => {},
      }
   }

   async fn handle_connected(&mut self, id: DeviceId) {
      let Some(mut pending) = self.pending.remove(&id) else {
         if !self.connected.contains_key(&id) {
            // Sessions are only created through connect(); kick out
            // whatever the platform connected on its own.
            warn!("Unexpected connection from {id}, disconnecting");
            if let Err(e) = self.transport.disconnect(&id).await {
               warn!("Failed to disconnect {id}: {e}");
            }
         }
         return;
      };
      pending.watchdog.abort();
      self.discovered.remove(&id);

      info!("Connected to {id}");
      let session = DeviceSession::new(
         id.clone(),
         pending.advertised_name,
         pending.kind,
         self.transport.clone(),
      );
      if let Err(e) = session.begin_discovery().await {
         warn!("Service discovery for {id} failed to start: {e}");
      }
      self.connected.insert(id.clone(), session.clone());

      if let Some(reply) = pending.reply.take() {
         let _ = reply.send(Ok(session));
      }
      self.event_tx.emit(BridgeEvent::DeviceConnected(id));
   }

   fn handle_connect_failed(&mut self, id: DeviceId, reason: &str) {
      let Some(mut pending) = self.pending.remove(&id) else {
         return;
      };
      pending.watchdog.abort();

      warn!("Connection to {id} failed: {reason}");
      if let Some(reply) = pending.reply.take() {
         let _ = reply.send(Err(BridgeError::ConnectionFailed(id.clone())));
      }
      self.event_tx.emit(BridgeEvent::ConnectionFailed(id));
   }

   fn handle_disconnected(&mut self, id: DeviceId, error: Option<&str>) {
      if let Some(mut pending) = self.pending.remove(&id) {
         pending.watchdog.abort();
         if let Some(reply) = pending.reply.take() {
            let _ = reply.send(Err(BridgeError::ConnectionFailed(id.clone())));
         }
         self.event_tx.emit(BridgeEvent::ConnectionFailed(id));
         return;
      }

      let Some(session) = self.connected.remove(&id) else {
         return;
      };
      if let Some(e) = error {
         warn!("Link to {id} lost: {e}");
      }
      session.handle_link_loss();
      self.event_tx.emit(BridgeEvent::DeviceDisconnected(id));
   }

   /// User-assigned name from config wins, then the derived friendly name,
   /// then the raw advertised name.
   fn display_name(&self, id: &DeviceId, advertised_name: &str) -> SmolStr {
      if let Some(known) = self.config.is_known_device(id) {
         return SmolStr::new(known);
      }
      naming::derive_friendly_name(advertised_name)
         .map(SmolStr::from)
         .unwrap_or_else(|| SmolStr::new(advertised_name))
   }

   async fn cleanup(&mut self) {
      info!("Cleaning up Bluetooth central manager");

      self.stop_scan().await;

      for (id, mut pending) in self.pending.drain() {
         pending.watchdog.abort();
         if let Some(reply) = pending.reply.take() {
            let _ = reply.send(Err(BridgeError::ManagerShutdown));
         }
         let _ = self.transport.disconnect(&id).await;
      }

      for (_, session) in self.connected.drain() {
         session.disconnect().await;
      }
   }
}
