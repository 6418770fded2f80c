//! Device session and actuator synchronization engine.
//!
//! One [`DeviceSession`] drives one connected peripheral from GATT discovery
//! through steady-state control. The heart of the session is a debounced,
//! acknowledgment-gated synchronization loop: callers mutate a `next`
//! actuator state under the sync lock, a 32 Hz timer reconciles it against
//! the `current` state last written to hardware, and only one write is ever
//! in flight on the link.

use core::fmt;
use std::{
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::{Duration, Instant},
};

use crossbeam::atomic::AtomicCell;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use serde_json::json;
use smol_str::SmolStr;
use tokio::{
   sync::oneshot,
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};
use uuid::Uuid;

use crate::{
   bluetooth::transport::{DeviceId, RadioTransport},
   error::{BridgeError, Result},
   naming,
   robot::{
      protocol::{
         ADALE_COMMAND_MODE_TOGGLE, ADALE_GET_MAC, ADALE_RESET, CMD_POLL_START, CMD_POLL_STOP,
         CMD_STOP_ALL, MAC_REPLY_LEN, RX_CHARACTERISTIC, SENSOR_SNAPSHOT_LEN, TELEMETRY_FRAME_LEN,
         TX_CHARACTERISTIC, UART_SERVICE, parse_mac_reply, set_all_command, set_name_command,
      },
      state::{
         LED_COUNT, MOTOR_COUNT, MOTOR_SPEED_MAX, OutputState, SERVO_COUNT, TRILED_COUNT, TriLed,
         VIBRATOR_COUNT,
      },
   },
};

/// Synchronization cycle period (32 Hz).
const SYNC_INTERVAL: Duration = Duration::from_micros(31_250);
/// A packet is resent after this much quiet time to feed the device watchdog.
const CACHE_TIMEOUT: Duration = Duration::from_millis(100);
/// Bounded re-check period for callers waiting on slot convergence.
const WAIT_REFRESH: Duration = Duration::from_millis(500);
/// Settle delay after commands that flip firmware modes.
const SETTLE_DELAY: Duration = Duration::from_millis(100);
/// How long to wait for a command-mode reply.
const COMMAND_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Kind of peripheral behind a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum DeviceKind {
   /// Full actuator + sensor robot driven by the synchronization loop.
   Robot,
   /// Simple accessory with no steady-state control channel.
   Accessory,
}

/// Session lifecycle, advanced by transport events only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Lifecycle {
   DiscoveringServices,
   DiscoveringCharacteristics,
   Initializing,
   Ready,
   Disconnected,
}

/// State guarded by the sync lock.
struct SyncState {
   next: OutputState,
   current: OutputState,
   last_write_written: bool,
   last_send: Instant,
}

#[derive(Default)]
struct SessionTasks {
   init: Option<JoinHandle<()>>,
   sync: Option<JoinHandle<()>>,
}

struct SessionInner {
   id: DeviceId,
   advertised_name: SmolStr,
   kind: DeviceKind,
   transport: Arc<dyn RadioTransport>,
   lifecycle: AtomicCell<Lifecycle>,
   connected: AtomicBool,
   command_mode: AtomicBool,
   shutdown: AtomicBool,
   sync: Mutex<SyncState>,
   written: Condvar,
   sensor: Mutex<[u8; SENSOR_SNAPSHOT_LEN]>,
   mac_reply: Mutex<Option<oneshot::Sender<SmolStr>>>,
   tasks: Mutex<SessionTasks>,
}

/// A session driving one connected peripheral.
///
/// This type is cheaply cloneable and thread-safe; actuator setters may be
/// called from any thread.
#[derive(Clone)]
pub struct DeviceSession(Arc<SessionInner>);

impl fmt::Debug for DeviceSession {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("DeviceSession")
         .field("id", &self.0.id)
         .field("kind", &self.0.kind)
         .field("lifecycle", &self.lifecycle())
         .finish()
   }
}

impl DeviceSession {
   pub(crate) fn new(
      id: DeviceId,
      advertised_name: SmolStr,
      kind: DeviceKind,
      transport: Arc<dyn RadioTransport>,
   ) -> Self {
      Self(Arc::new(SessionInner {
         id,
         advertised_name,
         kind,
         transport,
         lifecycle: AtomicCell::new(Lifecycle::DiscoveringServices),
         connected: AtomicBool::new(true),
         command_mode: AtomicBool::new(false),
         shutdown: AtomicBool::new(false),
         sync: Mutex::new(SyncState {
            next: OutputState::default(),
            current: OutputState::default(),
            last_write_written: true,
            last_send: Instant::now(),
         }),
         written: Condvar::new(),
         sensor: Mutex::new([0; SENSOR_SNAPSHOT_LEN]),
         mac_reply: Mutex::new(None),
         tasks: Mutex::new(SessionTasks::default()),
      }))
   }

   pub fn id(&self) -> &DeviceId {
      &self.0.id
   }

   pub fn kind(&self) -> DeviceKind {
      self.0.kind
   }

   pub fn lifecycle(&self) -> Lifecycle {
      self.0.lifecycle.load()
   }

   pub fn advertised_name(&self) -> &SmolStr {
      &self.0.advertised_name
   }

   /// Human-friendly display name, falling back to the advertised name when
   /// it cannot be derived.
   pub fn display_name(&self) -> SmolStr {
      naming::derive_friendly_name(&self.0.advertised_name)
         .map(SmolStr::from)
         .unwrap_or_else(|| self.0.advertised_name.clone())
   }

   pub fn is_connected(&self) -> bool {
      self.0.connected.load(Ordering::Relaxed) && self.lifecycle() != Lifecycle::Disconnected
   }

   /// Latest decoded sensor frame. Stale-but-recent reads are fine; this
   /// never blocks on the telemetry path.
   pub fn read_sensor_frame(&self) -> [u8; SENSOR_SNAPSHOT_LEN] {
      *self.0.sensor.lock()
   }

   /// Converts the session state to a JSON snapshot for the API layer.
   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "address": self.0.id.as_str(),
          "advertised_name": self.0.advertised_name.as_str(),
          "display_name": self.display_name().as_str(),
          "kind": self.kind().to_string(),
          "state": self.lifecycle().to_string(),
          "connected": self.is_connected(),
          "sensors": self.read_sensor_frame(),
      })
   }

   // === Discovery sequence ===

   /// Kicks off GATT discovery of the device's primary service.
   pub(crate) async fn begin_discovery(&self) -> Result<()> {
      self
         .0
         .transport
         .discover_services(&self.0.id, &[UART_SERVICE])
         .await
   }

   pub(crate) async fn handle_services_discovered(&self, services: &[Uuid]) {
      if self.lifecycle() != Lifecycle::DiscoveringServices {
         return;
      }
      if !services.contains(&UART_SERVICE) {
         warn!("{}: primary service not present on device", self.0.id);
         return;
      }

      self.0.lifecycle.store(Lifecycle::DiscoveringCharacteristics);
      if let Err(e) = self
         .0
         .transport
         .discover_characteristics(
            &self.0.id,
            UART_SERVICE,
            &[RX_CHARACTERISTIC, TX_CHARACTERISTIC],
         )
         .await
      {
         warn!("{}: characteristic discovery failed: {e}", self.0.id);
      }
   }

   pub(crate) async fn handle_characteristics_discovered(
      &self,
      service: Uuid,
      characteristics: &[Uuid],
   ) {
      if service != UART_SERVICE || self.lifecycle() != Lifecycle::DiscoveringCharacteristics {
         return;
      }
      if !characteristics.contains(&RX_CHARACTERISTIC)
         || !characteristics.contains(&TX_CHARACTERISTIC)
      {
         warn!("{}: RX/TX characteristics incomplete", self.0.id);
         return;
      }

      // The firmware expects notifications armed on both lines.
      for characteristic in [RX_CHARACTERISTIC, TX_CHARACTERISTIC] {
         if let Err(e) = self
            .0
            .transport
            .set_notify(&self.0.id, characteristic, true)
            .await
         {
            warn!("{}: enabling notifications failed: {e}", self.0.id);
         }
      }

      match self.0.kind {
         DeviceKind::Accessory => {
            self.0.lifecycle.store(Lifecycle::Ready);
            info!("{}: accessory session ready", self.0.id);
         },
         DeviceKind::Robot => {
            self.0.lifecycle.store(Lifecycle::Initializing);
            let this = self.clone();
            let handle = tokio::spawn(async move {
               this.run_initialization().await;
            });
            self.0.tasks.lock().init = Some(handle);
         },
      }
   }

   // === Initialization handshake ===

   /// Forces the firmware to a known baseline; a previous session may have
   /// left it polling or stuck in command mode.
   async fn run_initialization(&self) {
      if let Err(e) = self.write_tx(CMD_STOP_ALL).await {
         warn!("{}: stop-all during init failed: {e}", self.0.id);
      }
      time::sleep(SETTLE_DELAY).await;
      if let Err(e) = self.write_tx(CMD_POLL_STOP).await {
         warn!("{}: poll-stop during init failed: {e}", self.0.id);
      }
      time::sleep(SETTLE_DELAY).await;
      self.finish_initialization().await;
   }

   async fn finish_initialization(&self) {
      if self.0.command_mode.load(Ordering::Relaxed)
         && let Err(e) = self.exit_command_mode().await
      {
         warn!("{}: could not leave command mode: {e}", self.0.id);
      }

      if let Err(e) = self.write_tx(CMD_POLL_START).await {
         warn!("{}: poll-start during init failed: {e}", self.0.id);
      }

      self.0.lifecycle.store(Lifecycle::Ready);
      let this = self.clone();
      let handle = tokio::spawn(async move {
         let mut ticker = time::interval(SYNC_INTERVAL);
         ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
         // First tick fires immediately.
         loop {
            ticker.tick().await;
            if this.0.shutdown.load(Ordering::Relaxed) {
               break;
            }
            this.synchronize().await;
         }
      });
      self.0.tasks.lock().sync = Some(handle);
      info!("{}: session ready", self.0.id);
   }

   // === Actuator state synchronization ===

   /// One sync tick: transmit `next` if it diverged from `current` or the
   /// cache timeout elapsed, but never while a write is still unacknowledged.
   pub(crate) async fn synchronize(&self) {
      let packet = {
         let mut sync = self.0.sync.lock();
         if self.lifecycle() != Lifecycle::Ready {
            return;
         }
         if !sync.last_write_written {
            debug!("{}: sync tick missed, write still in flight", self.0.id);
            return;
         }
         let changed = sync.next != sync.current;
         let stale = sync.last_send.elapsed() > CACHE_TIMEOUT;
         if !changed && !stale {
            return;
         }

         sync.last_write_written = false;
         sync.last_send = Instant::now();
         // Optimistic promotion; a failed write is resent by a later tick
         // once the states diverge again.
         sync.current = sync.next;
         set_all_command(&sync.next)
      };

      // Waiters re-check slot convergence after the promotion.
      self.0.written.notify_all();

      if let Err(e) = self.write_tx(&packet).await {
         warn!("{}: actuator write failed: {e}", self.0.id);
         // A write rejected before reaching the device never produces a
         // completion; reopen the gate so a later tick can retransmit.
         let mut sync = self.0.sync.lock();
         sync.last_write_written = true;
         self.0.written.notify_all();
      }
   }

   /// Write-completion callback from the transport. Exactly one of these
   /// unblocks the next tick and any caller waiting on convergence.
   pub(crate) fn on_write_complete(&self, error: Option<&str>) {
      if let Some(e) = error {
         warn!("{}: device reported write error: {e}", self.0.id);
      }
      let mut sync = self.0.sync.lock();
      sync.last_write_written = true;
      self.0.written.notify_all();
      drop(sync);
   }

   /// Blocks cooperatively until `converged` holds, then applies `work` and
   /// signals. Wakes at least every [`WAIT_REFRESH`] and on session teardown,
   /// so a stuck transport delays a caller but never deadlocks it.
   fn with_converged<P, W>(&self, converged: P, work: W) -> bool
   where
      P: Fn(&SyncState) -> bool,
      W: FnOnce(&mut SyncState),
   {
      let mut sync = self.0.sync.lock();
      while !converged(&sync) {
         if self.0.shutdown.load(Ordering::Relaxed) {
            return false;
         }
         if self
            .0
            .written
            .wait_for(&mut sync, WAIT_REFRESH)
            .timed_out()
         {
            debug!(
               "{}: still waiting for previous actuator update to flush",
               self.0.id
            );
         }
      }
      if self.0.shutdown.load(Ordering::Relaxed) {
         return false;
      }
      work(&mut sync);
      self.0.written.notify_all();
      true
   }

   fn can_accept_commands(&self) -> bool {
      self.0.kind == DeviceKind::Robot && self.is_connected()
   }

   /// Sets a single-color LED. `port` is 1-based.
   pub fn set_led(&self, port: usize, intensity: u8) -> bool {
      if !self.can_accept_commands() {
         return false;
      }
      let Some(i) = OutputState::port_index(port, LED_COUNT) else {
         return false;
      };
      self.with_converged(
         |s| s.next.leds[i] == s.current.leds[i],
         |s| s.next.leds[i] = intensity,
      )
   }

   /// Sets a tri-color LED. `port` is 1-based.
   pub fn set_tri_led(&self, port: usize, red: u8, green: u8, blue: u8) -> bool {
      if !self.can_accept_commands() {
         return false;
      }
      let Some(i) = OutputState::port_index(port, TRILED_COUNT) else {
         return false;
      };
      self.with_converged(
         |s| s.next.trileds[i] == s.current.trileds[i],
         |s| s.next.trileds[i] = TriLed { red, green, blue },
      )
   }

   /// Sets a vibration motor. `port` is 1-based.
   pub fn set_vibration(&self, port: usize, intensity: u8) -> bool {
      if !self.can_accept_commands() {
         return false;
      }
      let Some(i) = OutputState::port_index(port, VIBRATOR_COUNT) else {
         return false;
      };
      self.with_converged(
         |s| s.next.vibrators[i] == s.current.vibrators[i],
         |s| s.next.vibrators[i] = intensity,
      )
   }

   /// Sets a motor speed in the range −100..=100. `port` is 1-based.
   pub fn set_motor(&self, port: usize, speed: i8) -> bool {
      if !self.can_accept_commands() || !(-MOTOR_SPEED_MAX..=MOTOR_SPEED_MAX).contains(&speed) {
         return false;
      }
      let Some(i) = OutputState::port_index(port, MOTOR_COUNT) else {
         return false;
      };
      self.with_converged(
         |s| s.next.motors[i] == s.current.motors[i],
         |s| s.next.motors[i] = speed,
      )
   }

   /// Sets a servo angle. `port` is 1-based.
   pub fn set_servo(&self, port: usize, angle: u8) -> bool {
      if !self.can_accept_commands() {
         return false;
      }
      let Some(i) = OutputState::port_index(port, SERVO_COUNT) else {
         return false;
      };
      self.with_converged(
         |s| s.next.servos[i] == s.current.servos[i],
         |s| s.next.servos[i] = angle,
      )
   }

   /// Requests the all-off state; the next sync tick transmits it.
   pub fn stop_everything(&self) {
      let mut sync = self.0.sync.lock();
      sync.next = OutputState::default();
      self.0.written.notify_all();
   }

   // === Telemetry ===

   pub(crate) fn on_value_updated(&self, characteristic: Uuid, value: &[u8]) {
      if characteristic != RX_CHARACTERISTIC {
         return;
      }

      // A pending AT+BLEGETADDR reply takes the payload before telemetry
      // framing is considered.
      if self.0.mac_reply.lock().is_some()
         && value.len() >= MAC_REPLY_LEN
         && let Some(mac) = parse_mac_reply(value)
      {
         if let Some(tx) = self.0.mac_reply.lock().take() {
            let _ = tx.send(mac);
         }
         return;
      }

      if value.len() < TELEMETRY_FRAME_LEN || value.len() % TELEMETRY_FRAME_LEN != 0 {
         debug!(
            "{}: discarding malformed telemetry frame ({} bytes): {}",
            self.0.id,
            value.len(),
            hex::encode(value)
         );
         return;
      }

      let mut sensor = self.0.sensor.lock();
      sensor.copy_from_slice(&value[..SENSOR_SNAPSHOT_LEN]);
   }

   // === Command-mode maintenance sub-protocol ===

   pub fn in_command_mode(&self) -> bool {
      self.0.command_mode.load(Ordering::Relaxed)
   }

   pub async fn enter_command_mode(&self) -> Result<()> {
      if self.0.kind != DeviceKind::Robot {
         return Err(BridgeError::NotSupported);
      }
      if !self.in_command_mode() {
         self.send_ascii(ADALE_COMMAND_MODE_TOGGLE).await?;
         self.0.command_mode.store(true, Ordering::Relaxed);
         // The adapter firmware needs time to switch interpreters.
         time::sleep(SETTLE_DELAY).await;
      }
      Ok(())
   }

   pub async fn exit_command_mode(&self) -> Result<()> {
      if self.in_command_mode() {
         self.send_ascii(ADALE_COMMAND_MODE_TOGGLE).await?;
         time::sleep(SETTLE_DELAY).await;
         self.0.command_mode.store(false, Ordering::Relaxed);
      }
      Ok(())
   }

   /// Queries the adapter's hardware address over the command-mode channel.
   pub async fn hardware_address(&self) -> Result<SmolStr> {
      self.enter_command_mode().await?;

      let (tx, rx) = oneshot::channel();
      *self.0.mac_reply.lock() = Some(tx);
      self.send_ascii(ADALE_GET_MAC).await?;

      let reply = match time::timeout(COMMAND_REPLY_TIMEOUT, rx).await {
         Ok(Ok(mac)) => Ok(mac),
         Ok(Err(_)) => Err(BridgeError::ConnectionLost),
         Err(_) => {
            self.0.mac_reply.lock().take();
            Err(BridgeError::RequestTimeout)
         },
      };

      self.exit_command_mode().await?;
      reply
   }

   /// Best-effort rename of the advertised GAP name. The trailing reset
   /// reboots the adapter, which also drops it out of command mode.
   pub async fn rename(&self, name: &str) -> Result<()> {
      self.enter_command_mode().await?;
      self.send_ascii(&set_name_command(name)).await?;
      time::sleep(SETTLE_DELAY).await;
      self.send_ascii(ADALE_RESET).await?;
      time::sleep(SETTLE_DELAY).await;
      self.0.command_mode.store(false, Ordering::Relaxed);
      info!("{}: requested advertised name change to {name}", self.0.id);
      Ok(())
   }

   /// Reboots the BLE adapter. The device drops the link shortly after.
   pub async fn factory_reset(&self) -> Result<()> {
      self.enter_command_mode().await?;
      self.send_ascii(ADALE_RESET).await?;
      time::sleep(SETTLE_DELAY).await;
      self.0.command_mode.store(false, Ordering::Relaxed);
      Ok(())
   }

   async fn send_ascii(&self, command: &str) -> Result<()> {
      debug!("{}: sending command: {}", self.0.id, command.trim_end());
      self.write_tx(command.as_bytes()).await
   }

   async fn write_tx(&self, payload: &[u8]) -> Result<()> {
      if !self.is_connected() {
         return Err(BridgeError::DeviceNotConnected);
      }
      self
         .0
         .transport
         .write(&self.0.id, TX_CHARACTERISTIC, payload, true)
         .await
   }

   // === Teardown ===

   /// Stops the sync timer and wakes every parked caller. Runs before any
   /// transport teardown so no tick can race it.
   fn shutdown_sync(&self) {
      self.0.shutdown.store(true, Ordering::Relaxed);
      {
         let mut tasks = self.0.tasks.lock();
         if let Some(handle) = tasks.init.take() {
            handle.abort();
         }
         if let Some(handle) = tasks.sync.take() {
            handle.abort();
         }
      }
      let _sync = self.0.sync.lock();
      self.0.written.notify_all();
      self.0.connected.store(false, Ordering::Relaxed);
      self.0.lifecycle.store(Lifecycle::Disconnected);
   }

   /// Explicit disconnect requested by the host.
   pub(crate) async fn disconnect(&self) {
      self.shutdown_sync();
      if let Err(e) = self.0.transport.disconnect(&self.0.id).await {
         warn!("{}: transport disconnect failed: {e}", self.0.id);
      }
      info!("{}: disconnected", self.0.id);
   }

   /// The transport reported link loss; nothing left to release remotely.
   pub(crate) fn handle_link_loss(&self) {
      self.shutdown_sync();
      info!("{}: link lost", self.0.id);
   }
}

#[cfg(test)]
mod tests {
   use std::sync::atomic::AtomicBool;

   use tokio::sync::mpsc;

   use super::*;
   use crate::bluetooth::transport::{
      TransportEvent,
      mock::{Call, MockTransport},
   };

   fn make_session(kind: DeviceKind) -> (
      DeviceSession,
      Arc<MockTransport>,
      mpsc::Receiver<TransportEvent>,
   ) {
      let (tx, rx) = mpsc::channel(64);
      let transport = Arc::new(MockTransport::new(tx));
      let session = DeviceSession::new(
         SmolStr::new_static("AA:BB:CC:DD:EE:FF"),
         SmolStr::new_static("HB07A2F"),
         kind,
         transport.clone(),
      );
      (session, transport, rx)
   }

   fn force_ready(session: &DeviceSession) {
      session.0.lifecycle.store(Lifecycle::Ready);
   }

   #[tokio::test]
   async fn test_set_led_roundtrip_through_sync_tick() {
      let (session, transport, _rx) = make_session(DeviceKind::Robot);
      force_ready(&session);

      assert!(session.set_led(1, 255));
      session.synchronize().await;

      let payloads = transport.written_payloads();
      assert_eq!(payloads.len(), 1);
      assert_eq!(payloads[0][0], b'A');
      assert_eq!(payloads[0][7], 255, "LED 1 field");

      session.on_write_complete(None);
      let sync = session.0.sync.lock();
      assert_eq!(sync.next, sync.current);
      assert!(sync.last_write_written);
   }

   #[tokio::test]
   async fn test_no_second_packet_while_awaiting_ack() {
      let (session, transport, _rx) = make_session(DeviceKind::Robot);
      force_ready(&session);

      assert!(session.set_led(2, 40));
      session.synchronize().await;
      // No ack yet; further ticks must be skipped even with new divergence.
      assert!(session.set_led(3, 50));
      session.synchronize().await;
      session.synchronize().await;
      assert_eq!(transport.written_payloads().len(), 1);

      session.on_write_complete(None);
      session.synchronize().await;
      let payloads = transport.written_payloads();
      assert_eq!(payloads.len(), 2);
      assert_eq!(payloads[1][9], 50, "LED 3 field");
   }

   #[tokio::test]
   async fn test_rejected_write_does_not_stall_engine() {
      let (session, transport, _rx) = make_session(DeviceKind::Robot);
      force_ready(&session);

      // The transport refuses the write outright, so no completion ever
      // arrives for it.
      transport.fail_writes.store(true, Ordering::Relaxed);
      assert!(session.set_led(1, 30));
      session.synchronize().await;
      assert_eq!(transport.written_payloads().len(), 1);

      transport.fail_writes.store(false, Ordering::Relaxed);
      assert!(session.set_led(1, 60));
      session.synchronize().await;

      let payloads = transport.written_payloads();
      assert_eq!(payloads.len(), 2);
      assert_eq!(payloads[1][7], 60);
   }

   #[tokio::test]
   async fn test_cache_timeout_feeds_device_watchdog() {
      let (session, transport, _rx) = make_session(DeviceKind::Robot);
      force_ready(&session);

      // Nothing changed and the last send is fresh: no packet.
      session.synchronize().await;
      assert!(transport.written_payloads().is_empty());

      time::sleep(CACHE_TIMEOUT + Duration::from_millis(50)).await;
      session.synchronize().await;
      assert_eq!(transport.written_payloads().len(), 1);
   }

   #[tokio::test]
   async fn test_burst_on_distinct_slots_coalesces_into_one_packet() {
      let (session, transport, _rx) = make_session(DeviceKind::Robot);
      force_ready(&session);

      assert!(session.set_led(1, 10));
      assert!(session.set_led(2, 20));
      assert!(session.set_servo(1, 90));
      assert!(session.set_motor(1, -100));
      session.synchronize().await;

      let payloads = transport.written_payloads();
      assert_eq!(payloads.len(), 1);
      assert_eq!(payloads[0][7], 10);
      assert_eq!(payloads[0][8], 20);
      assert_eq!(payloads[0][11], 90);
      assert_eq!(payloads[0][15], 228);
   }

   #[tokio::test]
   async fn test_same_slot_update_waits_for_promotion_and_keeps_order() {
      let (session, transport, _rx) = make_session(DeviceKind::Robot);
      force_ready(&session);

      assert!(session.set_led(1, 10));

      let finished = Arc::new(AtomicBool::new(false));
      let worker = {
         let session = session.clone();
         let finished = finished.clone();
         std::thread::spawn(move || {
            let ok = session.set_led(1, 20);
            finished.store(true, Ordering::SeqCst);
            ok
         })
      };

      // The second update must not overtake the first one still pending.
      time::sleep(Duration::from_millis(50)).await;
      assert!(!finished.load(Ordering::SeqCst));

      session.synchronize().await;
      session.on_write_complete(None);
      assert!(worker.join().expect("worker panicked"));

      session.synchronize().await;
      let payloads = transport.written_payloads();
      assert_eq!(payloads.len(), 2);
      assert_eq!(payloads[0][7], 10);
      assert_eq!(payloads[1][7], 20);
   }

   #[tokio::test]
   async fn test_teardown_wakes_blocked_setter() {
      let (session, _transport, _rx) = make_session(DeviceKind::Robot);
      force_ready(&session);

      assert!(session.set_vibration(1, 5));
      let worker = {
         let session = session.clone();
         std::thread::spawn(move || session.set_vibration(1, 9))
      };

      time::sleep(Duration::from_millis(50)).await;
      session.handle_link_loss();
      assert!(!worker.join().expect("worker panicked"));
      assert!(!session.is_connected());
   }

   #[tokio::test]
   async fn test_malformed_telemetry_is_discarded() {
      let (session, _transport, _rx) = make_session(DeviceKind::Robot);
      force_ready(&session);

      session.on_value_updated(RX_CHARACTERISTIC, &[1, 2, 3, 4, 5]);
      assert_eq!(session.read_sensor_frame(), [1, 2, 3, 4]);

      // Length 7 is not a multiple of the frame size.
      session.on_value_updated(RX_CHARACTERISTIC, &[9, 9, 9, 9, 9, 9, 9]);
      assert_eq!(session.read_sensor_frame(), [1, 2, 3, 4]);

      // Two back-to-back frames: the leading one wins.
      session.on_value_updated(RX_CHARACTERISTIC, &[7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);
      assert_eq!(session.read_sensor_frame(), [7, 8, 9, 10]);

      // Other characteristics are ignored outright.
      session.on_value_updated(TX_CHARACTERISTIC, &[5, 5, 5, 5, 5]);
      assert_eq!(session.read_sensor_frame(), [7, 8, 9, 10]);
   }

   #[tokio::test]
   async fn test_setters_fail_fast_when_disconnected() {
      let (session, transport, _rx) = make_session(DeviceKind::Robot);
      force_ready(&session);
      session.handle_link_loss();

      assert!(!session.set_led(1, 255));
      assert!(!session.set_motor(1, 50));
      assert!(transport.written_payloads().is_empty());
   }

   #[tokio::test]
   async fn test_out_of_range_arguments_are_rejected() {
      let (session, _transport, _rx) = make_session(DeviceKind::Robot);
      force_ready(&session);

      assert!(!session.set_led(0, 1));
      assert!(!session.set_led(5, 1));
      assert!(!session.set_motor(1, 101));
      assert!(!session.set_motor(1, -101));
      assert!(!session.set_tri_led(3, 1, 2, 3));
      assert!(session.set_motor(2, -100));
   }

   #[tokio::test]
   async fn test_accessory_has_no_actuator_channel() {
      let (session, transport, _rx) = make_session(DeviceKind::Accessory);
      force_ready(&session);

      assert!(!session.set_led(1, 255));
      assert!(session.enter_command_mode().await.is_err());
      assert!(transport.written_payloads().is_empty());
   }

   #[tokio::test]
   async fn test_discovery_and_initialization_flow() {
      let (session, transport, _rx) = make_session(DeviceKind::Robot);

      session.handle_services_discovered(&[UART_SERVICE]).await;
      assert_eq!(session.lifecycle(), Lifecycle::DiscoveringCharacteristics);
      assert!(transport.calls().contains(&Call::DiscoverCharacteristics(
         session.id().clone(),
         UART_SERVICE
      )));

      session
         .handle_characteristics_discovered(UART_SERVICE, &[RX_CHARACTERISTIC, TX_CHARACTERISTIC])
         .await;
      // Stop-all, poll-stop, then poll-start with settle delays in between.
      time::sleep(Duration::from_millis(350)).await;
      assert_eq!(session.lifecycle(), Lifecycle::Ready);

      let payloads = transport.written_payloads();
      assert!(payloads.len() >= 3, "init commands sent");
      assert_eq!(payloads[0], CMD_STOP_ALL);
      assert_eq!(payloads[1], CMD_POLL_STOP);
      assert_eq!(payloads[2], CMD_POLL_START);
      assert!(transport.calls().contains(&Call::SetNotify(
         session.id().clone(),
         RX_CHARACTERISTIC,
         true
      )));

      session.disconnect().await;
   }

   #[tokio::test]
   async fn test_hardware_address_query() {
      let (session, transport, _rx) = make_session(DeviceKind::Robot);
      force_ready(&session);

      let query = {
         let session = session.clone();
         tokio::spawn(async move { session.hardware_address().await })
      };

      // Wait for the AT command to go out, then feed the reply.
      time::sleep(Duration::from_millis(200)).await;
      session.on_value_updated(RX_CHARACTERISTIC, b"D7:48:F9:6D:A1:7C");

      let mac = query.await.expect("join").expect("query");
      assert_eq!(mac, "D748F96DA17C");
      assert!(!session.in_command_mode());

      let payloads = transport.written_payloads();
      assert!(payloads.contains(&ADALE_COMMAND_MODE_TOGGLE.as_bytes().to_vec()));
      assert!(payloads.contains(&ADALE_GET_MAC.as_bytes().to_vec()));
   }

   #[tokio::test]
   async fn test_stop_everything_resets_next_state() {
      let (session, transport, _rx) = make_session(DeviceKind::Robot);
      force_ready(&session);

      assert!(session.set_led(1, 200));
      session.synchronize().await;
      session.on_write_complete(None);

      session.stop_everything();
      session.synchronize().await;

      let payloads = transport.written_payloads();
      assert_eq!(payloads.len(), 2);
      assert!(payloads[1][1..].iter().all(|&b| b == 0));
   }
}
