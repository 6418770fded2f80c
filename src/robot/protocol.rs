//! Wire protocol definitions for robot peripherals.
//!
//! This module contains the GATT identifiers, one-shot ASCII commands, the
//! steady-state set-all packet layout, and the AT-style command-mode strings
//! understood by the device's BLE adapter firmware.

use smol_str::SmolStr;
use uuid::Uuid;

use crate::robot::state::{MOTOR_COUNT, OutputState};

/// UART-style primary service advertised by the robots.
pub const UART_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
/// Host -> device write characteristic.
pub const TX_CHARACTERISTIC: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
/// Device -> host notify characteristic.
pub const RX_CHARACTERISTIC: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Stop every actuator immediately.
pub const CMD_STOP_ALL: &[u8] = b"X";
/// Start periodic sensor telemetry notifications.
pub const CMD_POLL_START: &[u8] = b"G5";
/// Stop periodic sensor telemetry notifications.
pub const CMD_POLL_STOP: &[u8] = b"G6";

/// Toggle the BLE adapter's AT command mode.
pub const ADALE_COMMAND_MODE_TOGGLE: &str = "+++\n";
/// Query the adapter's hardware address.
pub const ADALE_GET_MAC: &str = "AT+BLEGETADDR\n";
/// Prefix for setting the advertised GAP name.
pub const ADALE_SET_NAME: &str = "AT+GAPDEVNAME=";
/// Reset the adapter, leaving command mode.
pub const ADALE_RESET: &str = "ATZ\n";

/// Advertised name of an adapter that was never renamed at the factory.
pub const FACTORY_DEFAULT_NAME: &str = "Adafruit Bluefruit LE";

/// Length of one inbound telemetry frame.
pub const TELEMETRY_FRAME_LEN: usize = 5;
/// How many leading telemetry bytes are retained per frame.
pub const SENSOR_SNAPSHOT_LEN: usize = 4;

/// Length of the colon-separated hardware address reply, e.g.
/// `D7:48:F9:6D:A1:7C`.
pub const MAC_REPLY_LEN: usize = 17;
/// Length of the address with the colons stripped.
pub const MAC_LEN: usize = 12;

/// Length of the steady-state set-all command packet.
pub const SET_ALL_LEN: usize = 19;

/// Encodes the full actuator state into one set-all packet.
///
/// Layout: `'A'`, tri-LED triples, LEDs, servos, motors, vibrators, in port
/// order. Negative motor speeds are encoded as `abs(speed) + 128`.
pub fn set_all_command(state: &OutputState) -> [u8; SET_ALL_LEN] {
   let mut motors = [0u8; MOTOR_COUNT];
   for (encoded, speed) in motors.iter_mut().zip(state.motors) {
      *encoded = encode_motor(speed);
   }

   [
      b'A',
      state.trileds[0].red,
      state.trileds[0].green,
      state.trileds[0].blue,
      state.trileds[1].red,
      state.trileds[1].green,
      state.trileds[1].blue,
      state.leds[0],
      state.leds[1],
      state.leds[2],
      state.leds[3],
      state.servos[0],
      state.servos[1],
      state.servos[2],
      state.servos[3],
      motors[0],
      motors[1],
      state.vibrators[0],
      state.vibrators[1],
   ]
}

fn encode_motor(speed: i8) -> u8 {
   if speed < 0 {
      speed.unsigned_abs() + 128
   } else {
      speed as u8
   }
}

/// Builds the command-mode string that sets the advertised GAP name.
pub fn set_name_command(name: &str) -> String {
   format!("{ADALE_SET_NAME}{name}\n")
}

/// True if the advertised name is the adapter factory default and the rename
/// maintenance flow would apply.
pub fn name_needs_reset(advertised_name: &str) -> bool {
   advertised_name == FACTORY_DEFAULT_NAME
}

/// Parses an `AT+BLEGETADDR` reply into the 12-character address string.
///
/// The adapter replies with the address in colon-separated form, possibly
/// followed by a status line. Returns `None` on anything that does not strip
/// down to 12 hex digits.
pub fn parse_mac_reply(raw: &[u8]) -> Option<SmolStr> {
   let reply = raw.get(..MAC_REPLY_LEN)?;
   let stripped: Vec<u8> = reply.iter().copied().filter(|&b| b != b':').collect();
   if stripped.len() != MAC_LEN || !stripped.iter().all(u8::is_ascii_hexdigit) {
      return None;
   }
   Some(SmolStr::new(str::from_utf8(&stripped).ok()?))
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::robot::state::TriLed;

   #[test]
   fn test_set_all_reference_frame() {
      let mut state = OutputState::default();
      state.trileds[0] = TriLed {
         red: 10,
         green: 20,
         blue: 30,
      };
      state.trileds[1] = TriLed {
         red: 1,
         green: 2,
         blue: 3,
      };
      state.leds = [255, 0, 128, 64];
      state.servos = [90, 0, 180, 45];
      state.motors = [100, -100];
      state.vibrators = [5, 6];

      // Captured layout: letter, 2 triples, 4 LEDs, 4 servos, 2 motors,
      // 2 vibrators.
      assert_eq!(
         set_all_command(&state),
         [
            0x41, 10, 20, 30, 1, 2, 3, 255, 0, 128, 64, 90, 0, 180, 45, 100, 228, 5, 6
         ]
      );
   }

   #[test]
   fn test_all_off_frame() {
      let packet = set_all_command(&OutputState::default());
      assert_eq!(packet[0], b'A');
      assert!(packet[1..].iter().all(|&b| b == 0));
   }

   #[test]
   fn test_motor_encoding() {
      assert_eq!(encode_motor(0), 0);
      assert_eq!(encode_motor(100), 100);
      assert_eq!(encode_motor(-1), 129);
      assert_eq!(encode_motor(-100), 228);
   }

   #[test]
   fn test_parse_mac_reply() {
      assert_eq!(
         parse_mac_reply(b"D7:48:F9:6D:A1:7C").as_deref(),
         Some("D748F96DA17C")
      );
      // Trailing status data after the address is ignored.
      assert_eq!(
         parse_mac_reply(b"D7:48:F9:6D:A1:7C\r\nOK\r\n").as_deref(),
         Some("D748F96DA17C")
      );
      assert_eq!(parse_mac_reply(b"D7:48:F9"), None);
      assert_eq!(parse_mac_reply(b"not an address!!!"), None);
   }

   #[test]
   fn test_name_needs_reset() {
      assert!(name_needs_reset("Adafruit Bluefruit LE"));
      assert!(!name_needs_reset("HB07A2F"));
   }
}
