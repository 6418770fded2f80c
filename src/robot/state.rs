//! Actuator output state for a robot peripheral.
//!
//! Two copies of [`OutputState`] exist per session: `next` holds the most
//! recently requested values and `current` holds what the synchronization
//! cycle last wrote to the hardware. Both live behind the session's sync
//! lock; this module only defines the value types.

/// Number of tri-color LED ports.
pub const TRILED_COUNT: usize = 2;
/// Number of single-color LED ports.
pub const LED_COUNT: usize = 4;
/// Number of servo ports.
pub const SERVO_COUNT: usize = 4;
/// Number of motor ports.
pub const MOTOR_COUNT: usize = 2;
/// Number of vibration motor ports.
pub const VIBRATOR_COUNT: usize = 2;

/// Motor speeds are clamped to this symmetric range by the public API.
pub const MOTOR_SPEED_MAX: i8 = 100;

/// One tri-color LED value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriLed {
   pub red: u8,
   pub green: u8,
   pub blue: u8,
}

/// Complete actuator state of one robot, indexed 0-based internally.
///
/// The default value is the all-off state the device is driven to on
/// initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputState {
   pub trileds: [TriLed; TRILED_COUNT],
   pub leds: [u8; LED_COUNT],
   pub servos: [u8; SERVO_COUNT],
   pub motors: [i8; MOTOR_COUNT],
   pub vibrators: [u8; VIBRATOR_COUNT],
}

impl OutputState {
   /// Converts a 1-based public port number into an internal index,
   /// validated against the given port count.
   pub fn port_index(port: usize, count: usize) -> Option<usize> {
      if (1..=count).contains(&port) {
         Some(port - 1)
      } else {
         None
      }
   }
}
