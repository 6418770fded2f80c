//! Raw sensor value conversions.
//!
//! Pure functions mapping raw telemetry bytes to physical units. The
//! constants come from the robot vendor's calibration data and must not be
//! "cleaned up"; parity with the reference firmware matters more than tidy
//! numbers.

/// Converts a raw reading into degrees Celsius.
pub fn raw_to_temperature(raw: u8) -> i32 {
   ((((f64::from(raw) - 127.0) / 2.4 + 25.0) * 100.0 / 100.0).floor()) as i32
}

/// Converts a raw reading into a distance in centimeters.
///
/// The polynomial is a regression fit for the vendor's distance sensor;
/// readings saturate to 100 cm near and 5 cm far.
pub fn raw_to_distance(raw: u8) -> i32 {
   let mut reading = f64::from(raw) * 4.0;
   if reading < 130.0 {
      return 100;
   }
   reading -= 120.0;
   if reading > 680.0 {
      return 5;
   }
   let square = reading * reading;
   let distance = square * square * reading * -0.000_000_000_004_789
      + square * square * 0.000_000_010_057_143
      - square * reading * 0.000_008_279_033_021
      + square * 0.003_416_264_518_201
      - reading * 0.756_893_112_198_934
      + 90.707_167_605_683;
   distance as i32
}

/// Converts a raw reading into volts.
pub fn raw_to_voltage(raw: u8) -> f64 {
   f64::from(raw) * 0.0406
}

/// Converts a raw reading into a sound level.
pub fn raw_to_sound(raw: u8) -> i32 {
   i32::from(raw)
}

/// Converts a raw reading into a percentage.
pub fn raw_to_percent(raw: u8) -> i32 {
   (f64::from(raw) / 2.55).floor() as i32
}

/// Converts a percentage into the raw value the robot expects.
pub fn percent_to_raw(percent: u8) -> u8 {
   (f64::from(percent) * 2.55).floor().clamp(0.0, 255.0) as u8
}

/// Combines two raw magnetometer bytes into a signed reading.
pub fn raw_to_raw_mag(msb: u8, lsb: u8) -> f64 {
   f64::from(i16::from_be_bytes([msb, lsb]))
}

/// Converts two raw magnetometer bytes into microtesla.
pub fn raw_to_magnetometer(msb: u8, lsb: u8) -> i32 {
   (raw_to_raw_mag(msb, lsb) * 0.1).round() as i32
}

/// Converts a raw accelerometer byte into meters per second squared.
pub fn raw_to_accelerometer(raw: u8) -> f64 {
   f64::from(raw as i8) * 196.0 / 1280.0
}

/// Converts raw accelerometer and magnetometer readings into a compass
/// heading in degrees.
pub fn raw_to_compass(raw_acc: [u8; 3], raw_mag: [u8; 6]) -> i32 {
   let mx = raw_to_raw_mag(raw_mag[0], raw_mag[1]);
   let my = raw_to_raw_mag(raw_mag[2], raw_mag[3]);
   let mz = raw_to_raw_mag(raw_mag[4], raw_mag[5]);

   let ax = f64::from(raw_acc[0] as i8);
   let ay = f64::from(raw_acc[1] as i8);
   let az = f64::from(raw_acc[2] as i8);

   let phi = (-ay / az).atan();
   let theta = (ax / (ay * phi.sin() + az * phi.cos())).atan();

   let xp = mx;
   let yp = my * phi.cos() - mz * phi.sin();
   let zp = my * phi.sin() + mz * phi.cos();

   let xpp = xp * theta.cos() + zp * theta.sin();
   let ypp = yp;

   let angle = 180.0 + xpp.atan2(ypp).to_degrees();
   angle.round() as i32
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_temperature_table() {
      for (raw, expected) in [(0, -28), (107, 16), (127, 25), (137, 29), (255, 78)] {
         assert_eq!(raw_to_temperature(raw), expected, "raw {raw}");
      }
   }

   #[test]
   fn test_distance_table() {
      for (raw, expected) in [
         (0, 100),
         (32, 100),
         (33, 82),
         (100, 18),
         (150, 10),
         (200, 6),
         (250, 5),
         (255, 5),
      ] {
         assert_eq!(raw_to_distance(raw), expected, "raw {raw}");
      }
   }

   #[test]
   fn test_voltage() {
      assert!((raw_to_voltage(100) - 4.06).abs() < 1e-9);
      assert!((raw_to_voltage(255) - 10.353).abs() < 1e-9);
      assert_eq!(raw_to_voltage(0), 0.0);
   }

   #[test]
   fn test_percent_conversions() {
      assert_eq!(raw_to_percent(255), 100);
      assert_eq!(raw_to_percent(128), 50);
      assert_eq!(raw_to_percent(0), 0);
      // 100 * 2.55 rounds just below 255 in binary floating point; the
      // floor keeps it at 254, matching the reference conversion.
      assert_eq!(percent_to_raw(100), 254);
      assert_eq!(percent_to_raw(50), 127);
      assert_eq!(percent_to_raw(0), 0);
   }

   #[test]
   fn test_magnetometer() {
      assert_eq!(raw_to_magnetometer(0x00, 0x64), 10);
      assert_eq!(raw_to_magnetometer(0xFF, 0x9C), -10);
      assert_eq!(raw_to_magnetometer(0, 0), 0);
   }

   #[test]
   fn test_accelerometer() {
      assert!((raw_to_accelerometer(64) - 9.8).abs() < 1e-9);
      assert!((raw_to_accelerometer(0x80) + 19.6).abs() < 1e-9);
      assert_eq!(raw_to_accelerometer(0), 0.0);
   }

   #[test]
   fn test_compass_headings() {
      // Vectors captured from the reference conversion.
      assert_eq!(raw_to_compass([0, 10, 206], [0, 100, 0, 50, 255, 206]), 240);
      assert_eq!(raw_to_compass([5, 246, 216], [255, 156, 0, 200, 0, 30]), 154);
   }

   #[test]
   fn test_sound_is_identity() {
      assert_eq!(raw_to_sound(0), 0);
      assert_eq!(raw_to_sound(201), 201);
   }
}
