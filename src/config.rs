//! Configuration management for the bridge core.
//!
//! This module handles loading and saving configuration from disk,
//! including known devices and scan/connection timing parameters.

use std::{env, fs, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Main configuration structure for the bridge.
#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,

   #[serde(default = "default_discovery_scan_secs")]
   pub discovery_scan_secs: u64,

   #[serde(default = "default_counting_scan_secs")]
   pub counting_scan_secs: u64,

   #[serde(default = "default_connect_timeout_secs")]
   pub connect_timeout_secs: u64,
}

/// A device with a user-assigned display name.
#[derive(Serialize, Deserialize, Clone)]
pub struct KnownDevice {
   pub address: String,
   pub name: String,
}

const fn default_discovery_scan_secs() -> u64 {
   30
}

const fn default_counting_scan_secs() -> u64 {
   120
}

const fn default_connect_timeout_secs() -> u64 {
   30
}

impl Default for Config {
   fn default() -> Self {
      Self {
         known_devices: vec![],
         discovery_scan_secs: default_discovery_scan_secs(),
         counting_scan_secs: default_counting_scan_secs(),
         connect_timeout_secs: default_connect_timeout_secs(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         Self::load_from(&config_path)
      } else {
         // Create default config
         let config = Self::default();
         config.save_to(&config_path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   fn load_from(path: &Path) -> Result<Self> {
      let contents = fs::read_to_string(path)?;
      Ok(toml::from_str(&contents)?)
   }

   fn save_to(&self, path: &Path) -> Result<()> {
      // Ensure directory exists
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(bridge_home) = env::var("BIRDBRIDGE_HOME") {
         PathBuf::from(bridge_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(BridgeError::ConfigDirNotFound);
      };

      Ok(config_dir.join("birdbridge").join("config.toml"))
   }

   /// Checks if the given address is a known device and returns its name.
   pub fn is_known_device(&self, address: &str) -> Option<&str> {
      self
         .known_devices
         .iter()
         .find(|d| d.address == address)
         .map(|d| d.name.as_str())
   }
}
