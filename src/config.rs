//! Configuration management for the companion service.
//!
//! This module handles loading and saving the TOML configuration file,
//! including the GATT identifiers of the device and the link timings.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use uuid::Uuid;

use crate::error::{LinkError, Result};

/// Service advertised by the Forumslader; used as the discovery filter.
pub const RX_TX_SERVICE: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);
/// Characteristic the Forumslader streams its data on.
pub const RX_TX_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000ef38_0000_1000_8000_00805f9b34fb);

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   /// Adapter to use, `None` selects the BlueZ default adapter.
   #[serde(default)]
   pub adapter: Option<SmolStr>,

   #[serde(default = "default_service_uuid")]
   pub service_uuid: Uuid,

   #[serde(default = "default_characteristic_uuid")]
   pub characteristic_uuid: Uuid,

   #[serde(default = "default_scan_window")]
   pub scan_window_ms: u64,

   #[serde(default = "default_retry_delay")]
   pub retry_delay_ms: u64,

   #[serde(default = "default_watch_delay")]
   pub watch_delay_ms: u64,

   #[serde(default = "default_liveness_threshold")]
   pub liveness_threshold_ms: u64,

   /// Re-arm the liveness watch after every healthy check instead of only
   /// after a successful discovery.
   #[serde(default)]
   pub rearm_watch: bool,
}

const fn default_service_uuid() -> Uuid {
   RX_TX_SERVICE
}

const fn default_characteristic_uuid() -> Uuid {
   RX_TX_CHARACTERISTIC
}

const fn default_scan_window() -> u64 {
   5000
}

const fn default_retry_delay() -> u64 {
   5000
}

const fn default_watch_delay() -> u64 {
   5000
}

const fn default_liveness_threshold() -> u64 {
   10_000
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         service_uuid: default_service_uuid(),
         characteristic_uuid: default_characteristic_uuid(),
         scan_window_ms: default_scan_window(),
         retry_delay_ms: default_retry_delay(),
         watch_delay_ms: default_watch_delay(),
         liveness_threshold_ms: default_liveness_threshold(),
         rearm_watch: false,
      }
   }
}

/// Timings the controller and sessions run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
   pub scan_window: Duration,
   pub retry_delay: Duration,
   pub watch_delay: Duration,
   pub liveness_threshold: Duration,
}

impl Default for Timings {
   fn default() -> Self {
      Config::default().timings()
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Loads configuration from `path`, writing the defaults there if the
   /// file does not exist yet.
   pub fn load_from(path: &Path) -> Result<Self> {
      let config = if path.exists() {
         let contents = fs::read_to_string(path)?;
         toml::from_str(&contents)?
      } else {
         let config = Self::default();
         config.save_to(path)?;
         config
      };
      config.validate()?;
      Ok(config)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      if let Ok(home) = env::var("FLCOMPANION_HOME") {
         return Ok(PathBuf::from(home).join("config.toml"));
      }

      let config_dir = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else {
         dirs::config_dir().ok_or(LinkError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("flcompaniond").join("config.toml"))
   }

   /// Rejects configurations the link cannot run with.
   pub fn validate(&self) -> Result<()> {
      if self.service_uuid.is_nil() {
         return Err(LinkError::InvalidConfig("service_uuid must not be nil"));
      }
      if self.characteristic_uuid.is_nil() {
         return Err(LinkError::InvalidConfig("characteristic_uuid must not be nil"));
      }
      let durations = [
         self.scan_window_ms,
         self.retry_delay_ms,
         self.watch_delay_ms,
         self.liveness_threshold_ms,
      ];
      if durations.contains(&0) {
         return Err(LinkError::InvalidConfig("timings must be non-zero"));
      }
      Ok(())
   }

   pub const fn timings(&self) -> Timings {
      Timings {
         scan_window: Duration::from_millis(self.scan_window_ms),
         retry_delay: Duration::from_millis(self.retry_delay_ms),
         watch_delay: Duration::from_millis(self.watch_delay_ms),
         liveness_threshold: Duration::from_millis(self.liveness_threshold_ms),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_missing_file_writes_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("nested").join("config.toml");

      let config = Config::load_from(&path).unwrap();
      assert_eq!(config, Config::default());
      assert!(path.exists());

      let reloaded = Config::load_from(&path).unwrap();
      assert_eq!(reloaded, config);
   }

   #[test]
   fn test_partial_file_uses_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(&path, "adapter = \"hci1\"\nrearm_watch = true\n").unwrap();

      let config = Config::load_from(&path).unwrap();
      assert_eq!(config.adapter.as_deref(), Some("hci1"));
      assert!(config.rearm_watch);
      assert_eq!(config.service_uuid, RX_TX_SERVICE);
      assert_eq!(config.timings().liveness_threshold, Duration::from_secs(10));
   }

   #[test]
   fn test_nil_service_rejected() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(
         &path,
         "service_uuid = \"00000000-0000-0000-0000-000000000000\"\n",
      )
      .unwrap();

      assert!(matches!(
         Config::load_from(&path),
         Err(LinkError::InvalidConfig(_))
      ));
   }

   #[test]
   fn test_zero_timing_rejected() {
      let config = Config {
         retry_delay_ms: 0,
         ..Config::default()
      };
      assert!(config.validate().is_err());
   }

   #[test]
   fn test_default_timings() {
      let timings = Timings::default();
      assert_eq!(timings.scan_window, Duration::from_millis(5000));
      assert_eq!(timings.retry_delay, Duration::from_millis(5000));
      assert_eq!(timings.watch_delay, Duration::from_millis(5000));
      assert_eq!(timings.liveness_threshold, Duration::from_millis(10_000));
   }
}
