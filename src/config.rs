//! Configuration management for the heart-rate monitor service.
//!
//! This module handles loading and saving configuration from disk and
//! turning it into the settings the manager and sessions run with.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   bluetooth::{manager::MonitorSettings, sweeper::Sweeper},
   error::{HrmError, Result},
   sensor::{
      device::SessionSettings,
      protocol::{RSSI_CEILING_DBM, RSSI_FLOOR_DBM, SignalRange},
   },
};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   /// Adapter to use, e.g. `hci1`. The system default when unset.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub adapter: Option<SmolStr>,

   #[serde(default = "default_auto_connect")]
   pub auto_connect: bool,

   #[serde(default = "default_sweep_interval_ms")]
   pub sweep_interval_ms: u64,

   #[serde(default = "default_discovered_timeout_ms")]
   pub discovered_timeout_ms: u64,

   #[serde(default = "default_rssi_interval_ms")]
   pub rssi_interval_ms: u64,

   #[serde(default = "default_wake_timeout_sec")]
   pub wake_timeout_sec: u64,

   #[serde(default = "default_rssi_floor_dbm")]
   pub rssi_floor_dbm: i16,

   #[serde(default = "default_rssi_ceiling_dbm")]
   pub rssi_ceiling_dbm: i16,
}

const fn default_auto_connect() -> bool {
   true
}

const fn default_sweep_interval_ms() -> u64 {
   5000
}

const fn default_discovered_timeout_ms() -> u64 {
   5000
}

const fn default_rssi_interval_ms() -> u64 {
   1000
}

const fn default_wake_timeout_sec() -> u64 {
   10
}

const fn default_rssi_floor_dbm() -> i16 {
   RSSI_FLOOR_DBM
}

const fn default_rssi_ceiling_dbm() -> i16 {
   RSSI_CEILING_DBM
}

/// Timers must never be zero.
fn millis(ms: u64) -> Duration {
   Duration::from_millis(ms.max(1))
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         auto_connect: default_auto_connect(),
         sweep_interval_ms: default_sweep_interval_ms(),
         discovered_timeout_ms: default_discovered_timeout_ms(),
         rssi_interval_ms: default_rssi_interval_ms(),
         wake_timeout_sec: default_wake_timeout_sec(),
         rssi_floor_dbm: default_rssi_floor_dbm(),
         rssi_ceiling_dbm: default_rssi_ceiling_dbm(),
      }
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
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      // Ensure directory exists
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      if let Ok(home) = env::var("HRMOND_HOME") {
         return Ok(PathBuf::from(home).join("config.toml"));
      }
      let config_dir = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else {
         dirs::config_dir().ok_or(HrmError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("hrmond").join("config.toml"))
   }

   pub fn session_settings(&self) -> SessionSettings {
      SessionSettings {
         rssi_interval: millis(self.rssi_interval_ms),
         signal_range: SignalRange::new(self.rssi_floor_dbm, self.rssi_ceiling_dbm),
      }
   }

   pub fn monitor_settings(&self) -> MonitorSettings {
      MonitorSettings {
         auto_connect: self.auto_connect,
         sweeper: Sweeper::new(
            millis(self.sweep_interval_ms),
            millis(self.discovered_timeout_ms),
         ),
         wake_timeout: Duration::from_secs(self.wake_timeout_sec),
         session: self.session_settings(),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_missing_file_is_created_with_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("nested").join("config.toml");

      let config = Config::load_from(&path).unwrap();
      assert_eq!(config, Config::default());
      assert!(path.exists());
      assert_eq!(Config::load_from(&path).unwrap(), config);
   }

   #[test]
   fn test_partial_file_keeps_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(&path, "adapter = \"hci1\"\nauto_connect = false\nrssi_floor_dbm = -90\n").unwrap();

      let config = Config::load_from(&path).unwrap();
      assert_eq!(config.adapter.as_deref(), Some("hci1"));
      assert!(!config.auto_connect);
      assert_eq!(config.rssi_floor_dbm, -90);
      assert_eq!(config.rssi_ceiling_dbm, RSSI_CEILING_DBM);
      assert_eq!(config.sweep_interval_ms, 5000);
      assert_eq!(config.wake_timeout_sec, 10);
   }

   #[test]
   fn test_invalid_file_is_an_error() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(&path, "auto_connect = \"sometimes\"").unwrap();

      assert!(matches!(Config::load_from(&path), Err(HrmError::TomlParse(_))));
   }

   #[test]
   fn test_settings_conversion() {
      let config = Config {
         sweep_interval_ms: 0,
         discovered_timeout_ms: 2500,
         rssi_interval_ms: 250,
         wake_timeout_sec: 3,
         ..Config::default()
      };
      let settings = config.monitor_settings();
      assert!(settings.auto_connect);
      assert_eq!(settings.sweeper.timeout(), Duration::from_millis(2500));
      assert_eq!(settings.wake_timeout, Duration::from_secs(3));
      assert_eq!(settings.session.rssi_interval, Duration::from_millis(250));
      assert_eq!(settings.session.signal_range, SignalRange::default());
   }
}
