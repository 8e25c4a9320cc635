//! Error types for the heart-rate monitor service.
//!
//! This module defines all error types that can occur while scanning for,
//! connecting to and streaming from heart-rate sensors, plus the cloneable
//! [`Fault`] that is surfaced to consumers through the event stream.

use serde::Serialize;
use smol_str::{SmolStr, ToSmolStr};
use thiserror::Error;
use uuid::Uuid;

use crate::sensor::{parser::ProtoError, protocol::DeviceId};

/// Main error type for the monitor service.
#[derive(Error, Debug)]
pub enum HrmError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Invalid payload: {0}")]
   Protocol(#[from] ProtoError),

   #[error("Device not found: {0}")]
   DeviceNotFound(DeviceId),

   #[error("Already connecting to device")]
   AlreadyConnecting,

   #[error("Connect failed: {0}")]
   ConnectFailed(SmolStr),

   #[error("No Bluetooth adapter found")]
   NoAdapter,

   #[error("Permission denied. May need elevated privileges")]
   PermissionDenied,

   #[error("Timed out waiting for the adapter to become ready")]
   AdapterTimeout,

   #[error("Characteristic not found: {0}")]
   CharacteristicNotFound(Uuid),

   #[error("Signal strength unavailable")]
   SignalUnavailable,

   #[error("Connection closed")]
   ConnectionClosed,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

/// Convenience type alias for Results with `HrmError`.
pub type Result<T> = std::result::Result<T, HrmError>;

/// Category of a failure reported to consumers.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
   /// No radio hardware; scanning stays off until it reappears.
   NoAdapter,
   PermissionDenied,
   /// Unclassified scan-start failure.
   ScanFailed,
   ConnectFailed,
   AdapterTimeout,
}

/// A failure as seen by consumers of the event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fault {
   pub kind: FaultKind,
   pub device: Option<DeviceId>,
   pub message: SmolStr,
}

impl Fault {
   /// Classifies a scan-start failure.
   pub fn scan(err: &HrmError) -> Self {
      let kind = match err {
         HrmError::NoAdapter => FaultKind::NoAdapter,
         HrmError::PermissionDenied => FaultKind::PermissionDenied,
         _ => FaultKind::ScanFailed,
      };
      Self {
         kind,
         device: None,
         message: err.to_smolstr(),
      }
   }

   pub fn connect(device: DeviceId, err: &HrmError) -> Self {
      Self {
         kind: FaultKind::ConnectFailed,
         device: Some(device),
         message: err.to_smolstr(),
      }
   }

   pub fn adapter_timeout() -> Self {
      Self {
         kind: FaultKind::AdapterTimeout,
         device: None,
         message: HrmError::AdapterTimeout.to_smolstr(),
      }
   }
}
