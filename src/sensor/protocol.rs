//! Heart-rate sensor protocol definitions and data structures.
//!
//! This module contains the GATT identifiers used by standard heart-rate
//! sensors together with the small value types shared between the radio
//! layer and the session manager.

use std::{fmt, ops::RangeInclusive};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use smol_str::{SmolStr, ToSmolStr};
use uuid::Uuid;

/// Raw characteristic value as delivered by the radio.
pub type Payload = SmallVec<[u8; 32]>;

/// Expands a 16-bit SIG-assigned identifier onto the Bluetooth base UUID.
pub const fn sig_uuid(short: u16) -> Uuid {
   Uuid::from_u128(((short as u128) << 96) | 0x0000_1000_8000_0080_5f9b_34fb)
}

pub const HEART_RATE_SERVICE: Uuid = sig_uuid(0x180D);
pub const HEART_RATE_MEASUREMENT: Uuid = sig_uuid(0x2A37);
pub const BATTERY_LEVEL: Uuid = sig_uuid(0x2A19);
pub const MANUFACTURER_NAME: Uuid = sig_uuid(0x2A29);
pub const SERIAL_NUMBER: Uuid = sig_uuid(0x2A25);

/// Signal strength window mapped onto 0..=100%.
pub const RSSI_FLOOR_DBM: i16 = -100;
pub const RSSI_CEILING_DBM: i16 = -50;

/// Name reported for sensors that do not advertise one.
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

/// Adapter-assigned identity of a physical sensor.
///
/// Stable for a physical device within one process run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(SmolStr);

impl DeviceId {
   pub fn new(id: impl Into<SmolStr>) -> Self {
      Self(id.into())
   }

   pub fn as_str(&self) -> &str {
      self.0.as_str()
   }
}

impl fmt::Display for DeviceId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

impl From<&str> for DeviceId {
   fn from(id: &str) -> Self {
      Self::new(id)
   }
}

impl From<bluer::Address> for DeviceId {
   fn from(addr: bluer::Address) -> Self {
      Self(addr.to_smolstr())
   }
}

/// Power state of the local radio adapter.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum AdapterState {
   #[default]
   Unknown,
   Resetting,
   Unsupported,
   Unauthorized,
   PoweredOff,
   PoweredOn,
}

impl AdapterState {
   pub const fn is_ready(self) -> bool {
      matches!(self, Self::PoweredOn)
   }

   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Connection state of a sensor session.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
   #[default]
   Discovered,
   Connecting,
   Connected,
   Disconnected,
}

/// Linear dBm window used to express signal strength as a percentage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalRange(RangeInclusive<i16>);

impl SignalRange {
   pub fn new(floor_dbm: i16, ceiling_dbm: i16) -> Self {
      Self(floor_dbm.min(ceiling_dbm)..=ceiling_dbm.max(floor_dbm))
   }

   pub const fn floor(&self) -> i16 {
      *self.0.start()
   }

   pub const fn ceiling(&self) -> i16 {
      *self.0.end()
   }
}

impl Default for SignalRange {
   fn default() -> Self {
      Self::new(RSSI_FLOOR_DBM, RSSI_CEILING_DBM)
   }
}
