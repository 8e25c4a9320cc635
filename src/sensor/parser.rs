//! Payload decoding for heart-rate sensors.
//!
//! This module contains functions to decode the characteristic values
//! delivered by standard heart-rate sensors, plus the signal strength
//! normalisation used for the telemetry snapshot.

use smol_str::SmolStr;
use thiserror::Error;

use crate::{error::Result, sensor::protocol::SignalRange};

/// Heart-rate measurement flag selecting a 16-bit value.
const HR_FORMAT_U16: u8 = 0x01;

/// Error type for payload decoding.
#[derive(Error, Debug)]
pub enum ProtoError {
   /// Payload is too short for the expected format
   #[error("Payload too short: expected at least {expected} bytes, got {actual}")]
   PayloadTooShort { expected: usize, actual: usize },

   /// Battery level outside of 0..=100
   #[error("Battery level out of range: {level}")]
   BatteryOutOfRange { level: u8 },
}

/// Decodes a Heart Rate Measurement value into beats per minute.
///
/// Bit 0 of the flags byte selects between an 8-bit value and a 16-bit
/// little-endian value, both starting at offset 1.
pub fn parse_heart_rate(data: &[u8]) -> Result<u16> {
   let Some(&flags) = data.first() else {
      return Err(
         ProtoError::PayloadTooShort {
            expected: 2,
            actual: 0,
         }
         .into(),
      );
   };

   if flags & HR_FORMAT_U16 == 0 {
      match data.get(1) {
         Some(&bpm) => Ok(u16::from(bpm)),
         None => Err(
            ProtoError::PayloadTooShort {
               expected: 2,
               actual: data.len(),
            }
            .into(),
         ),
      }
   } else {
      match data.get(1..3) {
         Some(&[lo, hi]) => Ok(u16::from_le_bytes([lo, hi])),
         _ => Err(
            ProtoError::PayloadTooShort {
               expected: 3,
               actual: data.len(),
            }
            .into(),
         ),
      }
   }
}

/// Decodes a Battery Level value, rejecting anything above 100%.
pub fn parse_battery_level(data: &[u8]) -> Result<u8> {
   let Some(&level) = data.first() else {
      return Err(
         ProtoError::PayloadTooShort {
            expected: 1,
            actual: 0,
         }
         .into(),
      );
   };
   if level > 100 {
      return Err(ProtoError::BatteryOutOfRange { level }.into());
   }
   Ok(level)
}

/// Decodes a UTF-8 string characteristic, dropping trailing NUL padding.
pub fn parse_text(data: &[u8]) -> SmolStr {
   let end = data
      .iter()
      .rposition(|&b| b != 0)
      .map_or(0, |idx| idx + 1);
   SmolStr::new(String::from_utf8_lossy(&data[..end]))
}

/// Maps a raw RSSI reading onto 0..=100% across `range`.
pub fn signal_percent(rssi_dbm: i16, range: &SignalRange) -> u8 {
   let floor = f32::from(range.floor());
   let span = f32::from(range.ceiling()) - floor;
   if span <= 0.0 {
      return if rssi_dbm >= range.ceiling() { 100 } else { 0 };
   }
   let pct = (f32::from(rssi_dbm) - floor) / span * 100.0;
   pct.clamp(0.0, 100.0).round() as u8
}
