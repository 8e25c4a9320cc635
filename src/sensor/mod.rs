//! Heart-rate sensor sessions and payload decoding.
//!
//! This module contains everything specific to a single sensor: the GATT
//! identifiers it exposes, how its values are decoded, and the session type
//! that owns its link.

pub mod device;
pub mod parser;
pub mod protocol;
