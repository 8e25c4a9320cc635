//! Bluetooth layer for heart-rate sensors.
//!
//! This module provides the radio collaborator seam with its BlueZ backend,
//! and the session manager with the gate, scan controller, registry and
//! sweeper it drives.

pub mod bluez;
#[cfg(test)]
pub mod fake;
pub mod gate;
pub mod manager;
pub mod radio;
pub mod registry;
pub mod scan;
pub mod sweeper;
