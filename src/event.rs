//! Event handling system for heart-rate sensor updates.
//!
//! This module provides the event infrastructure for notifying consumers
//! about adapter power changes, scanning, sensor lifecycle transitions and
//! streamed telemetry.

use std::sync::Arc;

use crate::{
   error::Fault,
   sensor::{
      device::{HeartRateSensor, TelemetrySnapshot},
      protocol::AdapterState,
   },
};

/// Events that can be emitted by the monitor.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
   AdapterStateChanged(AdapterState),
   AdapterReady,
   ScanStarted,
   ScanStopped,
   DeviceDiscovered(HeartRateSensor),
   DeviceConnected(HeartRateSensor),
   DeviceDisconnected(HeartRateSensor),
   DiscoveredDeviceLost(HeartRateSensor),
   Data(TelemetrySnapshot),
   Error(Fault),
}

impl MonitorEvent {
   /// Short name of the event category, used for logging.
   pub const fn name(&self) -> &'static str {
      match self {
         Self::AdapterStateChanged(_) => "adapterStateChange",
         Self::AdapterReady => "adapterReady",
         Self::ScanStarted => "scanStart",
         Self::ScanStopped => "scanStop",
         Self::DeviceDiscovered(_) => "deviceDiscovered",
         Self::DeviceConnected(_) => "deviceConnected",
         Self::DeviceDisconnected(_) => "deviceDisconnected",
         Self::DiscoveredDeviceLost(_) => "discoveredDeviceLost",
         Self::Data(_) => "data",
         Self::Error(_) => "error",
      }
   }
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: MonitorEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
