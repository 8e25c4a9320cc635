//! Multi-sensor BLE heart-rate monitor.
//!
//! Discovers heart-rate sensors, keeps their sessions alive across adapter
//! power cycles and system sleep, and streams decoded telemetry to an
//! [`EventBus`](event::EventBus).

pub mod bluetooth;
pub mod config;
pub mod dbus;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod sensor;

pub use bluetooth::manager::{MonitorManager, MonitorSettings};
pub use error::{HrmError, Result};
pub use event::{EventBus, EventSender, MonitorEvent};
