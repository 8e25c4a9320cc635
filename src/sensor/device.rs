//! Heart-rate sensor session and telemetry state.
//!
//! This module provides the [`HeartRateSensor`] type which represents one
//! physical sensor, owns its link, characteristic subscriptions and signal
//! strength sampler, and decodes the values it streams.

use core::fmt;
use std::{
   sync::{
      Arc, Weak,
      atomic::{AtomicBool, AtomicU8, AtomicU16, Ordering},
   },
   time::{Duration, SystemTime, UNIX_EPOCH},
};

use crossbeam::atomic::AtomicCell;
use futures::StreamExt;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::json;
use smol_str::SmolStr;
use tokio::{
   sync::Mutex,
   task::JoinSet,
   time::{self, MissedTickBehavior},
};
use uuid::Uuid;

use crate::{
   bluetooth::radio::{NotificationStream, PeripheralRef},
   error::Result,
   event::{EventSender, MonitorEvent},
   sensor::{
      parser,
      protocol::{
         BATTERY_LEVEL, DeviceId, HEART_RATE_MEASUREMENT, LinkState, MANUFACTURER_NAME,
         SERIAL_NUMBER, SignalRange, UNKNOWN_DEVICE_NAME,
      },
   },
};

/// Default period of the signal strength sampler.
pub const DEFAULT_RSSI_INTERVAL: Duration = Duration::from_secs(1);

/// Per-session tunables.
#[derive(Debug, Clone)]
pub struct SessionSettings {
   pub rssi_interval: Duration,
   pub signal_range: SignalRange,
}

impl Default for SessionSettings {
   fn default() -> Self {
      Self {
         rssi_interval: DEFAULT_RSSI_INTERVAL,
         signal_range: SignalRange::default(),
      }
   }
}

/// Options for [`HeartRateSensor::connect`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
   /// Resume without re-running discovery if the link survived a sleep.
   pub force_awake: bool,
}

/// Point-in-time copy of a sensor's telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
   pub device_id: DeviceId,
   pub device_name: SmolStr,
   pub heart_rate: u16,
   pub battery: Option<u8>,
   pub rssi: u8,
   pub manufacturer_name: Option<SmolStr>,
   pub serial_number: Option<SmolStr>,
   /// Milliseconds since the UNIX epoch.
   pub timestamp: u64,
}

impl TelemetrySnapshot {
   pub fn to_json(&self) -> serde_json::Value {
      serde_json::to_value(self).unwrap_or_default()
   }
}

#[derive(Debug, Clone, Copy)]
enum Feed {
   HeartRate,
   Battery,
}

impl Feed {
   const fn characteristic(self) -> Uuid {
      match self {
         Self::HeartRate => HEART_RATE_MEASUREMENT,
         Self::Battery => BATTERY_LEVEL,
      }
   }
}

/// Background tasks bound to an open link.
#[derive(Debug)]
struct ConnectionState {
   jset: JoinSet<()>,
}

impl Drop for ConnectionState {
   fn drop(&mut self) {
      self.jset.abort_all();
   }
}

/// Internal shared state for a sensor session.
struct SensorInner {
   id: DeviceId,
   peripheral: PeripheralRef,
   settings: SessionSettings,
   name: parking_lot::Mutex<SmolStr>,
   state: AtomicCell<LinkState>,
   linked: AtomicBool,
   heart_rate: AtomicU16,
   battery: AtomicCell<Option<u8>>,
   signal: AtomicU8,
   manufacturer_name: parking_lot::Mutex<Option<SmolStr>>,
   serial_number: parking_lot::Mutex<Option<SmolStr>>,
   characteristics: parking_lot::Mutex<Option<Vec<Uuid>>>,
   conn: Mutex<Option<ConnectionState>>,
}

impl fmt::Debug for SensorInner {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("HeartRateSensor")
         .field("id", &self.id)
         .field("name", &*self.name.lock())
         .field("state", &self.state.load())
         .field("heart_rate", &self.heart_rate.load(Ordering::Relaxed))
         .field("battery", &self.battery.load())
         .finish_non_exhaustive()
   }
}

/// Represents one physical heart-rate sensor.
///
/// This type is cheaply cloneable and thread-safe.
#[derive(Clone)]
pub struct HeartRateSensor(Arc<SensorInner>);

/// Weak reference to a sensor session.
#[derive(Debug, Clone)]
pub struct WeakSensor(Weak<SensorInner>);

impl WeakSensor {
   pub fn new(sensor: &HeartRateSensor) -> Self {
      Self(Arc::downgrade(&sensor.0))
   }

   pub fn upgrade(&self) -> Option<HeartRateSensor> {
      self.0.upgrade().map(HeartRateSensor)
   }
}

impl fmt::Debug for HeartRateSensor {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      fmt::Debug::fmt(&self.0, f)
   }
}

impl HeartRateSensor {
   /// Creates a session for a freshly advertised peripheral.
   pub fn new(
      peripheral: PeripheralRef,
      local_name: Option<SmolStr>,
      settings: SessionSettings,
   ) -> Self {
      let name = local_name
         .filter(|n| !n.is_empty())
         .unwrap_or_else(|| SmolStr::new_static(UNKNOWN_DEVICE_NAME));
      Self(Arc::new(SensorInner {
         id: peripheral.id().clone(),
         peripheral,
         settings,
         name: parking_lot::Mutex::new(name),
         state: AtomicCell::new(LinkState::Discovered),
         linked: AtomicBool::new(false),
         heart_rate: AtomicU16::new(0),
         battery: AtomicCell::new(None),
         signal: AtomicU8::new(0),
         manufacturer_name: parking_lot::Mutex::new(None),
         serial_number: parking_lot::Mutex::new(None),
         characteristics: parking_lot::Mutex::new(None),
         conn: Mutex::new(None),
      }))
   }

   pub fn id(&self) -> &DeviceId {
      &self.0.id
   }

   /// Whether both handles refer to the same session.
   pub fn same_session(&self, other: &Self) -> bool {
      Arc::ptr_eq(&self.0, &other.0)
   }

   pub fn name(&self) -> SmolStr {
      self.0.name.lock().clone()
   }

   /// Adopts an advertised name; returns true if it changed.
   pub fn update_name(&self, name: &str) -> bool {
      let mut lock = self.0.name.lock();
      if name.is_empty() || lock.as_str() == name {
         return false;
      }
      *lock = name.into();
      true
   }

   pub fn peripheral(&self) -> &PeripheralRef {
      &self.0.peripheral
   }

   pub fn state(&self) -> LinkState {
      self.0.state.load()
   }

   pub(crate) fn set_state(&self, state: LinkState) {
      self.0.state.store(state);
   }

   /// Whether this session currently holds an open link.
   pub fn is_linked(&self) -> bool {
      self.0.linked.load(Ordering::Relaxed)
   }

   pub fn heart_rate(&self) -> u16 {
      self.0.heart_rate.load(Ordering::Relaxed)
   }

   pub fn battery(&self) -> Option<u8> {
      self.0.battery.load()
   }

   /// Signal strength as a percentage of the configured dBm window.
   pub fn signal_percent(&self) -> u8 {
      self.0.signal.load(Ordering::Relaxed)
   }

   pub fn manufacturer_name(&self) -> Option<SmolStr> {
      self.0.manufacturer_name.lock().clone()
   }

   pub fn serial_number(&self) -> Option<SmolStr> {
      self.0.serial_number.lock().clone()
   }

   /// Captures the current telemetry, stamped with the wall clock.
   pub fn snapshot(&self) -> TelemetrySnapshot {
      let timestamp = SystemTime::now()
         .duration_since(UNIX_EPOCH)
         .map_or(0, |d| d.as_millis().try_into().unwrap_or(u64::MAX));
      TelemetrySnapshot {
         device_id: self.id().clone(),
         device_name: self.name(),
         heart_rate: self.heart_rate(),
         battery: self.battery(),
         rssi: self.signal_percent(),
         manufacturer_name: self.manufacturer_name(),
         serial_number: self.serial_number(),
         timestamp,
      }
   }

   /// Converts the session state to a JSON representation.
   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "id": self.id().as_str(),
          "name": self.name().as_str(),
          "state": self.state(),
          "heart_rate": self.heart_rate(),
          "battery": self.battery(),
          "rssi": self.signal_percent(),
          "manufacturer_name": self.manufacturer_name(),
          "serial_number": self.serial_number(),
      })
   }

   /// Opens the link and starts streaming.
   ///
   /// Only the link itself and characteristic discovery are fatal; every
   /// read or subscription failure just leaves that value unavailable.
   pub async fn connect(&self, event_tx: &EventSender, options: ConnectOptions) -> Result<()> {
      let id = self.id().clone();
      let mut conn = self.0.conn.lock().await;
      let _ = conn.take();

      let cached = self.0.characteristics.lock().clone();
      let resumable = if options.force_awake
         && cached.is_some()
         && self.0.peripheral.is_connected().await
      {
         cached
      } else {
         None
      };
      let resumed = resumable.is_some();

      let mut jset = JoinSet::new();
      let characteristics = if let Some(chars) = resumable {
         info!("{id}: link survived, resuming session");
         self.start_signal_sampler(&mut jset);
         chars
      } else {
         info!("Connecting to sensor {id}");
         self.0.peripheral.connect().await?;
         self.start_signal_sampler(&mut jset);
         match self.0.peripheral.discover_characteristics().await {
            Ok(chars) => {
               debug!("{id}: discovered {} characteristics", chars.len());
               *self.0.characteristics.lock() = Some(chars.clone());
               chars
            },
            Err(e) => {
               warn!("{id}: characteristic discovery failed: {e}");
               if let Err(e) = self.0.peripheral.disconnect().await {
                  debug!("{id}: disconnect after failed discovery: {e}");
               }
               return Err(e);
            },
         }
      };

      for feed in [Feed::HeartRate, Feed::Battery] {
         self
            .subscribe(&mut jset, &characteristics, feed, event_tx)
            .await;
      }
      if !resumed {
         self.read_device_info(&characteristics).await;
      }

      *conn = Some(ConnectionState { jset });
      self.0.linked.store(true, Ordering::Relaxed);
      info!("Successfully connected to {id}");
      Ok(())
   }

   /// Tears down the link. No-op unless currently linked.
   pub async fn disconnect(&self) -> Result<()> {
      if !self.is_linked() {
         return Ok(());
      }
      info!("Disconnecting sensor {}", self.id());
      let result = self.0.peripheral.disconnect().await;
      self.link_lost().await;
      result
   }

   /// Stops the sampler and notification pumps after the link dropped.
   pub async fn link_lost(&self) {
      self.0.linked.store(false, Ordering::Relaxed);
      let _ = self.0.conn.lock().await.take();
      debug!("{}: session tasks stopped", self.id());
   }

   /// Samples signal strength once; failures read as 0%.
   pub async fn sample_signal(&self) {
      match self.0.peripheral.read_rssi().await {
         Ok(dbm) => {
            let pct = parser::signal_percent(dbm, &self.0.settings.signal_range);
            self.0.signal.store(pct, Ordering::Relaxed);
         },
         Err(e) => {
            warn!("{} ({}): error reading RSSI: {e}", self.name(), self.id());
            self.0.signal.store(0, Ordering::Relaxed);
         },
      }
   }

   /// Applies a heart-rate measurement and publishes a snapshot.
   pub fn handle_heart_rate(&self, data: &[u8], event_tx: &EventSender) {
      match parser::parse_heart_rate(data) {
         Ok(bpm) => {
            debug!("{}: heart rate {bpm} bpm", self.id());
            self.0.heart_rate.store(bpm, Ordering::Relaxed);
            event_tx.emit(MonitorEvent::Data(self.snapshot()));
         },
         Err(e) => warn!(
            "{}: bad heart-rate payload {}: {e}",
            self.id(),
            hex::encode(data)
         ),
      }
   }

   /// Applies a battery level; out-of-range values are dropped.
   pub fn handle_battery(&self, data: &[u8], event_tx: &EventSender) {
      if self.apply_battery(data) {
         event_tx.emit(MonitorEvent::Data(self.snapshot()));
      }
   }

   fn apply_battery(&self, data: &[u8]) -> bool {
      match parser::parse_battery_level(data) {
         Ok(level) => {
            debug!("{}: battery {level}%", self.id());
            self.0.battery.store(Some(level));
            true
         },
         Err(e) => {
            warn!("{}: invalid battery value received: {e}", self.id());
            false
         },
      }
   }

   fn start_signal_sampler(&self, jset: &mut JoinSet<()>) {
      let weak = WeakSensor::new(self);
      let period = self.0.settings.rssi_interval;
      jset.spawn(async move {
         let mut interval = time::interval(period);
         interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
         loop {
            interval.tick().await;
            let Some(this) = weak.upgrade() else {
               break;
            };
            this.sample_signal().await;
         }
      });
   }

   async fn subscribe(
      &self,
      jset: &mut JoinSet<()>,
      characteristics: &[Uuid],
      feed: Feed,
      event_tx: &EventSender,
   ) {
      let uuid = feed.characteristic();
      if !characteristics.contains(&uuid) {
         debug!("{}: no {feed:?} characteristic", self.id());
         return;
      }
      match self.0.peripheral.subscribe(uuid).await {
         Ok(stream) => {
            debug!("{}: subscribed to {feed:?} notifications", self.id());
            jset.spawn(Self::pump(WeakSensor::new(self), stream, feed, event_tx.clone()));
         },
         Err(e) => warn!("{}: failed to subscribe to {feed:?}: {e}", self.id()),
      }
   }

   async fn pump(
      weak: WeakSensor,
      mut stream: NotificationStream,
      feed: Feed,
      event_tx: EventSender,
   ) {
      while let Some(payload) = stream.next().await {
         let Some(this) = weak.upgrade() else {
            break;
         };
         match feed {
            Feed::HeartRate => this.handle_heart_rate(&payload, &event_tx),
            Feed::Battery => this.handle_battery(&payload, &event_tx),
         }
      }
      debug!("{feed:?} notifications ended");
   }

   async fn read_device_info(&self, characteristics: &[Uuid]) {
      let fields = [
         (MANUFACTURER_NAME, &self.0.manufacturer_name, "manufacturer name"),
         (SERIAL_NUMBER, &self.0.serial_number, "serial number"),
      ];
      for (uuid, slot, what) in fields {
         if !characteristics.contains(&uuid) {
            continue;
         }
         match self.0.peripheral.read(uuid).await {
            Ok(data) => *slot.lock() = Some(parser::parse_text(&data)),
            Err(e) => warn!("{}: error reading {what}: {e}", self.id()),
         }
      }

      if characteristics.contains(&BATTERY_LEVEL) {
         match self.0.peripheral.read(BATTERY_LEVEL).await {
            Ok(data) => {
               self.apply_battery(&data);
            },
            Err(e) => warn!("{}: error reading battery level: {e}", self.id()),
         }
      }
   }
}
