//! Scripted radio used by the unit tests.

use std::{
   collections::{HashMap, HashSet},
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicUsize, Ordering},
   },
   time::Duration,
};

use async_trait::async_trait;
use crossbeam::atomic::AtomicCell;
use futures::{
   StreamExt,
   channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
   stream::BoxStream,
};
use parking_lot::Mutex;
use tokio::time::{self, Instant};
use uuid::Uuid;

use crate::{
   bluetooth::radio::{Advertisement, NotificationStream, Peripheral, Radio, RadioEvent},
   error::{HrmError, Result},
   event::{EventBus, EventSender, MonitorEvent},
   sensor::{
      device::TelemetrySnapshot,
      protocol::{AdapterState, DeviceId, Payload},
   },
};

const WAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Event bus that records everything it sees.
#[derive(Default)]
pub struct RecordingBus {
   events: Mutex<Vec<MonitorEvent>>,
}

impl EventBus for RecordingBus {
   fn emit(&self, event: MonitorEvent) {
      self.events.lock().push(event);
   }
}

impl RecordingBus {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn sender(self: &Arc<Self>) -> EventSender {
      self.clone()
   }

   pub fn events(&self) -> Vec<MonitorEvent> {
      self.events.lock().clone()
   }

   pub fn count(&self, pred: impl Fn(&MonitorEvent) -> bool) -> usize {
      self.events.lock().iter().filter(|e| pred(e)).count()
   }

   pub fn data(&self) -> Vec<TelemetrySnapshot> {
      self
         .events
         .lock()
         .iter()
         .filter_map(|e| match e {
            MonitorEvent::Data(snapshot) => Some(snapshot.clone()),
            _ => None,
         })
         .collect()
   }

   /// Waits until an event matching `pred` has been recorded.
   pub async fn wait_for(&self, pred: impl Fn(&MonitorEvent) -> bool) -> MonitorEvent {
      let deadline = Instant::now() + WAIT_TIMEOUT;
      loop {
         if let Some(event) = self.events.lock().iter().find(|e| pred(e)) {
            return event.clone();
         }
         assert!(Instant::now() < deadline, "timed out waiting for event");
         time::sleep(Duration::from_millis(5)).await;
      }
   }

   pub async fn wait_for_data(&self) -> TelemetrySnapshot {
      match self.wait_for(|e| matches!(e, MonitorEvent::Data(_))).await {
         MonitorEvent::Data(snapshot) => snapshot,
         _ => unreachable!(),
      }
   }
}

/// Radio whose events are pushed by the test.
pub struct FakeRadio {
   tx: UnboundedSender<RadioEvent>,
   rx: Mutex<Option<UnboundedReceiver<RadioEvent>>>,
   state: AtomicCell<AdapterState>,
   start_calls: AtomicUsize,
   stop_calls: AtomicUsize,
   start_delay: Mutex<Duration>,
   start_failure: Mutex<Option<fn() -> HrmError>>,
   last_scan: Mutex<Option<(Vec<Uuid>, bool)>>,
   forgotten: Mutex<Vec<DeviceId>>,
}

impl FakeRadio {
   pub fn new() -> Arc<Self> {
      let (tx, rx) = mpsc::unbounded();
      Arc::new(Self {
         tx,
         rx: Mutex::new(Some(rx)),
         state: AtomicCell::new(AdapterState::PoweredOff),
         start_calls: AtomicUsize::new(0),
         stop_calls: AtomicUsize::new(0),
         start_delay: Mutex::new(Duration::ZERO),
         start_failure: Mutex::new(None),
         last_scan: Mutex::new(None),
         forgotten: Mutex::new(Vec::new()),
      })
   }

   /// Changes the power state and reports it, like the adapter would.
   pub fn set_state(&self, state: AdapterState) {
      self.state.store(state);
      let _ = self.tx.unbounded_send(RadioEvent::StateChanged(state));
   }

   /// Changes the power state without reporting it.
   pub fn set_state_silently(&self, state: AdapterState) {
      self.state.store(state);
   }

   pub fn power_on(&self) {
      self.set_state(AdapterState::PoweredOn);
   }

   pub fn power_off(&self) {
      self.set_state(AdapterState::PoweredOff);
   }

   pub fn fail_next_start(&self, err: fn() -> HrmError) {
      *self.start_failure.lock() = Some(err);
   }

   pub fn set_start_delay(&self, delay: Duration) {
      *self.start_delay.lock() = delay;
   }

   pub fn start_calls(&self) -> usize {
      self.start_calls.load(Ordering::SeqCst)
   }

   pub fn stop_calls(&self) -> usize {
      self.stop_calls.load(Ordering::SeqCst)
   }

   pub fn last_scan(&self) -> Option<(Vec<Uuid>, bool)> {
      self.last_scan.lock().clone()
   }

   /// Peripherals the manager has released, in order.
   pub fn forgotten(&self) -> Vec<DeviceId> {
      self.forgotten.lock().clone()
   }

   /// Creates a peripheral wired to this radio's event stream.
   pub fn peripheral(&self, id: &str) -> Arc<FakePeripheral> {
      FakePeripheral::build(id, Some(self.tx.clone()))
   }

   pub fn advertise(&self, peripheral: &Arc<FakePeripheral>, name: Option<&str>) {
      self.advertise_with(peripheral, name, true);
   }

   pub fn advertise_with(
      &self,
      peripheral: &Arc<FakePeripheral>,
      name: Option<&str>,
      connectable: bool,
   ) {
      let ad = Advertisement {
         id: peripheral.id.clone(),
         local_name: name.map(Into::into),
         connectable,
         rssi: Some(-60),
         peripheral: peripheral.clone(),
      };
      let _ = self.tx.unbounded_send(RadioEvent::Discovered(ad));
   }
}

#[async_trait]
impl Radio for FakeRadio {
   async fn events(&self) -> Result<BoxStream<'static, RadioEvent>> {
      let rx = self.rx.lock().take().ok_or(HrmError::ConnectionClosed)?;
      Ok(rx.boxed())
   }

   async fn state(&self) -> Result<AdapterState> {
      Ok(self.state.load())
   }

   async fn start_scan(&self, services: &[Uuid], allow_duplicates: bool) -> Result<()> {
      self.start_calls.fetch_add(1, Ordering::SeqCst);
      let delay = *self.start_delay.lock();
      if !delay.is_zero() {
         time::sleep(delay).await;
      }
      if let Some(err) = self.start_failure.lock().take() {
         return Err(err());
      }
      *self.last_scan.lock() = Some((services.to_vec(), allow_duplicates));
      let _ = self.tx.unbounded_send(RadioEvent::ScanStarted);
      Ok(())
   }

   async fn stop_scan(&self) -> Result<()> {
      self.stop_calls.fetch_add(1, Ordering::SeqCst);
      let _ = self.tx.unbounded_send(RadioEvent::ScanStopped);
      Ok(())
   }

   fn forget(&self, id: &DeviceId) {
      self.forgotten.lock().push(id.clone());
   }
}

/// Peripheral with scripted characteristics and failure modes.
pub struct FakePeripheral {
   id: DeviceId,
   events: Option<UnboundedSender<RadioEvent>>,
   connected: AtomicBool,
   fail_connect: AtomicBool,
   connect_delay: Mutex<Duration>,
   characteristics: Mutex<Vec<Uuid>>,
   reads: Mutex<HashMap<Uuid, Payload>>,
   failing_subscriptions: Mutex<HashSet<Uuid>>,
   subscribers: Mutex<HashMap<Uuid, UnboundedSender<Payload>>>,
   rssi: Mutex<std::result::Result<i16, ()>>,
   connect_calls: AtomicUsize,
   disconnect_calls: AtomicUsize,
   discover_calls: AtomicUsize,
}

impl FakePeripheral {
   /// Creates a peripheral that is not attached to any radio.
   pub fn new(id: &str) -> Arc<Self> {
      Self::build(id, None)
   }

   fn build(id: &str, events: Option<UnboundedSender<RadioEvent>>) -> Arc<Self> {
      Arc::new(Self {
         id: DeviceId::from(id),
         events,
         connected: AtomicBool::new(false),
         fail_connect: AtomicBool::new(false),
         connect_delay: Mutex::new(Duration::ZERO),
         characteristics: Mutex::new(Vec::new()),
         reads: Mutex::new(HashMap::new()),
         failing_subscriptions: Mutex::new(HashSet::new()),
         subscribers: Mutex::new(HashMap::new()),
         rssi: Mutex::new(Ok(-70)),
         connect_calls: AtomicUsize::new(0),
         disconnect_calls: AtomicUsize::new(0),
         discover_calls: AtomicUsize::new(0),
      })
   }

   pub fn with_characteristics(self: Arc<Self>, chars: &[Uuid]) -> Arc<Self> {
      self.characteristics.lock().extend_from_slice(chars);
      self
   }

   pub fn with_read(self: Arc<Self>, uuid: Uuid, data: &[u8]) -> Arc<Self> {
      self.reads.lock().insert(uuid, Payload::from_slice(data));
      self
   }

   pub fn with_failing_subscription(self: Arc<Self>, uuid: Uuid) -> Arc<Self> {
      self.failing_subscriptions.lock().insert(uuid);
      self
   }

   pub fn with_failing_connect(self: Arc<Self>) -> Arc<Self> {
      self.fail_connect.store(true, Ordering::SeqCst);
      self
   }

   pub fn with_connect_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
      *self.connect_delay.lock() = delay;
      self
   }

   pub fn set_rssi(&self, rssi: std::result::Result<i16, ()>) {
      *self.rssi.lock() = rssi;
   }

   pub fn set_failing_connect(&self, fail: bool) {
      self.fail_connect.store(fail, Ordering::SeqCst);
   }

   /// Pushes a notification to the subscriber of `uuid`, if any.
   pub fn notify(&self, uuid: Uuid, data: &[u8]) {
      if let Some(tx) = self.subscribers.lock().get(&uuid) {
         let _ = tx.unbounded_send(Payload::from_slice(data));
      }
   }

   /// Drops the link without telling anyone.
   pub fn drop_link_silently(&self) {
      self.connected.store(false, Ordering::SeqCst);
      self.subscribers.lock().clear();
   }

   /// Drops the link and reports it through the radio.
   pub fn drop_link(&self) {
      self.drop_link_silently();
      if let Some(tx) = &self.events {
         let _ = tx.unbounded_send(RadioEvent::Disconnected(self.id.clone()));
      }
   }

   pub fn connect_calls(&self) -> usize {
      self.connect_calls.load(Ordering::SeqCst)
   }

   pub fn disconnect_calls(&self) -> usize {
      self.disconnect_calls.load(Ordering::SeqCst)
   }

   pub fn discover_calls(&self) -> usize {
      self.discover_calls.load(Ordering::SeqCst)
   }
}

#[async_trait]
impl Peripheral for FakePeripheral {
   fn id(&self) -> &DeviceId {
      &self.id
   }

   async fn connect(&self) -> Result<()> {
      self.connect_calls.fetch_add(1, Ordering::SeqCst);
      let delay = *self.connect_delay.lock();
      if !delay.is_zero() {
         time::sleep(delay).await;
      }
      if self.fail_connect.load(Ordering::SeqCst) {
         return Err(HrmError::ConnectionClosed);
      }
      self.connected.store(true, Ordering::SeqCst);
      Ok(())
   }

   async fn disconnect(&self) -> Result<()> {
      self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
      if self.connected.load(Ordering::SeqCst) {
         self.drop_link();
      }
      Ok(())
   }

   async fn is_connected(&self) -> bool {
      self.connected.load(Ordering::SeqCst)
   }

   async fn discover_characteristics(&self) -> Result<Vec<Uuid>> {
      self.discover_calls.fetch_add(1, Ordering::SeqCst);
      Ok(self.characteristics.lock().clone())
   }

   async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream> {
      if self.failing_subscriptions.lock().contains(&characteristic) {
         return Err(HrmError::CharacteristicNotFound(characteristic));
      }
      let (tx, rx) = mpsc::unbounded();
      self.subscribers.lock().insert(characteristic, tx);
      Ok(rx.boxed())
   }

   async fn read(&self, characteristic: Uuid) -> Result<Payload> {
      self
         .reads
         .lock()
         .get(&characteristic)
         .cloned()
         .ok_or(HrmError::CharacteristicNotFound(characteristic))
   }

   async fn read_rssi(&self) -> Result<i16> {
      (*self.rssi.lock()).map_err(|()| HrmError::SignalUnavailable)
   }
}
