//! Multi-sensor session manager.
//!
//! This module owns the adapter readiness gate, the scan controller and the
//! device registry. Every mutation of that state happens inside a single
//! actor task; callers and the radio only enqueue commands.

use std::{mem, sync::Arc, time::Duration};

use futures::{future::join_all, stream::BoxStream, StreamExt};
use log::{debug, error, info, warn};
use smol_str::ToSmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   time::{self, Instant},
};

use crate::{
   bluetooth::{
      gate::ReadinessGate,
      radio::{Advertisement, Radio, RadioEvent},
      registry::{Detach, Evicted, Observation, Registry, Reply},
      scan::ScanController,
      sweeper::Sweeper,
   },
   error::{Fault, HrmError, Result},
   event::{EventSender, MonitorEvent},
   sensor::{
      device::{ConnectOptions, HeartRateSensor, SessionSettings},
      protocol::{AdapterState, DeviceId, HEART_RATE_SERVICE, LinkState},
   },
};

/// Default bound on waiting for the adapter after a wake
pub const DEFAULT_WAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

/// Tunables for the manager and the sessions it creates.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
   /// Connect every sensor as soon as it is discovered.
   pub auto_connect: bool,
   pub sweeper: Sweeper,
   pub wake_timeout: Duration,
   pub session: SessionSettings,
}

impl Default for MonitorSettings {
   fn default() -> Self {
      Self {
         auto_connect: true,
         sweeper: Sweeper::default(),
         wake_timeout: DEFAULT_WAKE_TIMEOUT,
         session: SessionSettings::default(),
      }
   }
}

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   // Radio events
   Radio(RadioEvent),

   // Completions of work spawned by the actor
   ScanStartFinished(Result<()>),
   ConnectFinished(HeartRateSensor, Result<()>),
   LinkProbed(DeviceId, bool), // id, alive
   WakeFinished(bool),         // adapter became ready in time

   // User commands
   StartScanning(oneshot::Sender<()>),
   StopScanning(oneshot::Sender<Result<()>>),
   Connect(DeviceId, Option<Reply>),
   Disconnect(DeviceId, Option<Reply>),
   GetDevice(DeviceId, oneshot::Sender<Option<HeartRateSensor>>),
   GetAllDevices(oneshot::Sender<Vec<HeartRateSensor>>),
   GetConnectedDevices(oneshot::Sender<Vec<HeartRateSensor>>),
   CountDevices(oneshot::Sender<usize>),
   Suspend(oneshot::Sender<()>),
   Wake(Reply),
   Shutdown(oneshot::Sender<()>),
}

// === Main Manager ===

/// Handle to the session manager.
///
/// This type is cheaply cloneable; every clone talks to the same actor.
#[derive(Debug, Clone)]
pub struct MonitorManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl MonitorManager {
   /// Spawns the manager actor on top of `radio`.
   pub async fn new(
      radio: Arc<dyn Radio>,
      event_tx: EventSender,
      settings: MonitorSettings,
   ) -> Result<Self> {
      let events = radio.events().await?;
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(ManagerActor::new(radio, event_tx, settings, command_rx).run(events));
      Ok(Self { inbox: command_tx })
   }

   async fn request<T>(
      &self,
      command: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand,
   ) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(command(tx))
         .await
         .map_err(|_| HrmError::ManagerShutdown)?;
      rx.await.map_err(|_| HrmError::ManagerShutdown)
   }

   /// Asks for scanning. The request is sticky: scanning resumes on every
   /// later power-on or wake.
   pub async fn start_scanning(&self) -> Result<()> {
      self.request(ManagerCommand::StartScanning).await
   }

   pub async fn stop_scanning(&self) -> Result<()> {
      self.request(ManagerCommand::StopScanning).await?
   }

   /// Connects a discovered sensor, resolving once the attempt settles.
   pub async fn connect(&self, id: &DeviceId) -> Result<()> {
      self
         .request(|tx| ManagerCommand::Connect(id.clone(), Some(tx)))
         .await?
   }

   pub async fn disconnect(&self, id: &DeviceId) -> Result<()> {
      self
         .request(|tx| ManagerCommand::Disconnect(id.clone(), Some(tx)))
         .await?
   }

   pub async fn get_device(&self, id: &DeviceId) -> Result<HeartRateSensor> {
      self
         .request(|tx| ManagerCommand::GetDevice(id.clone(), tx))
         .await?
         .ok_or_else(|| HrmError::DeviceNotFound(id.clone()))
   }

   pub async fn all_devices(&self) -> Vec<HeartRateSensor> {
      self
         .request(ManagerCommand::GetAllDevices)
         .await
         .unwrap_or_default()
   }

   pub async fn connected_devices(&self) -> Vec<HeartRateSensor> {
      self
         .request(ManagerCommand::GetConnectedDevices)
         .await
         .unwrap_or_default()
   }

   pub async fn count_devices(&self) -> usize {
      self
         .request(ManagerCommand::CountDevices)
         .await
         .unwrap_or_default()
   }

   /// Stops scanning and tears every session down, remembering which
   /// sensors were connected so [`wake`](Self::wake) can bring them back.
   pub async fn suspend(&self) -> Result<()> {
      self.request(ManagerCommand::Suspend).await
   }

   /// Waits for the adapter, then resumes scanning and reconnects the
   /// sensors that were connected at suspend time.
   pub async fn wake(&self) -> Result<()> {
      self.request(ManagerCommand::Wake).await?
   }

   /// Cleans up and stops the actor. Later calls fail with
   /// [`HrmError::ManagerShutdown`].
   pub async fn shutdown(&self) -> Result<()> {
      self.request(ManagerCommand::Shutdown).await
   }
}

// === Manager Actor ===

struct ManagerActor {
   radio: Arc<dyn Radio>,
   event_tx: EventSender,
   settings: MonitorSettings,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::Receiver<ManagerCommand>,
   loopback_tx: mpsc::Sender<ManagerCommand>,

   // State
   adapter_state: AdapterState,
   gate: ReadinessGate,
   scan: ScanController,
   registry: Registry,
   suspended: bool,
   /// Sessions that were connected when the manager was suspended.
   asleep: Vec<HeartRateSensor>,
   /// Callers waiting on a wake in progress.
   wake_waiters: Vec<Reply>,
}

impl ManagerActor {
   fn new(
      radio: Arc<dyn Radio>,
      event_tx: EventSender,
      settings: MonitorSettings,
      command_rx: mpsc::Receiver<ManagerCommand>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         radio,
         event_tx,
         settings,
         command_rx,
         loopback_rx,
         loopback_tx,
         adapter_state: AdapterState::Unknown,
         gate: ReadinessGate::new(),
         scan: ScanController::new(),
         registry: Registry::new(),
         suspended: false,
         asleep: Vec::new(),
         wake_waiters: Vec::new(),
      }
   }

   async fn run(mut self, events: BoxStream<'static, RadioEvent>) {
      info!("Heart-rate monitor starting up");
      self.forward_radio_events(events);

      // A radio that is already powered on never reports a transition
      match self.radio.state().await {
         Ok(state) => self.handle_adapter_state(state).await,
         Err(e) => warn!("Failed to query adapter state: {e}"),
      }

      let mut sweep_interval = self.settings.sweeper.interval();

      // Main event loop
      loop {
         select! {
             _ = sweep_interval.tick() => {
                 self.sweep_discovered();
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Heart-rate monitor shutting down");
                     break;
                 };
                 if !self.handle_command(cmd).await {
                     break;
                 }
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 if !self.handle_command(cmd).await {
                     break;
                 }
             }
         }
      }

      self.release_all().await;
   }

   fn forward_radio_events(&self, mut events: BoxStream<'static, RadioEvent>) {
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         while let Some(event) = events.next().await {
            if loopback.send(ManagerCommand::Radio(event)).await.is_err() {
               return;
            }
         }
         warn!("Radio event stream ended");
      });
   }

   fn emit(&self, event: MonitorEvent) {
      debug!("Emitting {}", event.name());
      self.event_tx.emit(event);
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) -> bool {
      match cmd {
         ManagerCommand::Radio(event) => {
            self.handle_radio_event(event).await;
         },
         ManagerCommand::ScanStartFinished(result) => {
            self.handle_scan_start_finished(result).await;
         },
         ManagerCommand::ConnectFinished(sensor, result) => {
            self.handle_connect_finished(sensor, result).await;
         },
         ManagerCommand::LinkProbed(id, alive) => {
            self.handle_link_probed(&id, alive);
         },
         ManagerCommand::WakeFinished(ready) => {
            self.handle_wake_finished(ready);
         },
         ManagerCommand::StartScanning(reply) => {
            if self.scan.request() {
               self.spawn_scan_start();
            }
            let _ = reply.send(());
         },
         ManagerCommand::StopScanning(reply) => {
            self.scan.cancel_pending();
            let result = self.stop_scan().await;
            let _ = reply.send(result);
         },
         ManagerCommand::Connect(id, reply) => {
            self.connect(id, reply);
         },
         ManagerCommand::Disconnect(id, reply) => {
            self.disconnect(&id, reply);
         },
         ManagerCommand::GetDevice(id, reply) => {
            let _ = reply.send(self.registry.get(&id));
         },
         ManagerCommand::GetAllDevices(reply) => {
            let _ = reply.send(self.registry.sensors());
         },
         ManagerCommand::GetConnectedDevices(reply) => {
            let _ = reply.send(self.registry.in_state(LinkState::Connected));
         },
         ManagerCommand::CountDevices(reply) => {
            let _ = reply.send(self.registry.len());
         },
         ManagerCommand::Suspend(reply) => {
            self.suspend().await;
            let _ = reply.send(());
         },
         ManagerCommand::Wake(reply) => {
            self.wake(reply).await;
         },
         ManagerCommand::Shutdown(reply) => {
            info!("Shutdown requested");
            self.release_all().await;
            let _ = reply.send(());
            return false;
         },
      }
      true
   }

   async fn handle_radio_event(&mut self, event: RadioEvent) {
      match event {
         RadioEvent::StateChanged(state) => self.handle_adapter_state(state).await,
         RadioEvent::Discovered(ad) => self.handle_advertisement(&ad),
         RadioEvent::Disconnected(id) => self.handle_link_dropped(&id).await,
         RadioEvent::ScanStarted => self.emit(MonitorEvent::ScanStarted),
         RadioEvent::ScanStopped => self.emit(MonitorEvent::ScanStopped),
      }
   }

   // === Adapter & scanning ===

   async fn handle_adapter_state(&mut self, state: AdapterState) {
      if state == self.adapter_state {
         return;
      }
      info!("Adapter state changed: {} -> {state}", self.adapter_state);
      self.adapter_state = state;
      self.emit(MonitorEvent::AdapterStateChanged(state));

      if !state.is_ready() {
         self.gate.reset();
         if let Err(e) = self.stop_scan().await {
            warn!("Failed to stop scanning: {e}");
         }
      } else if !self.suspended {
         if self.gate.set_ready() {
            info!("Adapter ready");
            self.emit(MonitorEvent::AdapterReady);
         }
         if self.scan.try_begin() {
            self.spawn_scan_start();
         }
      }
   }

   /// Issues the radio start once the gate opens. The scan controller must
   /// already have marked the start as pending.
   fn spawn_scan_start(&self) {
      let gate = self.gate.clone();
      let radio = self.radio.clone();
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         gate.wait_ready().await;
         debug!("Adapter ready, starting scan");
         let result = radio.start_scan(&[HEART_RATE_SERVICE], true).await;
         let _ = loopback.send(ManagerCommand::ScanStartFinished(result)).await;
      });
   }

   async fn handle_scan_start_finished(&mut self, result: Result<()>) {
      match result {
         Ok(()) => {
            let cancelled = self.scan.finish_start(true);
            info!("Scanning for heart-rate sensors");
            // Stopped, suspended or the adapter went away while starting
            if cancelled || self.suspended || !self.adapter_state.is_ready() {
               if let Err(e) = self.stop_scan().await {
                  warn!("Failed to stop scanning: {e}");
               }
            }
         },
         Err(e) => {
            self.scan.finish_start(false);
            error!("Failed to start scanning: {e}");
            self.emit(MonitorEvent::Error(Fault::scan(&e)));
         },
      }
   }

   async fn stop_scan(&mut self) -> Result<()> {
      if !self.scan.begin_stop() {
         return Ok(());
      }
      info!("Stopping scan");
      self.radio.stop_scan().await
   }

   // === Devices ===

   fn handle_advertisement(&mut self, ad: &Advertisement) {
      match self
         .registry
         .observe(ad, Instant::now(), &self.settings.session)
      {
         Observation::Discovered(sensor) => {
            self.emit(MonitorEvent::DeviceDiscovered(sensor.clone()));
            if self.settings.auto_connect {
               self.connect(sensor.id().clone(), None);
            }
         },
         Observation::Refreshed => {
            debug!("Advertisement refreshed {} (rssi {:?})", ad.id, ad.rssi);
         },
         Observation::Probe(sensor) => self.probe_link(sensor),
         Observation::Ignored => {},
      }
   }

   /// Checks whether a connected sensor that is advertising again still
   /// holds its link.
   fn probe_link(&self, sensor: HeartRateSensor) {
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         let alive = sensor.peripheral().is_connected().await;
         let _ = loopback
            .send(ManagerCommand::LinkProbed(sensor.id().clone(), alive))
            .await;
      });
   }

   fn handle_link_probed(&mut self, id: &DeviceId, alive: bool) {
      if let Some(sensor) = self.registry.probe_finished(id, alive) {
         self.spawn_connect(sensor, ConnectOptions::default());
      }
   }

   fn connect(&mut self, id: DeviceId, reply: Option<Reply>) {
      match self.registry.begin_connect(&id) {
         Ok(sensor) => {
            if let Some(reply) = reply {
               self.registry.await_connect(&id, reply);
            }
            self.spawn_connect(sensor, ConnectOptions::default());
         },
         Err(HrmError::AlreadyConnecting) => {
            debug!("{id}: joining connect already in progress");
            if let Some(reply) = reply {
               self.registry.await_connect(&id, reply);
            }
         },
         Err(e) => {
            warn!("Cannot connect to {id}: {e}");
            if let Some(reply) = reply {
               let _ = reply.send(Err(e));
            }
         },
      }
   }

   fn spawn_connect(&self, sensor: HeartRateSensor, options: ConnectOptions) {
      let event_tx = self.event_tx.clone();
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         let result = sensor.connect(&event_tx, options).await;
         let _ = loopback
            .send(ManagerCommand::ConnectFinished(sensor, result))
            .await;
      });
   }

   async fn handle_connect_finished(&mut self, sensor: HeartRateSensor, result: Result<()>) {
      let id = sensor.id().clone();
      let current = self.registry.get(&id);
      let settled = match current {
         Some(current) if current.same_session(&sensor) => {
            self.registry.finish_connect(&id, result.is_ok())
         },
         _ => None,
      };
      let Some(settled) = settled else {
         // The session was evicted while connecting
         if result.is_ok() {
            info!("{id}: connected after its session was dropped, disconnecting");
            if let Err(e) = sensor.disconnect().await {
               warn!("{id}: failed to drop orphaned link: {e}");
            }
         } else {
            sensor.link_lost().await;
         }
         if self.registry.state(&id).is_none() {
            self.radio.forget(&id);
         }
         return;
      };

      match result {
         Ok(()) => {
            info!("Device connected: {} ({id})", sensor.name());
            self.emit(MonitorEvent::DeviceConnected(sensor));
            for waiter in settled.waiters {
               let _ = waiter.send(Ok(()));
            }
            if settled.disconnect_queued {
               debug!("{id}: applying queued disconnect");
               let mut waiters = settled.disconnect_waiters.into_iter();
               self.disconnect(&id, waiters.next());
               for waiter in waiters {
                  let _ = waiter.send(Ok(()));
               }
            }
         },
         Err(e) => {
            warn!("Failed to connect to {id}: {e}");
            sensor.link_lost().await;
            self.emit(MonitorEvent::Error(Fault::connect(id.clone(), &e)));
            let message = e.to_smolstr();
            let mut error = Some(e);
            for waiter in settled.waiters {
               let err = error
                  .take()
                  .unwrap_or_else(|| HrmError::ConnectFailed(message.clone()));
               let _ = waiter.send(Err(err));
            }
            for waiter in settled.disconnect_waiters {
               let _ = waiter.send(Ok(()));
            }
            self.radio.forget(&id);
            if settled.reconnect {
               info!("Device disconnected: {} ({id})", sensor.name());
               self.emit(MonitorEvent::DeviceDisconnected(sensor));
            }
         },
      }
   }

   fn disconnect(&mut self, id: &DeviceId, reply: Option<Reply>) {
      match self.registry.request_disconnect(id, reply) {
         Detach::Removed(sensor, reply) => {
            info!("Device disconnected: {} ({id})", sensor.name());
            self.emit(MonitorEvent::DeviceDisconnected(sensor.clone()));
            self.radio.forget(id);
            tokio::spawn(async move {
               let result = sensor.disconnect().await;
               if let Err(e) = &result {
                  warn!("{}: error while disconnecting: {e}", sensor.id());
               }
               if let Some(reply) = reply {
                  let _ = reply.send(result);
               }
            });
         },
         Detach::Queued => {
            debug!("{id}: disconnect queued until the connect settles");
         },
         Detach::Absent(reply) => {
            debug!("{id}: not connected, nothing to disconnect");
            if let Some(reply) = reply {
               let _ = reply.send(Ok(()));
            }
         },
      }
   }

   /// The radio reported a dropped link.
   async fn handle_link_dropped(&mut self, id: &DeviceId) {
      if self.registry.state(id) != Some(LinkState::Connected) {
         // Connects in flight settle through their own result
         debug!("{id}: link drop ignored");
         return;
      }
      if let Detach::Removed(sensor, _) = self.registry.request_disconnect(id, None) {
         info!("Device disconnected: {} ({id})", sensor.name());
         sensor.link_lost().await;
         self.radio.forget(id);
         self.emit(MonitorEvent::DeviceDisconnected(sensor));
      }
   }

   fn sweep_discovered(&mut self) {
      for sensor in self.settings.sweeper.sweep(&mut self.registry, Instant::now()) {
         self.radio.forget(sensor.id());
         self.emit(MonitorEvent::DiscoveredDeviceLost(sensor));
      }
   }

   // === Lifecycle ===

   /// Stops scanning and disconnects every session. Returns the sessions
   /// that were connected; the radio keeps those until they are released.
   async fn cleanup(&mut self) -> Vec<HeartRateSensor> {
      if let Err(e) = self.stop_scan().await {
         warn!("Failed to stop scanning: {e}");
      }

      let evicted = self.registry.drain();
      if evicted.is_empty() {
         return Vec::new();
      }
      info!("Disconnecting {} device(s)", evicted.len());

      let mut sessions = Vec::with_capacity(evicted.len());
      for Evicted {
         sensor,
         state,
         waiters,
      } in evicted
      {
         for waiter in waiters {
            let _ = waiter.send(Err(HrmError::ConnectionClosed));
         }
         sessions.push((sensor, state));
      }

      let results = join_all(sessions.iter().map(|(sensor, _)| sensor.disconnect())).await;
      let mut connected = Vec::new();
      for ((sensor, state), result) in sessions.into_iter().zip(results) {
         if let Err(e) = result {
            warn!("{}: error during cleanup: {e}", sensor.id());
         }
         if state == LinkState::Connected {
            self.emit(MonitorEvent::DeviceDisconnected(sensor.clone()));
            connected.push(sensor);
         } else {
            self.radio.forget(sensor.id());
         }
      }
      connected
   }

   /// Final cleanup; nothing is remembered for a later wake.
   async fn release_all(&mut self) {
      let connected = self.cleanup().await;
      let asleep = mem::take(&mut self.asleep);
      for sensor in connected.iter().chain(&asleep) {
         self.radio.forget(sensor.id());
      }
   }

   async fn suspend(&mut self) {
      info!("Suspending");
      self.suspended = true;
      self.adapter_state = AdapterState::Unknown;
      self.gate.reset();
      let connected = self.cleanup().await;
      self.asleep.extend(connected);
   }

   async fn wake(&mut self, reply: Reply) {
      info!("Waking up");
      self.suspended = false;
      // Power changes seen while asleep never opened the gate
      self.adapter_state = AdapterState::Unknown;
      match self.radio.state().await {
         Ok(state) => self.handle_adapter_state(state).await,
         Err(e) => warn!("Failed to query adapter state: {e}"),
      }

      self.wake_waiters.push(reply);
      if self.wake_waiters.len() > 1 {
         return;
      }
      let gate = self.gate.clone();
      let timeout = self.settings.wake_timeout;
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         let ready = time::timeout(timeout, gate.wait_ready()).await.is_ok();
         let _ = loopback.send(ManagerCommand::WakeFinished(ready)).await;
      });
   }

   fn handle_wake_finished(&mut self, ready: bool) {
      let waiters = mem::take(&mut self.wake_waiters);
      if !ready {
         error!(
            "Adapter not ready {:?} after wake, giving up on reconnection",
            self.settings.wake_timeout
         );
         self.emit(MonitorEvent::Error(Fault::adapter_timeout()));
         for waiter in waiters {
            let _ = waiter.send(Err(HrmError::AdapterTimeout));
         }
         return;
      }
      if self.suspended {
         for waiter in waiters {
            let _ = waiter.send(Err(HrmError::ConnectionClosed));
         }
         return;
      }

      if self.scan.try_begin() {
         self.spawn_scan_start();
      }
      for sensor in mem::take(&mut self.asleep) {
         if self.registry.restore(sensor.clone()) {
            info!("Reconnecting {} after wake", sensor.id());
            self.spawn_connect(sensor, ConnectOptions { force_awake: true });
         }
      }
      for waiter in waiters {
         let _ = waiter.send(Ok(()));
      }
   }
}
