//! Heart-rate monitor D-Bus daemon
//!
//! This service scans for Bluetooth LE heart-rate sensors, keeps them
//! connected across adapter power cycles and system sleep, and publishes
//! their telemetry on the session bus.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use futures::{StreamExt, stream, stream::BoxStream};
use log::{info, warn};
use tokio::{
   signal::unix::{SignalKind, signal},
   sync::Notify,
   time,
};
use zbus::{Connection, connection, object_server::InterfaceRef};

use hrmond::{
   EventBus, MonitorEvent, MonitorManager, Result,
   bluetooth::bluez::BluezRadio,
   config::Config,
   dbus::{BUS_NAME, HeartRateService, HeartRateServiceSignals, OBJECT_PATH},
   lifecycle::{self, LifecycleSignal},
   sensor::protocol::DeviceId,
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting hrmond D-Bus service...");

   // Load configuration
   let config = Config::load()?;
   info!(
      "Loaded configuration (adapter: {}, auto-connect: {})",
      config.adapter.as_deref().unwrap_or("default"),
      config.auto_connect
   );

   // Create event channel
   let event_bus = EventProcessor::new();

   // Open the radio and start the manager on top of it
   let radio = Arc::new(BluezRadio::new(config.adapter.as_deref()).await?);
   let manager = MonitorManager::new(radio, event_bus.clone(), config.monitor_settings()).await?;

   // Create D-Bus service
   let service = HeartRateService::new(manager.clone());

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name(BUS_NAME)?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("hrmond D-Bus service started at {BUS_NAME}");

   // Start event processor
   event_bus.spawn_dispatcher(connection).await?;

   manager.start_scanning().await?;

   // Run until a termination signal arrives
   lifecycle::drive(&manager, process_signals()?).await?;
   info!("hrmond stopped");

   Ok(())
}

fn on_signal(
   kind: SignalKind,
   what: LifecycleSignal,
) -> Result<BoxStream<'static, LifecycleSignal>> {
   let listener = signal(kind)?;
   Ok(stream::unfold(listener, move |mut listener| async move {
      listener.recv().await.map(|()| (what, listener))
   })
   .boxed())
}

/// Maps process signals onto lifecycle triggers. A terminal stop request
/// (Ctrl+Z) counts as going to sleep and the matching continue as waking up.
fn process_signals() -> Result<BoxStream<'static, LifecycleSignal>> {
   Ok(stream::select_all([
      on_signal(SignalKind::from_raw(libc::SIGTSTP), LifecycleSignal::Suspend)?,
      on_signal(SignalKind::from_raw(libc::SIGCONT), LifecycleSignal::Resume)?,
      on_signal(SignalKind::interrupt(), LifecycleSignal::Shutdown)?,
      on_signal(SignalKind::terminate(), LifecycleSignal::Shutdown)?,
      on_signal(SignalKind::user_defined2(), LifecycleSignal::Shutdown)?,
   ])
   .boxed())
}

struct EventProcessor {
   queue: SegQueue<MonitorEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<MonitorEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<HeartRateService>,
      event: MonitorEvent,
   ) -> Result<()> {
      match event {
         MonitorEvent::AdapterStateChanged(state) => {
            iface.adapter_state_changed(state.to_str()).await?;
         },
         MonitorEvent::AdapterReady => {
            iface.adapter_ready().await?;
         },
         MonitorEvent::ScanStarted => {
            iface.scan_started().await?;
         },
         MonitorEvent::ScanStopped => {
            iface.scan_stopped().await?;
         },
         MonitorEvent::DeviceDiscovered(sensor) => {
            iface
               .device_discovered(sensor.id().as_str(), &sensor.name())
               .await?;
         },
         MonitorEvent::DeviceConnected(sensor) => {
            iface.device_connected(sensor.id().as_str()).await?;
            iface
               .get()
               .await
               .connected_count_changed(iface.signal_emitter())
               .await?;
         },
         MonitorEvent::DeviceDisconnected(sensor) => {
            iface.device_disconnected(sensor.id().as_str()).await?;
            iface
               .get()
               .await
               .connected_count_changed(iface.signal_emitter())
               .await?;
         },
         MonitorEvent::DiscoveredDeviceLost(sensor) => {
            iface.discovered_device_lost(sensor.id().as_str()).await?;
         },
         MonitorEvent::Data(snapshot) => {
            iface
               .data(snapshot.device_id.as_str(), &snapshot.to_json().to_string())
               .await?;
         },
         MonitorEvent::Error(fault) => {
            let kind: &'static str = fault.kind.into();
            let address = fault.device.as_ref().map_or("", DeviceId::as_str);
            iface.error(kind, address, &fault.message).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, HeartRateService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: MonitorEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
