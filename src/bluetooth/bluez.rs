//! BlueZ backend for the radio collaborator.
//!
//! Wraps a `bluer` adapter: power changes and scan results become
//! [`RadioEvent`]s, and every advertised device is exposed as a
//! [`BluezPeripheral`].

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use bluer::{
   Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty,
   DiscoveryFilter, DiscoveryTransport, ErrorKind, Session, gatt::remote::Characteristic,
};
use futures::{
   StreamExt,
   channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
   stream::BoxStream,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time};
use uuid::Uuid;

use crate::{
   bluetooth::radio::{Advertisement, NotificationStream, Peripheral, Radio, RadioEvent},
   error::{HrmError, Result},
   sensor::protocol::{AdapterState, DeviceId, Payload},
};

/// Maximum time to wait for GATT services after connecting
const SERVICES_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
/// Poll period while waiting for GATT services
const SERVICES_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Maps BlueZ failures onto the errors the manager classifies.
fn classify(err: bluer::Error) -> HrmError {
   match err.kind {
      ErrorKind::NotFound => HrmError::NoAdapter,
      ErrorKind::NotAuthorized | ErrorKind::NotPermitted => HrmError::PermissionDenied,
      _ => HrmError::Bluetooth(err),
   }
}

const fn power_state(powered: bool) -> AdapterState {
   if powered {
      AdapterState::PoweredOn
   } else {
      AdapterState::PoweredOff
   }
}

struct Shared {
   adapter: Adapter,
   events_tx: UnboundedSender<RadioEvent>,
   peripherals: Mutex<HashMap<DeviceId, Arc<BluezPeripheral>>>,
}

impl Shared {
   fn send(&self, event: RadioEvent) {
      let _ = self.events_tx.unbounded_send(event);
   }

   /// Returns the peripheral for `addr`, creating it on first sight. The
   /// entry lives until the manager forgets the device.
   async fn peripheral(self: &Arc<Self>, addr: Address) -> Result<Arc<BluezPeripheral>> {
      let id = DeviceId::from(addr);
      if let Some(existing) = self.peripherals.lock().get(&id) {
         return Ok(existing.clone());
      }
      let device = self.adapter.device(addr)?;
      let watcher = Self::watch_device(self.events_tx.clone(), &device).await?;
      let peripheral = Arc::new(BluezPeripheral {
         id: id.clone(),
         device,
         characteristics: Mutex::new(HashMap::new()),
         watcher,
      });
      Ok(
         self
            .peripherals
            .lock()
            .entry(id)
            .or_insert(peripheral)
            .clone(),
      )
   }

   /// Reports every link drop of `device` as [`RadioEvent::Disconnected`].
   async fn watch_device(
      events_tx: UnboundedSender<RadioEvent>,
      device: &Device,
   ) -> Result<JoinHandle<()>> {
      let id = DeviceId::from(device.address());
      let mut events = Box::pin(device.events().await?);
      Ok(tokio::spawn(async move {
         while let Some(event) = events.next().await {
            if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
               debug!("{id}: link dropped");
               if events_tx
                  .unbounded_send(RadioEvent::Disconnected(id.clone()))
                  .is_err()
               {
                  break;
               }
            }
         }
      }))
   }

   async fn advertisement(self: &Arc<Self>, addr: Address) -> Result<Advertisement> {
      let peripheral = self.peripheral(addr).await?;
      let local_name = peripheral.device.name().await.ok().flatten();
      let rssi = peripheral.device.rssi().await.ok().flatten();
      Ok(Advertisement {
         id: peripheral.id.clone(),
         local_name: local_name.map(Into::into),
         // BlueZ only reports devices it could connect to under the LE filter
         connectable: true,
         rssi,
         peripheral,
      })
   }
}

/// Radio backed by a BlueZ adapter.
pub struct BluezRadio {
   shared: Arc<Shared>,
   events_rx: Mutex<Option<UnboundedReceiver<RadioEvent>>>,
   monitor: JoinHandle<()>,
   discovery: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for BluezRadio {
   fn drop(&mut self) {
      self.monitor.abort();
      if let Some(discovery) = self.discovery.lock().take() {
         discovery.abort();
      }
   }
}

impl BluezRadio {
   /// Opens the named adapter, or the system default one.
   pub async fn new(adapter_name: Option<&str>) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = match adapter_name {
         Some(name) => session.adapter(name),
         None => session.default_adapter().await,
      }
      .map_err(classify)?;
      info!("Using Bluetooth adapter: {}", adapter.name());

      let (events_tx, events_rx) = mpsc::unbounded();
      let shared = Arc::new(Shared {
         adapter,
         events_tx,
         peripherals: Mutex::new(HashMap::new()),
      });
      let monitor = Self::start_adapter_monitor(shared.clone()).await?;
      Ok(Self {
         shared,
         events_rx: Mutex::new(Some(events_rx)),
         monitor,
         discovery: Mutex::new(None),
      })
   }

   async fn start_adapter_monitor(shared: Arc<Shared>) -> Result<JoinHandle<()>> {
      let mut events = shared.adapter.events().await?;
      Ok(tokio::spawn(async move {
         while let Some(event) = events.next().await {
            if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
               debug!("Adapter {} powered: {powered}", shared.adapter.name());
               shared.send(RadioEvent::StateChanged(power_state(powered)));
            }
         }
         warn!("Adapter {} event stream ended", shared.adapter.name());
      }))
   }
}

#[async_trait]
impl Radio for BluezRadio {
   async fn events(&self) -> Result<BoxStream<'static, RadioEvent>> {
      let rx = self.events_rx.lock().take().ok_or(HrmError::ConnectionClosed)?;
      Ok(rx.boxed())
   }

   async fn state(&self) -> Result<AdapterState> {
      let powered = self.shared.adapter.is_powered().await.map_err(classify)?;
      Ok(power_state(powered))
   }

   async fn start_scan(&self, services: &[Uuid], allow_duplicates: bool) -> Result<()> {
      let filter = DiscoveryFilter {
         uuids: services.iter().copied().collect(),
         transport: DiscoveryTransport::Le,
         duplicate_data: allow_duplicates,
         ..Default::default()
      };
      self
         .shared
         .adapter
         .set_discovery_filter(filter)
         .await
         .map_err(classify)?;
      let discover = self
         .shared
         .adapter
         .discover_devices_with_changes()
         .await
         .map_err(classify)?;

      let shared = self.shared.clone();
      let handle = tokio::spawn(async move {
         let mut discover = Box::pin(discover);
         while let Some(event) = discover.next().await {
            let AdapterEvent::DeviceAdded(addr) = event else {
               continue;
            };
            match shared.advertisement(addr).await {
               Ok(ad) => shared.send(RadioEvent::Discovered(ad)),
               Err(e) => debug!("Skipping advertisement from {addr}: {e}"),
            }
         }
      });
      if let Some(previous) = self.discovery.lock().replace(handle) {
         previous.abort();
      }
      self.shared.send(RadioEvent::ScanStarted);
      Ok(())
   }

   async fn stop_scan(&self) -> Result<()> {
      // Dropping the discovery stream ends the BlueZ discovery session
      if let Some(discovery) = self.discovery.lock().take() {
         discovery.abort();
         self.shared.send(RadioEvent::ScanStopped);
      }
      Ok(())
   }

   fn forget(&self, id: &DeviceId) {
      // The link watcher stops once the last session handle is gone
      if self.shared.peripherals.lock().remove(id).is_some() {
         debug!("{id}: released");
      }
   }
}

/// A BlueZ device seen while scanning.
pub struct BluezPeripheral {
   id: DeviceId,
   device: Device,
   characteristics: Mutex<HashMap<Uuid, Characteristic>>,
   watcher: JoinHandle<()>,
}

impl Drop for BluezPeripheral {
   fn drop(&mut self) {
      self.watcher.abort();
   }
}

impl BluezPeripheral {
   fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
      self
         .characteristics
         .lock()
         .get(&uuid)
         .cloned()
         .ok_or(HrmError::CharacteristicNotFound(uuid))
   }

   async fn wait_services_resolved(&self) -> Result<()> {
      let poll = async {
         loop {
            if self.device.is_services_resolved().await? {
               return Ok::<_, HrmError>(());
            }
            time::sleep(SERVICES_POLL_INTERVAL).await;
         }
      };
      time::timeout(SERVICES_RESOLVE_TIMEOUT, poll)
         .await
         .map_err(|_| HrmError::ConnectionClosed)?
   }
}

#[async_trait]
impl Peripheral for BluezPeripheral {
   fn id(&self) -> &DeviceId {
      &self.id
   }

   async fn connect(&self) -> Result<()> {
      if !self.device.is_connected().await? {
         self.device.connect().await?;
      }
      self.wait_services_resolved().await
   }

   async fn disconnect(&self) -> Result<()> {
      self.device.disconnect().await?;
      Ok(())
   }

   async fn is_connected(&self) -> bool {
      self.device.is_connected().await.unwrap_or(false)
   }

   async fn discover_characteristics(&self) -> Result<Vec<Uuid>> {
      let mut found = HashMap::new();
      for service in self.device.services().await? {
         for characteristic in service.characteristics().await? {
            found.insert(characteristic.uuid().await?, characteristic);
         }
      }
      let uuids = found.keys().copied().collect();
      *self.characteristics.lock() = found;
      Ok(uuids)
   }

   async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream> {
      let stream = self.characteristic(characteristic)?.notify().await?;
      Ok(stream.map(Payload::from_vec).boxed())
   }

   async fn read(&self, characteristic: Uuid) -> Result<Payload> {
      let data = self.characteristic(characteristic)?.read().await?;
      Ok(Payload::from_vec(data))
   }

   async fn read_rssi(&self) -> Result<i16> {
      self
         .device
         .rssi()
         .await?
         .ok_or(HrmError::SignalUnavailable)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_power_state_mapping() {
      assert_eq!(power_state(true), AdapterState::PoweredOn);
      assert_eq!(power_state(false), AdapterState::PoweredOff);
   }
}
