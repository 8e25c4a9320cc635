use std::str::FromStr;

use bluer::Address;
use zbus::{interface, object_server::SignalEmitter};

use crate::{bluetooth::manager::MonitorManager, sensor::protocol::DeviceId};

/// Well-known bus name of the daemon.
pub const BUS_NAME: &str = "org.hrmond";
/// Object path the monitor interface is served at.
pub const OBJECT_PATH: &str = "/org/hrmond/manager";

fn parse_device(address: &str) -> zbus::fdo::Result<DeviceId> {
   let addr =
      Address::from_str(address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
   Ok(DeviceId::from(addr))
}

fn failed(err: impl ToString) -> zbus::fdo::Error {
   zbus::fdo::Error::Failed(err.to_string())
}

pub struct HeartRateService {
   manager: MonitorManager,
}

impl HeartRateService {
   pub const fn new(manager: MonitorManager) -> Self {
      Self { manager }
   }
}

#[interface(name = "org.hrmond.Monitor")]
impl HeartRateService {
   async fn get_devices(&self) -> zbus::fdo::Result<String> {
      let states: Vec<serde_json::Value> = self
         .manager
         .all_devices()
         .await
         .into_iter()
         .map(|d| d.to_json())
         .collect();
      serde_json::to_string(&states).map_err(failed)
   }

   async fn get_device(&self, address: String) -> zbus::fdo::Result<String> {
      let id = parse_device(&address)?;
      let dev = self.manager.get_device(&id).await.map_err(failed)?;
      Ok(dev.to_json().to_string())
   }

   async fn start_scanning(&self) -> zbus::fdo::Result<bool> {
      self.manager.start_scanning().await.map_err(failed)?;
      Ok(true)
   }

   async fn stop_scanning(&self) -> zbus::fdo::Result<bool> {
      self.manager.stop_scanning().await.map_err(failed)?;
      Ok(true)
   }

   async fn connect_device(&self, address: String) -> zbus::fdo::Result<bool> {
      let id = parse_device(&address)?;
      self.manager.connect(&id).await.map_err(failed)?;
      Ok(true)
   }

   async fn disconnect_device(&self, address: String) -> zbus::fdo::Result<bool> {
      let id = parse_device(&address)?;
      self.manager.disconnect(&id).await.map_err(failed)?;
      Ok(true)
   }

   // Signals
   #[zbus(signal)]
   pub async fn adapter_state_changed(emitter: &SignalEmitter<'_>, state: &str)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn adapter_ready(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn scan_started(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn scan_stopped(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_discovered(
      emitter: &SignalEmitter<'_>,
      address: &str,
      name: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_connected(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_disconnected(emitter: &SignalEmitter<'_>, address: &str)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn discovered_device_lost(
      emitter: &SignalEmitter<'_>,
      address: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn data(emitter: &SignalEmitter<'_>, address: &str, snapshot: &str)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn error(
      emitter: &SignalEmitter<'_>,
      kind: &str,
      address: &str,
      message: &str,
   ) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn devices(&self) -> String {
      self.get_devices().await.unwrap_or_default()
   }

   #[zbus(property)]
   async fn connected_count(&self) -> u32 {
      let count = self.manager.connected_devices().await.len();
      u32::try_from(count).unwrap_or(u32::MAX)
   }
}
