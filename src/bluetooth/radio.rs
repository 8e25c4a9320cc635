//! Radio adapter collaborator.
//!
//! The session manager never talks to a Bluetooth stack directly; it goes
//! through the [`Radio`] and [`Peripheral`] traits. The BlueZ backend lives
//! in [`crate::bluetooth::bluez`].

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use futures::stream::BoxStream;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   error::Result,
   sensor::protocol::{AdapterState, DeviceId, Payload},
};

/// Stream of characteristic notifications.
pub type NotificationStream = BoxStream<'static, Payload>;

/// Shared handle to a remote peripheral owned by the radio.
pub type PeripheralRef = Arc<dyn Peripheral>;

/// Events produced by the radio adapter.
#[derive(Debug, Clone)]
pub enum RadioEvent {
   StateChanged(AdapterState),
   Discovered(Advertisement),
   /// The link to a peripheral dropped, whoever initiated it.
   Disconnected(DeviceId),
   ScanStarted,
   ScanStopped,
}

/// A single advertisement as reported during scanning.
#[derive(Clone)]
pub struct Advertisement {
   pub id: DeviceId,
   pub local_name: Option<SmolStr>,
   pub connectable: bool,
   pub rssi: Option<i16>,
   pub peripheral: PeripheralRef,
}

impl fmt::Debug for Advertisement {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Advertisement")
         .field("id", &self.id)
         .field("local_name", &self.local_name)
         .field("connectable", &self.connectable)
         .field("rssi", &self.rssi)
         .finish_non_exhaustive()
   }
}

/// The local radio adapter.
#[async_trait]
pub trait Radio: Send + Sync + 'static {
   /// Takes the adapter event stream. Only the first caller receives events.
   async fn events(&self) -> Result<BoxStream<'static, RadioEvent>>;

   /// Current adapter power state.
   async fn state(&self) -> Result<AdapterState>;

   async fn start_scan(&self, services: &[Uuid], allow_duplicates: bool) -> Result<()>;

   async fn stop_scan(&self) -> Result<()>;

   /// Releases what the radio keeps for a peripheral the manager dropped.
   fn forget(&self, id: &DeviceId);
}

/// A remote peripheral reachable through the radio.
#[async_trait]
pub trait Peripheral: Send + Sync + 'static {
   fn id(&self) -> &DeviceId;

   async fn connect(&self) -> Result<()>;

   async fn disconnect(&self) -> Result<()>;

   async fn is_connected(&self) -> bool;

   /// Resolves services and returns every characteristic found.
   async fn discover_characteristics(&self) -> Result<Vec<Uuid>>;

   async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream>;

   async fn read(&self, characteristic: Uuid) -> Result<Payload>;

   /// Samples the current signal strength in dBm.
   async fn read_rssi(&self) -> Result<i16>;
}
