//! Device registry.
//!
//! Every known sensor lives in a single map, tagged with the phase it is in.
//! A sensor is therefore discovered, connecting or connected, never two at
//! once, and promotion is just a retag of the same entry.

use std::{collections::HashMap, mem};

use log::{debug, info};
use tokio::{sync::oneshot, time::Instant};

use crate::{
   bluetooth::radio::Advertisement,
   error::{HrmError, Result},
   sensor::{
      device::{HeartRateSensor, SessionSettings},
      protocol::{DeviceId, LinkState},
   },
};

/// Completion channel for a caller waiting on a connect or disconnect.
pub type Reply = oneshot::Sender<Result<()>>;

enum Slot {
   Discovered {
      last_seen: Instant,
   },
   Connecting {
      waiters: Vec<Reply>,
      disconnect_waiters: Vec<Reply>,
      disconnect_queued: bool,
      /// The session was connected before and consumers still see it so.
      reconnect: bool,
   },
   Connected {
      /// A link probe is in flight.
      probing: bool,
   },
}

impl Slot {
   const fn connecting(reconnect: bool) -> Self {
      Self::Connecting {
         waiters: Vec::new(),
         disconnect_waiters: Vec::new(),
         disconnect_queued: false,
         reconnect,
      }
   }

   const fn state(&self) -> LinkState {
      match self {
         Self::Discovered { .. } => LinkState::Discovered,
         Self::Connecting { .. } => LinkState::Connecting,
         Self::Connected { .. } => LinkState::Connected,
      }
   }
}

struct Entry {
   sensor: HeartRateSensor,
   slot: Slot,
}

impl Entry {
   fn retag(&mut self, slot: Slot) {
      self.sensor.set_state(slot.state());
      self.slot = slot;
   }
}

/// Outcome of feeding an advertisement to the registry.
#[derive(Debug)]
pub enum Observation {
   /// First sighting; a new session was created.
   Discovered(HeartRateSensor),
   Refreshed,
   /// A connected sensor is advertising again; its link should be checked.
   Probe(HeartRateSensor),
   Ignored,
}

/// Outcome of a disconnect request.
#[derive(Debug)]
pub enum Detach {
   Removed(HeartRateSensor, Option<Reply>),
   /// Applied once the in-flight connect resolves.
   Queued,
   Absent(Option<Reply>),
}

/// A connect attempt that has resolved.
#[derive(Debug)]
pub struct Settled {
   pub sensor: HeartRateSensor,
   pub waiters: Vec<Reply>,
   pub disconnect_waiters: Vec<Reply>,
   pub disconnect_queued: bool,
   /// The attempt was re-establishing a link consumers saw as connected.
   pub reconnect: bool,
}

/// A session removed wholesale during cleanup.
#[derive(Debug)]
pub struct Evicted {
   pub sensor: HeartRateSensor,
   pub state: LinkState,
   pub waiters: Vec<Reply>,
}

#[derive(Default)]
pub struct Registry {
   entries: HashMap<DeviceId, Entry>,
}

impl Registry {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn len(&self) -> usize {
      self.entries.len()
   }

   pub fn is_empty(&self) -> bool {
      self.entries.is_empty()
   }

   pub fn get(&self, id: &DeviceId) -> Option<HeartRateSensor> {
      self.entries.get(id).map(|e| e.sensor.clone())
   }

   pub fn state(&self, id: &DeviceId) -> Option<LinkState> {
      self.entries.get(id).map(|e| e.slot.state())
   }

   pub fn sensors(&self) -> Vec<HeartRateSensor> {
      self.entries.values().map(|e| e.sensor.clone()).collect()
   }

   pub fn in_state(&self, state: LinkState) -> Vec<HeartRateSensor> {
      self
         .entries
         .values()
         .filter(|e| e.slot.state() == state)
         .map(|e| e.sensor.clone())
         .collect()
   }

   pub fn count(&self, state: LinkState) -> usize {
      self
         .entries
         .values()
         .filter(|e| e.slot.state() == state)
         .count()
   }

   /// Applies an advertisement.
   pub fn observe(
      &mut self,
      ad: &Advertisement,
      now: Instant,
      settings: &SessionSettings,
   ) -> Observation {
      let Some(entry) = self.entries.get_mut(&ad.id) else {
         if !ad.connectable {
            return Observation::Ignored;
         }
         let sensor = HeartRateSensor::new(
            ad.peripheral.clone(),
            ad.local_name.clone(),
            settings.clone(),
         );
         info!("Discovered device: {} ({})", sensor.name(), ad.id);
         self.entries.insert(
            ad.id.clone(),
            Entry {
               sensor: sensor.clone(),
               slot: Slot::Discovered { last_seen: now },
            },
         );
         return Observation::Discovered(sensor);
      };

      match &mut entry.slot {
         Slot::Discovered { last_seen } => {
            *last_seen = now;
            if let Some(name) = &ad.local_name
               && entry.sensor.update_name(name)
            {
               debug!("{}: advertised name is now {name}", ad.id);
            }
            Observation::Refreshed
         },
         Slot::Connected { probing } if !*probing => {
            *probing = true;
            Observation::Probe(entry.sensor.clone())
         },
         Slot::Connected { .. } | Slot::Connecting { .. } => Observation::Ignored,
      }
   }

   /// Resolves a link probe. Returns the sensor if it must be reconnected.
   pub fn probe_finished(&mut self, id: &DeviceId, alive: bool) -> Option<HeartRateSensor> {
      let entry = self.entries.get_mut(id)?;
      let Slot::Connected { probing } = &mut entry.slot else {
         return None;
      };
      *probing = false;
      if alive {
         return None;
      }
      info!("{id}: link dropped without notice, reconnecting");
      entry.retag(Slot::connecting(true));
      Some(entry.sensor.clone())
   }

   /// Moves a discovered sensor into the connecting phase.
   ///
   /// Fails without touching the registry unless `id` is discovered.
   pub fn begin_connect(&mut self, id: &DeviceId) -> Result<HeartRateSensor> {
      let entry = self
         .entries
         .get_mut(id)
         .ok_or_else(|| HrmError::DeviceNotFound(id.clone()))?;
      match entry.slot {
         Slot::Discovered { .. } => {},
         Slot::Connecting { .. } => return Err(HrmError::AlreadyConnecting),
         Slot::Connected { .. } => return Err(HrmError::DeviceNotFound(id.clone())),
      }
      entry.retag(Slot::connecting(false));
      Ok(entry.sensor.clone())
   }

   /// Registers a caller to be told how the in-flight connect ends.
   pub fn await_connect(&mut self, id: &DeviceId, reply: Reply) {
      match self.entries.get_mut(id).map(|e| &mut e.slot) {
         Some(Slot::Connecting { waiters, .. }) => waiters.push(reply),
         _ => {
            let _ = reply.send(Err(HrmError::DeviceNotFound(id.clone())));
         },
      }
   }

   /// Resolves an in-flight connect.
   ///
   /// Success promotes the entry to connected; failure discards it.
   pub fn finish_connect(&mut self, id: &DeviceId, success: bool) -> Option<Settled> {
      let entry = self.entries.get_mut(id)?;
      if !matches!(entry.slot, Slot::Connecting { .. }) {
         return None;
      }
      let previous = mem::replace(&mut entry.slot, Slot::Connected { probing: false });
      let sensor = entry.sensor.clone();
      if success {
         sensor.set_state(LinkState::Connected);
      } else {
         self.entries.remove(id);
         sensor.set_state(LinkState::Disconnected);
      }

      let Slot::Connecting {
         waiters,
         disconnect_waiters,
         disconnect_queued,
         reconnect,
      } = previous
      else {
         return None;
      };
      Some(Settled {
         sensor,
         waiters,
         disconnect_waiters,
         disconnect_queued,
         reconnect,
      })
   }

   /// Removes a connected sensor, or queues the request if it is connecting.
   pub fn request_disconnect(&mut self, id: &DeviceId, reply: Option<Reply>) -> Detach {
      match self.entries.get_mut(id).map(|e| &mut e.slot) {
         Some(Slot::Connected { .. }) => {},
         Some(Slot::Connecting {
            disconnect_waiters,
            disconnect_queued,
            ..
         }) => {
            *disconnect_queued = true;
            disconnect_waiters.extend(reply);
            return Detach::Queued;
         },
         Some(Slot::Discovered { .. }) | None => return Detach::Absent(reply),
      }
      match self.entries.remove(id) {
         Some(entry) => {
            entry.sensor.set_state(LinkState::Disconnected);
            Detach::Removed(entry.sensor, reply)
         },
         None => Detach::Absent(reply),
      }
   }

   /// Removes every discovered sensor whose last sighting matches `stale`.
   pub fn remove_discovered_if(&mut self, stale: impl Fn(Instant) -> bool) -> Vec<HeartRateSensor> {
      let ids: Vec<DeviceId> = self
         .entries
         .iter()
         .filter(|(_, e)| matches!(e.slot, Slot::Discovered { last_seen } if stale(last_seen)))
         .map(|(id, _)| id.clone())
         .collect();
      ids.into_iter()
         .filter_map(|id| self.entries.remove(&id))
         .map(|e| {
            e.sensor.set_state(LinkState::Disconnected);
            e.sensor
         })
         .collect()
   }

   /// Re-registers a sensor that was connected before a suspend.
   ///
   /// Returns false if the id is already known again.
   pub fn restore(&mut self, sensor: HeartRateSensor) -> bool {
      if self.entries.contains_key(sensor.id()) {
         return false;
      }
      sensor.set_state(LinkState::Connecting);
      self.entries.insert(
         sensor.id().clone(),
         Entry {
            sensor,
            slot: Slot::connecting(false),
         },
      );
      true
   }

   /// Empties the registry.
   pub fn drain(&mut self) -> Vec<Evicted> {
      self
         .entries
         .drain()
         .map(|(_, entry)| {
            let state = entry.slot.state();
            let mut waiters = Vec::new();
            if let Slot::Connecting {
               waiters: w,
               disconnect_waiters,
               ..
            } = entry.slot
            {
               waiters.extend(w);
               waiters.extend(disconnect_waiters);
            }
            entry.sensor.set_state(LinkState::Disconnected);
            Evicted {
               sensor: entry.sensor,
               state,
               waiters,
            }
         })
         .collect()
   }
}
