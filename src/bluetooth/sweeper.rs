//! Staleness sweeper for discovered sensors.

use std::time::Duration;

use log::info;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use crate::{bluetooth::registry::Registry, sensor::device::HeartRateSensor};

/// Default period between sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
/// Default age after which an unconnected sensor is dropped
pub const DEFAULT_DISCOVERED_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct Sweeper {
   period: Duration,
   timeout: Duration,
}

impl Default for Sweeper {
   fn default() -> Self {
      Self::new(DEFAULT_SWEEP_INTERVAL, DEFAULT_DISCOVERED_TIMEOUT)
   }
}

impl Sweeper {
   pub const fn new(period: Duration, timeout: Duration) -> Self {
      Self { period, timeout }
   }

   pub const fn timeout(&self) -> Duration {
      self.timeout
   }

   /// Ticker for the owning loop. The first tick fires after one period.
   pub fn interval(&self) -> Interval {
      let mut interval = time::interval_at(Instant::now() + self.period, self.period);
      interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
      interval
   }

   /// Removes discovered sensors not seen within the timeout.
   ///
   /// Connecting and connected entries are never touched.
   pub fn sweep(&self, registry: &mut Registry, now: Instant) -> Vec<HeartRateSensor> {
      let timeout = self.timeout;
      let lost = registry
         .remove_discovered_if(|last_seen| now.saturating_duration_since(last_seen) > timeout);
      for sensor in &lost {
         info!("Discovered device lost: {} ({})", sensor.name(), sensor.id());
      }
      lost
   }
}
