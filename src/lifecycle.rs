//! Lifecycle coordinator.
//!
//! Maps sleep, wake and termination triggers onto manager intents. Where the
//! triggers come from (process signals, a session manager, a test) is up to
//! the caller.

use futures::{Stream, StreamExt};
use log::{error, info};

use crate::{bluetooth::manager::MonitorManager, error::Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum LifecycleSignal {
   Suspend,
   Resume,
   Shutdown,
}

/// Applies `signals` to `manager` until a shutdown arrives or the stream
/// ends, then shuts the manager down.
///
/// A failed wake is reported and does not stop the loop.
pub async fn drive(
   manager: &MonitorManager,
   signals: impl Stream<Item = LifecycleSignal>,
) -> Result<()> {
   let mut signals = Box::pin(signals);
   while let Some(signal) = signals.next().await {
      info!("Lifecycle: {signal}");
      match signal {
         LifecycleSignal::Suspend => manager.suspend().await?,
         LifecycleSignal::Resume => {
            if let Err(e) = manager.wake().await {
               error!("Failed to resume after sleep: {e}");
            }
         },
         LifecycleSignal::Shutdown => break,
      }
   }
   info!("Shutting down monitor");
   manager.shutdown().await
}
