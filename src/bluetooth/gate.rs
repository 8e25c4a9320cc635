//! Adapter readiness gate.
//!
//! A resettable latch that scan commands wait on until the adapter reports
//! it is powered on.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default)]
struct GateState {
   ready: bool,
   /// Number of times the gate has been opened.
   openings: u64,
}

/// Resettable one-shot signal for adapter readiness.
///
/// Cloning yields another handle to the same gate.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
   tx: Arc<watch::Sender<GateState>>,
}

impl Default for ReadinessGate {
   fn default() -> Self {
      Self::new()
   }
}

impl ReadinessGate {
   pub fn new() -> Self {
      let (tx, _) = watch::channel(GateState::default());
      Self { tx: Arc::new(tx) }
   }

   pub fn is_ready(&self) -> bool {
      self.tx.borrow().ready
   }

   /// Opens the gate, releasing every waiter registered so far.
   ///
   /// Returns false if it was already open.
   pub fn set_ready(&self) -> bool {
      self.tx.send_if_modified(|state| {
         if state.ready {
            return false;
         }
         state.ready = true;
         state.openings += 1;
         true
      })
   }

   /// Closes the gate. Later waiters block until the next [`set_ready`].
   ///
   /// [`set_ready`]: Self::set_ready
   pub fn reset(&self) {
      self.tx.send_if_modified(|state| {
         let was_ready = state.ready;
         state.ready = false;
         was_ready
      });
   }

   /// Suspends until the gate is open.
   pub async fn wait_ready(&self) {
      let mut rx = self.tx.subscribe();
      let registered_at = rx.borrow_and_update().openings;
      // The sender lives as long as `self`, so this cannot fail.
      let _ = rx
         .wait_for(|state| state.ready || state.openings > registered_at)
         .await;
   }
}

#[cfg(test)]
mod tests {
   use std::time::Duration;

   use tokio::time;

   use super::*;

   const SHORT: Duration = Duration::from_millis(50);

   #[tokio::test]
   async fn test_wait_blocks_until_ready() {
      let gate = ReadinessGate::new();
      assert!(!gate.is_ready());
      assert!(time::timeout(SHORT, gate.wait_ready()).await.is_err());

      let waiter = tokio::spawn({
         let gate = gate.clone();
         async move { gate.wait_ready().await }
      });
      tokio::task::yield_now().await;
      assert!(gate.set_ready());
      time::timeout(SHORT, waiter).await.unwrap().unwrap();
   }

   #[tokio::test]
   async fn test_ready_gate_returns_immediately() {
      let gate = ReadinessGate::new();
      gate.set_ready();
      assert!(!gate.set_ready());
      time::timeout(SHORT, gate.wait_ready()).await.unwrap();
      time::timeout(SHORT, gate.wait_ready()).await.unwrap();
   }

   #[tokio::test]
   async fn test_reset_blocks_new_waiters() {
      let gate = ReadinessGate::new();
      gate.set_ready();
      gate.wait_ready().await;

      gate.reset();
      assert!(!gate.is_ready());
      assert!(time::timeout(SHORT, gate.wait_ready()).await.is_err());

      gate.set_ready();
      time::timeout(SHORT, gate.wait_ready()).await.unwrap();
   }

   #[tokio::test]
   async fn test_waiter_released_even_if_reset_follows_immediately() {
      let gate = ReadinessGate::new();
      let waiter = tokio::spawn({
         let gate = gate.clone();
         async move { gate.wait_ready().await }
      });
      // Let the waiter register before the gate flaps
      time::sleep(Duration::from_millis(10)).await;
      gate.set_ready();
      gate.reset();
      time::timeout(SHORT, waiter).await.unwrap().unwrap();
      assert!(!gate.is_ready());
   }
}
