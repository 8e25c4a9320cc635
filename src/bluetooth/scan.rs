//! Scan controller state.
//!
//! Tracks whether a scan is running, whether one was ever asked for, and
//! whether a start attempt is in flight. The manager owns the controller and
//! performs the actual radio calls based on what it returns.

use std::mem;

use log::debug;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanController {
   scanning: bool,
   /// Sticky: once set, power-on and wake resume scanning.
   requested: bool,
   pending: bool,
   /// A stop arrived while a start was in flight.
   stop_after_start: bool,
}

impl ScanController {
   pub const fn new() -> Self {
      Self {
         scanning: false,
         requested: false,
         pending: false,
         stop_after_start: false,
      }
   }

   pub const fn is_scanning(&self) -> bool {
      self.scanning
   }

   pub const fn is_requested(&self) -> bool {
      self.requested
   }

   pub const fn is_pending(&self) -> bool {
      self.pending
   }

   /// Records a scan request. Returns true if a start should be issued.
   pub fn request(&mut self) -> bool {
      self.requested = true;
      self.stop_after_start = false;
      self.try_begin()
   }

   /// Returns true if a start should be issued now, marking it pending.
   pub fn try_begin(&mut self) -> bool {
      if self.scanning || !self.requested || self.pending {
         debug!(
            "Scan start skipped (scanning={}, requested={}, pending={})",
            self.scanning, self.requested, self.pending
         );
         return false;
      }
      self.pending = true;
      true
   }

   /// Marks the in-flight start, if any, to be undone once it lands.
   pub fn cancel_pending(&mut self) {
      if self.pending {
         self.stop_after_start = true;
      }
   }

   /// Resolves a pending start. Returns true if the fresh scan must be
   /// stopped right away.
   pub fn finish_start(&mut self, started: bool) -> bool {
      self.pending = false;
      if started {
         self.scanning = true;
      }
      mem::take(&mut self.stop_after_start) && started
   }

   /// Returns true if a stop should be issued, marking scanning as off.
   pub fn begin_stop(&mut self) -> bool {
      if !self.scanning {
         return false;
      }
      self.scanning = false;
      true
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_start_requires_request() {
      let mut scan = ScanController::new();
      assert!(!scan.try_begin());
      assert!(scan.request());
      assert!(scan.is_pending());
   }

   #[test]
   fn test_only_one_start_in_flight() {
      let mut scan = ScanController::new();
      assert!(scan.request());
      assert!(!scan.request());
      assert!(!scan.try_begin());

      scan.finish_start(true);
      assert!(scan.is_scanning());
      assert!(!scan.is_pending());
      assert!(!scan.request());
   }

   #[test]
   fn test_failed_start_clears_pending_and_stays_requested() {
      let mut scan = ScanController::new();
      assert!(scan.request());
      scan.finish_start(false);
      assert!(!scan.is_scanning());
      assert!(!scan.is_pending());
      assert!(scan.is_requested());
      assert!(scan.try_begin());
   }

   #[test]
   fn test_stop_only_when_scanning() {
      let mut scan = ScanController::new();
      assert!(!scan.begin_stop());
      scan.request();
      scan.finish_start(true);
      assert!(scan.begin_stop());
      assert!(!scan.is_scanning());
      assert!(!scan.begin_stop());
      // The request survives a stop so power-on can resume
      assert!(scan.is_requested());
   }

   #[test]
   fn test_stop_while_starting_applies_after_start() {
      let mut scan = ScanController::new();
      assert!(scan.request());
      assert!(!scan.begin_stop());
      scan.cancel_pending();
      assert!(scan.finish_start(true));
      assert!(scan.begin_stop());

      // A fresh request overrides the earlier stop
      assert!(scan.request());
      scan.cancel_pending();
      assert!(!scan.request());
      assert!(!scan.finish_start(true));
      assert!(scan.is_scanning());
   }

   #[test]
   fn test_cancel_without_pending_start_is_ignored() {
      let mut scan = ScanController::new();
      scan.cancel_pending();
      assert!(scan.request());
      assert!(!scan.finish_start(true));
   }
}
