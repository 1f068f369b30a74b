//! Time source shared by sources and windows.
//!
//! Nodes never read the system time directly. The engine context carries an
//! `Arc<dyn Clock>`, so tests can run under tokio's paused time and get reproducible
//! timestamps and window ranges.

use chrono::Utc;
use std::sync::Arc;
use tokio::time::Instant;

/// Wall clock in epoch milliseconds.
pub trait Clock: Send + Sync {
  /// Current time in milliseconds since the Unix epoch.
  fn now_ms(&self) -> i64;
}

/// Shared clock handle.
pub type ClockRef = Arc<dyn Clock>;

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now_ms(&self) -> i64 {
    Utc::now().timestamp_millis()
  }
}

/// A clock that starts at a fixed wall time and advances with `tokio::time`.
///
/// Under `#[tokio::test(start_paused = true)]` it only moves when the runtime
/// auto-advances or `tokio::time::advance` is called.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
  base_ms: i64,
  anchor: Instant,
}

impl TokioClock {
  /// Anchors the clock at `base_ms`.
  pub fn starting_at(base_ms: i64) -> Self {
    Self {
      base_ms,
      anchor: Instant::now(),
    }
  }

  /// Anchors the clock at the current system time.
  pub fn new() -> Self {
    Self::starting_at(Utc::now().timestamp_millis())
  }
}

impl Default for TokioClock {
  fn default() -> Self {
    Self::new()
  }
}

impl Clock for TokioClock {
  fn now_ms(&self) -> i64 {
    self.base_ms + self.anchor.elapsed().as_millis() as i64
  }
}
