//! Wall-clock abstraction used for TTLs, debounce windows and conflict timestamps.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Source of the current UTC time.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;

  /// Current time as Unix epoch milliseconds.
  fn now_millis(&self) -> i64 {
    self.now().timestamp_millis()
  }
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  millis: AtomicI64,
}

impl ManualClock {
  pub fn at_millis(millis: i64) -> Self {
    Self {
      millis: AtomicI64::new(millis),
    }
  }

  /// Move the clock forward.
  pub fn advance(&self, by: std::time::Duration) {
    let by = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
    self.millis.fetch_add(by, Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    Utc
      .timestamp_millis_opt(self.now_millis())
      .single()
      .unwrap_or_default()
  }

  fn now_millis(&self) -> i64 {
    self.millis.load(Ordering::SeqCst)
  }
}

/// Convert epoch milliseconds to a UTC timestamp, if representable.
pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
  Utc.timestamp_millis_opt(millis).single()
}
