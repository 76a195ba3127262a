use chrono::{DateTime, Utc};
use serde::Serialize;

use super::conflict::ConflictStrategy;

/// Snapshot of the engine, derived on demand.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
  pub is_syncing: bool,
  pub queue_length: usize,
  /// Last drain that left the queue empty
  pub last_sync_time: Option<DateTime<Utc>>,
  pub is_offline: bool,
  /// Queued items never attempted yet
  pub pending_changes: usize,
  pub failed_count: usize,
  pub conflict_count: usize,
}

/// Summary of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
  pub attempted: usize,
  pub delivered: usize,
  pub retrying: usize,
  pub exhausted: usize,
  pub conflicts: usize,
  /// Connectivity was lost before every batch was sent
  pub aborted: bool,
  /// Another drain was already running
  pub skipped: bool,
}

impl DrainReport {
  pub(crate) fn skipped() -> Self {
    Self {
      skipped: true,
      ..Self::default()
    }
  }
}

/// Per-item state transitions, published for UI code.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
  Queued {
    item_id: String,
  },
  Delivered {
    item_id: String,
  },
  RetryScheduled {
    item_id: String,
    retry_count: u32,
    delay_ms: u64,
    error: String,
  },
  Exhausted {
    item_id: String,
    error: String,
  },
  Conflict {
    conflict_id: String,
    item_id: String,
  },
  ConflictResolved {
    conflict_id: String,
    item_id: String,
    kept: ConflictStrategy,
  },
  Discarded {
    item_id: String,
  },
  DrainFinished(DrainReport),
}
