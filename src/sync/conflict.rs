//! Conflict records and resolution policies.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;

use super::item::SyncQueueItem;

/// A local mutation the remote rejected because its copy diverged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
  pub id: String,
  pub local_item: SyncQueueItem,
  pub remote_data: Value,
  /// When the conflict was detected, epoch milliseconds
  pub timestamp: i64,
}

impl ConflictRecord {
  pub fn new(local_item: SyncQueueItem, remote_data: Value, timestamp: i64) -> Self {
    Self {
      id: format!("conflict-{}", local_item.id),
      local_item,
      remote_data,
      timestamp,
    }
  }
}

/// Side chosen by a manual resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
  Local,
  Remote,
}

impl FromStr for ConflictStrategy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "local" => Ok(Self::Local),
      "remote" => Ok(Self::Remote),
      _ => Err(format!("unknown strategy: {} (expected local or remote)", s)),
    }
  }
}

/// Outcome of a resolver.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
  /// Re-send the local mutation, overwriting the remote copy
  KeepLocal,
  /// Accept the remote copy and drop the local mutation
  KeepRemote,
  /// Send this payload instead, overwriting the remote copy
  Merge(Value),
}

pub type Resolver = Arc<dyn Fn(&ConflictRecord) -> Resolution + Send + Sync>;

/// Strictly-newer local mutation wins; ties and unreadable remote timestamps go to the remote.
pub fn last_write_wins(conflict: &ConflictRecord) -> Resolution {
  match remote_timestamp(&conflict.remote_data) {
    Some(remote) if conflict.local_item.timestamp > remote => Resolution::KeepLocal,
    _ => Resolution::KeepRemote,
  }
}

/// `updated_at` of a remote record in epoch milliseconds.
///
/// Accepts a number, a numeric string, or an RFC 3339 timestamp.
pub fn remote_timestamp(remote: &Value) -> Option<i64> {
  match remote.get("updated_at")? {
    Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
    Value::String(s) => s
      .parse::<i64>()
      .ok()
      .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp_millis())),
    _ => None,
  }
}
