//! Stored entry type.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// A stored value with its expiration bookkeeping.
///
/// All timestamps are Unix epoch milliseconds. An entry with no `expires_at`
/// never expires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
  pub key: String,
  pub data: T,
  pub created_at: i64,
  /// Time-to-live in milliseconds
  #[serde(default)]
  pub ttl: Option<i64>,
  #[serde(default)]
  pub expires_at: Option<i64>,
}

/// An entry as the storage backends see it.
pub type RawEntry = CacheEntry<Value>;

impl<T> CacheEntry<T> {
  pub fn new(key: impl Into<String>, data: T, created_at: i64, ttl: Option<Duration>) -> Self {
    let ttl = ttl.map(|ttl| i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
    Self {
      key: key.into(),
      data,
      created_at,
      ttl,
      expires_at: ttl.map(|ttl| created_at.saturating_add(ttl)),
    }
  }

  /// An entry is readable only while `now < expires_at`.
  pub fn is_expired_at(&self, now: i64) -> bool {
    matches!(self.expires_at, Some(expires_at) if now >= expires_at)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_expiry_boundary() {
    let entry = CacheEntry::new("k", 1, 1_000, Some(Duration::from_millis(500)));
    assert_eq!(entry.expires_at, Some(1_500));
    assert!(!entry.is_expired_at(1_499));
    assert!(entry.is_expired_at(1_500));
  }

  #[test]
  fn test_no_ttl_never_expires() {
    let entry = CacheEntry::new("k", 1, 1_000, None);
    assert!(entry.expires_at.is_none());
    assert!(!entry.is_expired_at(i64::MAX));
  }
}
