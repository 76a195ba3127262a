//! Persistent key/value store with per-entry expiration.
//!
//! This module provides a best-effort storage substrate that:
//! - Persists JSON entries in SQLite, or in a bounded in-memory map when the
//!   database cannot be opened
//! - Treats entries past `expires_at` as absent and deletes them when read
//! - Sweeps expired entries on demand and from a background task
//! - Never propagates storage faults: callers see a miss or a no-op

mod entry;
mod storage;

pub use entry::{CacheEntry, RawEntry};
pub use storage::{MemoryBackend, SqliteBackend, StorageBackend};

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::StorageConfig;

/// Key/value store shared by the cache manager and the sync engine.
pub struct KvStore {
  backend: Box<dyn StorageBackend>,
  degraded: bool,
  clock: SharedClock,
}

impl KvStore {
  /// Open the durable store described by `config`.
  ///
  /// Falls back to in-memory storage for the whole session if the database
  /// cannot be opened.
  pub fn open(config: &StorageConfig, clock: SharedClock) -> Self {
    let opened = config
      .resolved_path()
      .and_then(|path| SqliteBackend::open(&path));

    match opened {
      Ok(backend) => Self::with_backend(Box::new(backend), clock),
      Err(e) => {
        warn!(error = %e, "durable store unavailable, using in-memory fallback");
        Self {
          backend: Box::new(MemoryBackend::new(config.fallback_max_entries)),
          degraded: true,
          clock,
        }
      }
    }
  }

  /// Use an explicit backend.
  pub fn with_backend(backend: Box<dyn StorageBackend>, clock: SharedClock) -> Self {
    Self {
      backend,
      degraded: false,
      clock,
    }
  }

  /// A store backed by a private in-memory SQLite database, or the map
  /// fallback if even that fails.
  pub fn in_memory(clock: SharedClock) -> Self {
    match SqliteBackend::open_in_memory() {
      Ok(backend) => Self::with_backend(Box::new(backend), clock),
      Err(e) => {
        warn!(error = %e, "in-memory database unavailable, using map fallback");
        Self {
          backend: Box::new(MemoryBackend::new(StorageConfig::default().fallback_max_entries)),
          degraded: true,
          clock,
        }
      }
    }
  }

  /// Whether the store is running on the fallback backend.
  pub fn is_degraded(&self) -> bool {
    self.degraded
  }

  pub fn backend_name(&self) -> &'static str {
    self.backend.name()
  }

  pub fn clock(&self) -> &SharedClock {
    &self.clock
  }

  /// Insert or replace `key`. Failures are logged and dropped.
  pub fn set<T: Serialize>(&self, key: &str, data: &T, ttl: Option<Duration>) {
    let data = match serde_json::to_value(data) {
      Ok(data) => data,
      Err(e) => {
        warn!(key, error = %e, "failed to serialize value, not stored");
        return;
      }
    };

    let entry = RawEntry::new(key, data, self.clock.now_millis(), ttl);
    if let Err(e) = self.backend.put(&entry) {
      warn!(key, backend = self.backend.name(), error = %e, "store write failed");
    }
  }

  /// Get a live value, deleting it if it has expired.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    self.get_entry(key).map(|entry| entry.data)
  }

  /// Get a live entry with its bookkeeping.
  pub fn get_entry<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
    let entry = match self.backend.get(key) {
      Ok(entry) => entry?,
      Err(e) => {
        warn!(key, backend = self.backend.name(), error = %e, "store read failed");
        return None;
      }
    };

    if entry.is_expired_at(self.clock.now_millis()) {
      debug!(key, "entry expired on read");
      self.remove(key);
      return None;
    }

    let CacheEntry {
      key: entry_key,
      data,
      created_at,
      ttl,
      expires_at,
    } = entry;

    match serde_json::from_value(data) {
      Ok(data) => Some(CacheEntry {
        key: entry_key,
        data,
        created_at,
        ttl,
        expires_at,
      }),
      Err(e) => {
        warn!(key, error = %e, "stored value has unexpected shape, treating as miss");
        None
      }
    }
  }

  pub fn remove(&self, key: &str) {
    if let Err(e) = self.backend.delete(key) {
      warn!(key, backend = self.backend.name(), error = %e, "store delete failed");
    }
  }

  pub fn clear(&self) {
    if let Err(e) = self.backend.clear() {
      warn!(backend = self.backend.name(), error = %e, "store clear failed");
    }
  }

  /// Every stored key, including ones that have expired but not been swept.
  pub fn all_keys(&self) -> Vec<String> {
    self.backend.get_all_keys().unwrap_or_else(|e| {
      warn!(backend = self.backend.name(), error = %e, "store key listing failed");
      Vec::new()
    })
  }

  /// Live entries, optionally restricted to keys starting with `prefix`.
  ///
  /// Expired entries encountered along the way are deleted.
  pub fn all_entries(&self, prefix: Option<&str>) -> Vec<RawEntry> {
    let entries = match self.backend.get_all() {
      Ok(entries) => entries,
      Err(e) => {
        warn!(backend = self.backend.name(), error = %e, "store listing failed");
        return Vec::new();
      }
    };

    let now = self.clock.now_millis();
    entries
      .into_iter()
      .filter(|entry| prefix.map_or(true, |p| entry.key.starts_with(p)))
      .filter(|entry| {
        if entry.is_expired_at(now) {
          self.remove(&entry.key);
          false
        } else {
          true
        }
      })
      .collect()
  }

  /// Remove every expired entry, returning how many were removed.
  pub fn cleanup(&self) -> usize {
    match self.backend.delete_expired(self.clock.now_millis()) {
      Ok(removed) => {
        if removed > 0 {
          info!(removed, "expired store entries swept");
        }
        removed
      }
      Err(e) => {
        warn!(backend = self.backend.name(), error = %e, "store sweep failed");
        0
      }
    }
  }

  /// Run [`KvStore::cleanup`] every `period` until the task is aborted.
  pub fn spawn_cleanup(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
    let store = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      // The first tick completes immediately; startup sweeps are run by the caller
      ticker.tick().await;
      loop {
        ticker.tick().await;
        store.cleanup();
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use serde_json::json;
  use std::path::PathBuf;

  fn store_with_clock() -> (KvStore, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at_millis(0));
    (KvStore::in_memory(clock.clone()), clock)
  }

  #[test]
  fn test_get_before_and_after_ttl() {
    let (store, clock) = store_with_clock();
    store.set("k", &json!({"v": 1}), Some(Duration::from_secs(60)));

    clock.advance(Duration::from_millis(59_999));
    assert_eq!(store.get::<serde_json::Value>("k"), Some(json!({"v": 1})));

    clock.advance(Duration::from_millis(1));
    assert_eq!(store.get::<serde_json::Value>("k"), None);
    // Read-triggered eviction removed the row
    assert!(store.all_keys().is_empty());
  }

  #[test]
  fn test_entries_without_ttl_never_expire() {
    let (store, clock) = store_with_clock();
    store.set("forever", &"value", None);
    clock.advance(Duration::from_secs(365 * 24 * 3600));
    assert_eq!(store.get::<String>("forever").as_deref(), Some("value"));
  }

  #[test]
  fn test_cleanup_is_idempotent() {
    let (store, clock) = store_with_clock();
    store.set("short", &1, Some(Duration::from_secs(1)));
    store.set("long", &2, Some(Duration::from_secs(100)));
    store.set("none", &3, None);

    clock.advance(Duration::from_secs(10));
    assert_eq!(store.cleanup(), 1);
    assert_eq!(store.cleanup(), 0);
    assert_eq!(store.get::<i32>("long"), Some(2));
    assert_eq!(store.get::<i32>("none"), Some(3));
  }

  #[test]
  fn test_all_entries_filters_prefix_and_drops_expired() {
    let (store, clock) = store_with_clock();
    store.set("cache-feed-all", &1, Some(Duration::from_secs(1)));
    store.set("cache-reels-all", &2, None);
    store.set("sync-queue", &3, None);

    clock.advance(Duration::from_secs(5));
    let entries = store.all_entries(Some("cache-"));
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key, "cache-reels-all");
    assert!(!store.all_keys().contains(&"cache-feed-all".to_string()));
  }

  #[test]
  fn test_wrong_type_reads_as_miss() {
    let (store, _) = store_with_clock();
    store.set("k", &"text", None);
    assert_eq!(store.get::<u64>("k"), None);
  }

  #[test]
  fn test_remove_and_clear() {
    let (store, _) = store_with_clock();
    store.set("a", &1, None);
    store.set("b", &2, None);
    store.remove("a");
    assert_eq!(store.get::<i32>("a"), None);
    store.clear();
    assert!(store.all_keys().is_empty());
  }

  #[test]
  fn test_open_falls_back_when_path_unusable() {
    let dir = tempfile::tempdir().unwrap();
    // A regular file where a directory is expected makes the database unopenable
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"x").unwrap();

    let config = StorageConfig {
      path: Some(PathBuf::from(&blocker).join("store.db")),
      fallback_max_entries: 2,
      ..StorageConfig::default()
    };
    let store = KvStore::open(&config, Arc::new(ManualClock::at_millis(0)));

    assert!(store.is_degraded());
    assert_eq!(store.backend_name(), "memory");

    store.set("a", &1, None);
    store.set("b", &2, None);
    // Over quota: dropped without an error
    store.set("c", &3, None);
    assert_eq!(store.get::<i32>("a"), Some(1));
    assert_eq!(store.get::<i32>("c"), None);
  }

  #[test]
  fn test_memory_fallback_honours_ttl() {
    let clock = Arc::new(ManualClock::at_millis(0));
    let store = KvStore::with_backend(Box::new(MemoryBackend::new(10)), clock.clone());
    store.set("k", &1, Some(Duration::from_secs(1)));
    clock.advance(Duration::from_secs(2));
    assert_eq!(store.cleanup(), 1);
    assert_eq!(store.get::<i32>("k"), None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_background_sweep_runs_on_interval() {
    let clock = Arc::new(ManualClock::at_millis(0));
    let store = Arc::new(KvStore::in_memory(clock.clone()));
    store.set("k", &1, Some(Duration::from_secs(1)));
    clock.advance(Duration::from_secs(2));

    let handle = store.spawn_cleanup(Duration::from_secs(300));
    tokio::time::sleep(Duration::from_secs(301)).await;

    assert!(store.all_keys().is_empty());
    handle.abort();
  }
}
