//! Domain cache manager over the key/value store.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::domain::{CacheDomain, KEY_PREFIX};
use super::metadata::{CacheMetadata, MetadataIndex};
use super::result::CacheResult;
use crate::clock;
use crate::config::CacheConfig;
use crate::store::{CacheEntry, KvStore};

/// Store key of the serialized metadata index. Deliberately outside `cache-*`.
pub const INDEX_KEY: &str = "cache_index";

/// Aggregated view of the metadata index.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
  pub total_entries: usize,
  pub by_domain: BTreeMap<CacheDomain, usize>,
  pub oldest: Option<EntrySummary>,
  pub most_accessed: Option<EntrySummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntrySummary {
  pub key: String,
  pub domain: CacheDomain,
  pub created_at: DateTime<Utc>,
  pub access_count: u64,
}

impl From<&CacheMetadata> for EntrySummary {
  fn from(meta: &CacheMetadata) -> Self {
    Self {
      key: meta.key.clone(),
      domain: meta.domain,
      created_at: clock::from_millis(meta.created_at).unwrap_or_default(),
      access_count: meta.access_count,
    }
  }
}

/// Typed, per-domain cache with access metadata.
///
/// Owns every `cache-*` key in the store plus the metadata index. Reads of the
/// index are in-memory; changes are written through to the store, except hit
/// counters which are flushed by [`CacheManager::flush`] and the periodic sweep.
pub struct CacheManager {
  store: Arc<KvStore>,
  config: CacheConfig,
  index: Mutex<MetadataIndex>,
  /// Hit counters changed since the index was last persisted
  dirty: AtomicBool,
}

impl CacheManager {
  /// Create a manager, hydrating the metadata index from the store.
  pub fn new(store: Arc<KvStore>, config: CacheConfig) -> Self {
    let index = store.get::<MetadataIndex>(INDEX_KEY).unwrap_or_default();
    debug!(entries = index.len(), "cache metadata index loaded");

    Self {
      store,
      config,
      index: Mutex::new(index),
      dirty: AtomicBool::new(false),
    }
  }

  fn now(&self) -> i64 {
    self.store.clock().now_millis()
  }

  fn index(&self) -> MutexGuard<'_, MetadataIndex> {
    self.index.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn persist_index(&self, index: &MetadataIndex) {
    self.store.set(INDEX_KEY, index, None);
    self.dirty.store(false, Ordering::Release);
  }

  /// Persist pending hit counters.
  pub fn flush(&self) {
    if self.dirty.swap(false, Ordering::AcqRel) {
      let index = self.index();
      self.store.set(INDEX_KEY, &*index, None);
    }
  }

  /// TTL used for `domain` when the caller gives none.
  pub fn ttl_for(&self, domain: CacheDomain) -> Duration {
    self.config.ttl_for(domain)
  }

  /// Cache `data` under `domain`/`scope`.
  pub fn set<T: Serialize>(
    &self,
    domain: CacheDomain,
    scope: Option<&str>,
    data: &T,
    ttl: Option<Duration>,
  ) {
    let key = domain.key(scope);
    let ttl = ttl.unwrap_or_else(|| self.ttl_for(domain));
    self.store.set(&key, data, Some(ttl));

    let now = self.now();
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    let mut index = self.index();
    index.record_write(&key, domain, now, Some(ttl_ms), Some(now.saturating_add(ttl_ms)));
    self.persist_index(&index);
  }

  /// Read a live entry. Only hits touch the metadata.
  pub fn get<T: DeserializeOwned>(&self, domain: CacheDomain, scope: Option<&str>) -> Option<T> {
    self.get_entry(domain, scope).map(|entry| entry.data)
  }

  fn get_entry<T: DeserializeOwned>(
    &self,
    domain: CacheDomain,
    scope: Option<&str>,
  ) -> Option<CacheEntry<T>> {
    let key = domain.key(scope);
    let entry = self.store.get_entry::<T>(&key)?;

    let now = self.now();
    self
      .index()
      .record_hit(&key, domain, now, entry.created_at, entry.ttl, entry.expires_at);
    self.dirty.store(true, Ordering::Release);

    Some(entry)
  }

  /// Cache-first read.
  ///
  /// 1. Return a live entry if there is one
  /// 2. Otherwise run `fetcher`, cache its result with the domain TTL and return it
  pub async fn get_or_fetch<T, F, Fut>(
    &self,
    domain: CacheDomain,
    scope: Option<&str>,
    fetcher: F,
  ) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    if let Some(entry) = self.get_entry::<T>(domain, scope) {
      return Ok(CacheResult::from_cache(
        entry.data,
        clock::from_millis(entry.created_at),
      ));
    }

    let data = fetcher().await?;
    self.set(domain, scope, &data, None);
    Ok(CacheResult::from_network(data))
  }

  /// Drop cached data for `domain`, or only its `scope`. Returns the number of entries removed.
  pub fn invalidate(&self, domain: CacheDomain, scope: Option<&str>) -> usize {
    let prefix = domain.key_prefix();
    let exact = scope.map(|scope| domain.key(Some(scope)));

    let keys: Vec<String> = self
      .store
      .all_keys()
      .into_iter()
      .filter(|key| match &exact {
        Some(exact) => key == exact,
        None => key.starts_with(&prefix),
      })
      .collect();

    for key in &keys {
      self.store.remove(key);
    }

    let mut index = self.index();
    match &exact {
      Some(exact) => {
        index.remove(exact);
      }
      None => {
        index.remove_where(|meta| meta.domain == domain);
      }
    }
    self.persist_index(&index);

    info!(%domain, scope, removed = keys.len(), "cache invalidated");
    keys.len()
  }

  /// Drop every domain cache entry and all metadata.
  pub fn invalidate_all(&self) -> usize {
    let keys: Vec<String> = self
      .store
      .all_keys()
      .into_iter()
      .filter(|key| key.starts_with(KEY_PREFIX))
      .collect();

    for key in &keys {
      self.store.remove(key);
    }

    let mut index = self.index();
    index.clear();
    self.persist_index(&index);

    info!(removed = keys.len(), "all cache domains invalidated");
    keys.len()
  }

  /// Counts per domain, the oldest entry and the most accessed one.
  pub fn stats(&self) -> CacheStats {
    let index = self.index();

    let mut by_domain = BTreeMap::new();
    for meta in index.values() {
      *by_domain.entry(meta.domain).or_insert(0) += 1;
    }

    CacheStats {
      total_entries: index.len(),
      by_domain,
      oldest: index
        .values()
        .min_by_key(|meta| meta.created_at)
        .map(EntrySummary::from),
      most_accessed: index
        .values()
        .filter(|meta| meta.access_count > 0)
        .max_by_key(|meta| meta.access_count)
        .map(EntrySummary::from),
    }
  }

  /// Remove entries whose metadata has expired, returning how many were removed.
  pub fn cleanup_expired(&self) -> usize {
    let now = self.now();
    let mut index = self.index();
    let expired = index.remove_where(|meta| meta.is_expired_at(now));

    for key in &expired {
      self.store.remove(key);
    }

    if !expired.is_empty() || self.dirty.load(Ordering::Acquire) {
      self.persist_index(&index);
    }

    if !expired.is_empty() {
      info!(removed = expired.len(), "expired cache entries swept");
    }
    expired.len()
  }

  /// Run [`CacheManager::cleanup_expired`] every `period` until the task is aborted.
  pub fn spawn_cleanup(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
    let manager = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        manager.cleanup_expired();
      }
    })
  }

  // Per-domain convenience pairs.

  pub fn cache_feed<T: Serialize>(&self, data: &T, ttl: Option<Duration>) {
    self.set(CacheDomain::Feed, None, data, ttl)
  }

  pub fn cached_feed<T: DeserializeOwned>(&self) -> Option<T> {
    self.get(CacheDomain::Feed, None)
  }

  pub fn cache_reels<T: Serialize>(&self, data: &T, ttl: Option<Duration>) {
    self.set(CacheDomain::Reels, None, data, ttl)
  }

  pub fn cached_reels<T: DeserializeOwned>(&self) -> Option<T> {
    self.get(CacheDomain::Reels, None)
  }

  pub fn cache_messages<T: Serialize>(&self, chat_id: &str, data: &T, ttl: Option<Duration>) {
    self.set(CacheDomain::Messages, Some(chat_id), data, ttl)
  }

  pub fn cached_messages<T: DeserializeOwned>(&self, chat_id: &str) -> Option<T> {
    self.get(CacheDomain::Messages, Some(chat_id))
  }

  pub fn cache_conversations<T: Serialize>(&self, data: &T, ttl: Option<Duration>) {
    self.set(CacheDomain::Conversations, None, data, ttl)
  }

  pub fn cached_conversations<T: DeserializeOwned>(&self) -> Option<T> {
    self.get(CacheDomain::Conversations, None)
  }

  pub fn cache_profile<T: Serialize>(&self, user_id: &str, data: &T, ttl: Option<Duration>) {
    self.set(CacheDomain::Profile, Some(user_id), data, ttl)
  }

  pub fn cached_profile<T: DeserializeOwned>(&self, user_id: &str) -> Option<T> {
    self.get(CacheDomain::Profile, Some(user_id))
  }

  pub fn cache_friends<T: Serialize>(&self, data: &T, ttl: Option<Duration>) {
    self.set(CacheDomain::Friends, None, data, ttl)
  }

  pub fn cached_friends<T: DeserializeOwned>(&self) -> Option<T> {
    self.get(CacheDomain::Friends, None)
  }

  pub fn cache_topics<T: Serialize>(&self, data: &T, ttl: Option<Duration>) {
    self.set(CacheDomain::Topics, None, data, ttl)
  }

  pub fn cached_topics<T: DeserializeOwned>(&self) -> Option<T> {
    self.get(CacheDomain::Topics, None)
  }

  pub fn cache_notifications<T: Serialize>(&self, data: &T, ttl: Option<Duration>) {
    self.set(CacheDomain::Notifications, None, data, ttl)
  }

  pub fn cached_notifications<T: DeserializeOwned>(&self) -> Option<T> {
    self.get(CacheDomain::Notifications, None)
  }
}
