//! Access metadata for cached entries.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::domain::CacheDomain;

/// Bookkeeping for one cache key, used for statistics and eviction.
///
/// Timestamps and `ttl` are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
  pub key: String,
  pub domain: CacheDomain,
  pub created_at: i64,
  pub updated_at: i64,
  pub ttl: Option<i64>,
  pub expires_at: Option<i64>,
  pub access_count: u64,
  pub last_access_at: Option<i64>,
}

impl CacheMetadata {
  pub fn is_expired_at(&self, now: i64) -> bool {
    matches!(self.expires_at, Some(expires_at) if now >= expires_at)
  }
}

/// In-memory index of metadata, keyed by store key.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MetadataIndex {
  entries: HashMap<String, CacheMetadata>,
}

impl MetadataIndex {
  /// Record a write to `key`, keeping access history across rewrites.
  pub fn record_write(
    &mut self,
    key: &str,
    domain: CacheDomain,
    now: i64,
    ttl: Option<i64>,
    expires_at: Option<i64>,
  ) {
    self
      .entries
      .entry(key.to_string())
      .and_modify(|meta| {
        meta.updated_at = now;
        meta.ttl = ttl;
        meta.expires_at = expires_at;
      })
      .or_insert_with(|| CacheMetadata {
        key: key.to_string(),
        domain,
        created_at: now,
        updated_at: now,
        ttl,
        expires_at,
        access_count: 0,
        last_access_at: None,
      });
  }

  /// Record a cache hit. Keys written before the index existed are adopted.
  pub fn record_hit(
    &mut self,
    key: &str,
    domain: CacheDomain,
    now: i64,
    created_at: i64,
    ttl: Option<i64>,
    expires_at: Option<i64>,
  ) {
    let meta = self
      .entries
      .entry(key.to_string())
      .or_insert_with(|| CacheMetadata {
        key: key.to_string(),
        domain,
        created_at,
        updated_at: created_at,
        ttl,
        expires_at,
        access_count: 0,
        last_access_at: None,
      });
    meta.access_count += 1;
    meta.last_access_at = Some(now);
  }

  pub fn get(&self, key: &str) -> Option<&CacheMetadata> {
    self.entries.get(key)
  }

  pub fn remove(&mut self, key: &str) -> Option<CacheMetadata> {
    self.entries.remove(key)
  }

  /// Remove every record whose key satisfies `pred`, returning the removed keys.
  pub fn remove_where(&mut self, mut pred: impl FnMut(&CacheMetadata) -> bool) -> Vec<String> {
    let keys: Vec<String> = self
      .entries
      .values()
      .filter(|meta| pred(meta))
      .map(|meta| meta.key.clone())
      .collect();
    for key in &keys {
      self.entries.remove(key);
    }
    keys
  }

  pub fn clear(&mut self) {
    self.entries.clear();
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn values(&self) -> impl Iterator<Item = &CacheMetadata> {
    self.entries.values()
  }
}
