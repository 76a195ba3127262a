use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheDomain;
use crate::db;
use crate::sync::EntityKind;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub storage: StorageConfig,
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  pub network: NetworkConfig,
  pub fetch: FetchConfig,
  pub remote: RemoteConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Database file (defaults to `<data dir>/feedsync/store.db`)
  pub path: Option<PathBuf>,
  pub cleanup_interval_secs: u64,
  /// Capacity of the in-memory fallback used when the database cannot be opened
  pub fallback_max_entries: usize,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      path: None,
      cleanup_interval_secs: 5 * 60,
      fallback_max_entries: 1000,
    }
  }
}

impl StorageConfig {
  pub fn resolved_path(&self) -> Result<PathBuf> {
    match &self.path {
      Some(path) => Ok(path.clone()),
      None => db::default_path(),
    }
  }

  pub fn cleanup_interval(&self) -> Duration {
    Duration::from_secs(self.cleanup_interval_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub cleanup_interval_secs: u64,
  /// Per-domain TTL overrides in seconds
  pub ttl_secs: BTreeMap<CacheDomain, u64>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      cleanup_interval_secs: 15 * 60,
      ttl_secs: BTreeMap::new(),
    }
  }
}

impl CacheConfig {
  pub fn cleanup_interval(&self) -> Duration {
    Duration::from_secs(self.cleanup_interval_secs)
  }

  /// TTL for `domain`, honouring overrides.
  pub fn ttl_for(&self, domain: CacheDomain) -> Duration {
    self
      .ttl_secs
      .get(&domain)
      .map(|secs| Duration::from_secs(*secs))
      .unwrap_or_else(|| domain.default_ttl())
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub batch_size: usize,
  pub max_retries: u32,
  pub retry_base_ms: u64,
  pub debounce_ms: u64,
  pub trailing_sync_secs: u64,
  /// Upper bound on a single remote call
  pub item_timeout_secs: u64,
  /// Entity types resolved automatically with last-write-wins
  pub auto_resolve: Vec<EntityKind>,
  /// Drop exhausted items older than this; unset keeps them until handled
  pub exhausted_max_age_secs: Option<u64>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      batch_size: 10,
      max_retries: 5,
      retry_base_ms: 1000,
      debounce_ms: 2000,
      trailing_sync_secs: 5,
      item_timeout_secs: 30,
      auto_resolve: EntityKind::ALL.to_vec(),
      exhausted_max_age_secs: None,
    }
  }
}

impl SyncConfig {
  pub fn retry_base(&self) -> Duration {
    Duration::from_millis(self.retry_base_ms)
  }

  pub fn trailing_sync(&self) -> Duration {
    Duration::from_secs(self.trailing_sync_secs)
  }

  pub fn item_timeout(&self) -> Duration {
    Duration::from_secs(self.item_timeout_secs)
  }

  pub fn exhausted_max_age(&self) -> Option<Duration> {
    self.exhausted_max_age_secs.map(Duration::from_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Initial state before any connectivity signal arrives
  pub assume_online: bool,
  /// URL probed for reachability; no probe when unset
  pub probe_url: Option<String>,
  pub probe_interval_secs: u64,
  pub probe_timeout_secs: u64,
  /// Round trips slower than this classify the link as slow
  pub slow_threshold_ms: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      assume_online: true,
      probe_url: None,
      probe_interval_secs: 30,
      probe_timeout_secs: 5,
      slow_threshold_ms: 1000,
    }
  }
}

impl NetworkConfig {
  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs)
  }

  pub fn probe_timeout(&self) -> Duration {
    Duration::from_secs(self.probe_timeout_secs)
  }

  pub fn slow_threshold(&self) -> Duration {
    Duration::from_millis(self.slow_threshold_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
  pub timeout_secs: u64,
  pub retries: u32,
  pub retry_base_ms: u64,
  /// Coalescing window for batchable requests on slow links
  pub batch_window_ms: u64,
}

impl Default for FetchConfig {
  fn default() -> Self {
    Self {
      timeout_secs: 30,
      retries: 3,
      retry_base_ms: 1000,
      batch_window_ms: 500,
    }
  }
}

impl FetchConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }

  pub fn retry_base(&self) -> Duration {
    Duration::from_millis(self.retry_base_ms)
  }

  pub fn batch_window(&self) -> Duration {
    Duration::from_millis(self.batch_window_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
  /// REST root of the backend data service
  pub base_url: String,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:54321/rest/v1".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./feedsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/feedsync/config.yaml
  ///
  /// Defaults are used when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("feedsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("feedsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }

  /// Get the backend API token from the environment, if set.
  ///
  /// Checks FEEDSYNC_API_TOKEN.
  pub fn api_token() -> Option<String> {
    std::env::var("FEEDSYNC_API_TOKEN")
      .ok()
      .filter(|token| !token.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.sync.batch_size, 10);
    assert_eq!(config.sync.max_retries, 5);
    assert_eq!(config.sync.debounce_ms, 2000);
    assert_eq!(config.fetch.timeout(), Duration::from_secs(30));
    assert_eq!(config.storage.cleanup_interval(), Duration::from_secs(300));
    assert_eq!(config.cache.cleanup_interval(), Duration::from_secs(900));
    assert_eq!(config.sync.auto_resolve.len(), EntityKind::ALL.len());
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      r#"
sync:
  batch_size: 3
  auto_resolve: [post, like]
  exhausted_max_age_secs: 86400
cache:
  ttl_secs:
    feed: 60
remote:
  base_url: https://example.supabase.co/rest/v1
"#,
    )
    .unwrap();

    assert_eq!(config.sync.batch_size, 3);
    assert_eq!(config.sync.max_retries, 5);
    assert_eq!(config.sync.auto_resolve, vec![EntityKind::Post, EntityKind::Like]);
    assert_eq!(
      config.sync.exhausted_max_age(),
      Some(Duration::from_secs(86400))
    );
    assert_eq!(config.cache.ttl_for(CacheDomain::Feed), Duration::from_secs(60));
    assert_eq!(
      config.cache.ttl_for(CacheDomain::Profile),
      CacheDomain::Profile.default_ttl()
    );
    assert_eq!(config.remote.base_url, "https://example.supabase.co/rest/v1");
  }

  #[test]
  fn test_explicit_missing_path_is_an_error() {
    let result = Config::load(Some(Path::new("/definitely/not/here.yaml")));
    assert!(result.is_err());
  }

  #[test]
  fn test_load_from_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "network:\n  slow_threshold_ms: 250\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.network.slow_threshold(), Duration::from_millis(250));
    assert!(config.network.assume_online);
  }
}
