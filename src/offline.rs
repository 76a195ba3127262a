//! The offline layer as one service.
//!
//! Builds every component from a [`Config`], owns the background tasks and
//! wires the two data flows together:
//!
//! - reads go cache first, then the network, and are written back with the
//!   domain TTL
//! - mutations are queued for sync and invalidate the cached domains they affect

use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheDomain, CacheManager, CacheResult, CacheScope};
use crate::clock::{SharedClock, SystemClock};
use crate::config::Config;
use crate::fetch::{FetchOptions, ReqwestTransport, SmartFetch, Transport};
use crate::network::NetworkMonitor;
use crate::store::KvStore;
use crate::sync::{EntityKind, HttpRemote, OperationType, RemoteService, SyncEngine, SyncStatus};

/// Cached domains made stale by a mutation of `entity`.
pub fn affected_domains(entity: EntityKind) -> &'static [CacheDomain] {
  match entity {
    EntityKind::Post | EntityKind::Comment => &[CacheDomain::Feed],
    EntityKind::Like => &[CacheDomain::Feed, CacheDomain::Reels],
    EntityKind::Reaction => &[CacheDomain::Feed, CacheDomain::Messages],
    EntityKind::Message => &[CacheDomain::Messages, CacheDomain::Conversations],
    EntityKind::Friend => &[CacheDomain::Friends],
  }
}

pub struct OfflineLayer {
  config: Config,
  store: Arc<KvStore>,
  cache: Arc<CacheManager>,
  network: NetworkMonitor,
  sync: SyncEngine,
  fetch: SmartFetch,
  tasks: Vec<JoinHandle<()>>,
}

impl OfflineLayer {
  /// Build the layer against the configured database and backend and sweep
  /// expired entries.
  ///
  /// Nothing is sent to the backend until a drain is started. Long-running
  /// hosts follow up with [`OfflineLayer::spawn_background`].
  pub async fn start(config: Config) -> Result<Self> {
    let clock: SharedClock = Arc::new(SystemClock);
    let store = Arc::new(KvStore::open(&config.storage, clock));
    let network = NetworkMonitor::from_config(&config.network);

    let token = Config::api_token();
    if token.is_none() {
      debug!("FEEDSYNC_API_TOKEN not set; sending unauthenticated requests");
    }
    let remote = Arc::new(HttpRemote::new(
      &config.remote,
      token.clone(),
      config.sync.item_timeout(),
    )?);
    let transport = Arc::new(ReqwestTransport::new(token)?);

    Ok(Self::with_parts(config, store, network, remote, transport))
  }

  /// Assemble the layer from explicit parts and sweep expired entries. No
  /// background task is started and nothing is sent.
  pub fn with_parts(
    config: Config,
    store: Arc<KvStore>,
    network: NetworkMonitor,
    remote: Arc<dyn RemoteService>,
    transport: Arc<dyn Transport>,
  ) -> Self {
    let cache = Arc::new(CacheManager::new(store.clone(), config.cache.clone()));
    let sync = SyncEngine::new(store.clone(), remote, network.clone(), config.sync.clone());
    let fetch = SmartFetch::new(transport, network.clone(), config.fetch.clone());

    let removed = store.cleanup();
    info!(removed, backend = store.backend_name(), "store ready");

    Self {
      config,
      store,
      cache,
      network,
      sync,
      fetch,
      tasks: Vec::new(),
    }
  }

  /// Periodic store sweep, cache sweep, reachability probe, reconnect drain
  /// and a first drain of whatever is already queued.
  pub fn spawn_background(&mut self) {
    self
      .tasks
      .push(self.store.spawn_cleanup(self.config.storage.cleanup_interval()));
    self
      .tasks
      .push(self.cache.spawn_cleanup(self.config.cache.cleanup_interval()));
    if let Some(probe) = self
      .network
      .spawn_probe_loop(self.config.network.probe_interval())
    {
      self.tasks.push(probe);
    }
    self.tasks.push(self.sync.spawn_network_listener());

    if self.network.is_online() && !self.sync.queue_items().is_empty() {
      let sync = self.sync.clone();
      self.tasks.push(tokio::spawn(async move {
        sync.start_sync().await;
      }));
    }
  }

  /// Cache-first read of `url` into `domain`/`scope`.
  ///
  /// Scoped domains read without a scope are keyed by the URL. A miss while
  /// offline is an error; nothing is fetched.
  pub async fn cached_read<T>(
    &self,
    domain: CacheDomain,
    scope: Option<&str>,
    url: &str,
  ) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned,
  {
    let url_scope = match scope {
      None if domain.is_scoped() => Some(CacheScope::from_url(url)),
      _ => None,
    };
    let scope = url_scope.as_deref().or(scope);

    self
      .cache
      .get_or_fetch(domain, scope, move || async move {
        if !self.network.is_online() {
          return Err(eyre!("Offline and no cached {} data", domain));
        }
        let options = FetchOptions {
          batchable: true,
          ..FetchOptions::default()
        };
        Ok(self.fetch.get_json::<T>(url, options).await?)
      })
      .await
  }

  /// Queue a local mutation and invalidate the domains it makes stale.
  ///
  /// Messages carrying a `chat_id` only invalidate that chat.
  pub fn mutate(
    &self,
    entity: EntityKind,
    entity_id: &str,
    op: OperationType,
    data: Value,
  ) -> String {
    let chat_id = data
      .get("chat_id")
      .and_then(Value::as_str)
      .map(str::to_string);
    let item_id = self.sync.queue_change(entity, entity_id, op, data);

    for domain in affected_domains(entity) {
      let scope = match domain {
        CacheDomain::Messages => chat_id.as_deref(),
        _ => None,
      };
      self.cache.invalidate(*domain, scope);
    }
    item_id
  }

  pub fn status(&self) -> SyncStatus {
    self.sync.status()
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn store(&self) -> &Arc<KvStore> {
    &self.store
  }

  pub fn cache(&self) -> &Arc<CacheManager> {
    &self.cache
  }

  pub fn network(&self) -> &NetworkMonitor {
    &self.network
  }

  pub fn sync(&self) -> &SyncEngine {
    &self.sync
  }

  pub fn fetch(&self) -> &SmartFetch {
    &self.fetch
  }

  /// Let running and triggered drains settle, then stop background tasks and persist
  /// pending cache metadata.
  ///
  /// Waits at most one item timeout.
  pub async fn shutdown(self) {
    if tokio::time::timeout(self.config.sync.item_timeout(), self.sync.settle())
      .await
      .is_err()
    {
      warn!("drain still running at shutdown; undelivered items stay queued");
    }
    info!("offline layer shutting down");
  }
}

impl Drop for OfflineLayer {
  fn drop(&mut self) {
    for task in self.tasks.drain(..) {
      task.abort();
    }
    self.cache.flush();
  }
}
