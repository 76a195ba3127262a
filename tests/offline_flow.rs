use color_eyre::Result;
use feedsync::cache::{CacheDomain, CacheResult, CacheSource};
use feedsync::clock::ManualClock;
use feedsync::config::NetworkConfig;
use feedsync::fetch::{FetchError, FetchResponse, Transport};
use feedsync::network::{NetworkMonitor, NetworkState};
use feedsync::store::KvStore;
use feedsync::sync::{EntityKind, OperationType, RemoteOutcome, RemoteService, SyncQueueItem};
use feedsync::{Config, OfflineLayer};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Default)]
struct RecordingRemote {
  delivered: Mutex<Vec<String>>,
}

impl RecordingRemote {
  fn delivered(&self) -> Vec<String> {
    self
      .delivered
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }
}

impl RemoteService for RecordingRemote {
  fn apply<'a>(&'a self, item: &'a SyncQueueItem) -> BoxFuture<'a, Result<RemoteOutcome>> {
    Box::pin(async move {
      self
        .delivered
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(item.id.clone());
      Ok(RemoteOutcome::Applied)
    })
  }
}

#[derive(Default)]
struct FeedTransport {
  calls: AtomicUsize,
}

impl Transport for FeedTransport {
  fn get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<FetchResponse, FetchError>> {
    Box::pin(async move {
      let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
      let body = serde_json::to_vec(&json!([{ "id": call }])).unwrap();
      Ok(FetchResponse {
        url: url.to_string(),
        status: 200,
        body: Arc::from(body),
      })
    })
  }
}

struct Harness {
  layer: OfflineLayer,
  clock: Arc<ManualClock>,
  remote: Arc<RecordingRemote>,
  transport: Arc<FeedTransport>,
}

fn harness(online: bool) -> Harness {
  let clock = Arc::new(ManualClock::at_millis(1_700_000_000_000));
  let store = Arc::new(KvStore::in_memory(clock.clone()));
  let network = NetworkMonitor::new(
    &NetworkConfig {
      assume_online: online,
      ..NetworkConfig::default()
    },
    None,
  );
  let remote = Arc::new(RecordingRemote::default());
  let transport = Arc::new(FeedTransport::default());
  let layer = OfflineLayer::with_parts(
    Config::default(),
    store,
    network,
    remote.clone(),
    transport.clone(),
  );
  Harness {
    layer,
    clock,
    remote,
    transport,
  }
}

#[tokio::test]
async fn test_like_while_offline_is_delivered_on_reconnect() {
  let h = harness(false);

  let item_id = h
    .layer
    .mutate(EntityKind::Like, "post-42", OperationType::Create, json!({ "post_id": "post-42" }));

  let status = h.layer.status();
  assert!(status.is_offline);
  assert_eq!(status.pending_changes, 1);

  // Nothing goes out while offline
  let report = h.layer.sync().start_sync().await;
  assert!(report.aborted);
  assert!(h.remote.delivered().is_empty());

  h.layer.network().report_connectivity(true).await;
  assert_eq!(h.layer.network().state(), NetworkState::Online);

  let report = h.layer.sync().start_sync().await;
  assert_eq!(report.delivered, 1);

  let status = h.layer.status();
  assert_eq!(status.pending_changes, 0);
  assert_eq!(status.queue_length, 0);
  assert!(status.last_sync_time.is_some());
  assert_eq!(h.remote.delivered(), vec![item_id]);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_drains_through_listener() {
  let mut h = harness(false);
  h.layer.spawn_background();

  h.layer
    .mutate(EntityKind::Post, "p1", OperationType::Create, json!({ "body": "hello" }));
  h.layer
    .mutate(EntityKind::Friend, "u7", OperationType::Delete, Value::Null);
  assert_eq!(h.layer.status().pending_changes, 2);

  h.layer.network().report_connectivity(true).await;
  tokio::time::sleep(Duration::from_secs(1)).await;

  assert_eq!(h.remote.delivered().len(), 2);
  assert_eq!(h.layer.status().queue_length, 0);
}

#[tokio::test]
async fn test_feed_is_served_from_cache_until_ttl() {
  let h = harness(true);
  let url = "https://api.example.com/feed";

  let first: CacheResult<Value> = h
    .layer
    .cached_read(CacheDomain::Feed, None, url)
    .await
    .unwrap();
  assert_eq!(first.source, CacheSource::Network);

  h.clock.advance(Duration::from_secs(29 * 60));
  let cached: CacheResult<Value> = h
    .layer
    .cached_read(CacheDomain::Feed, None, url)
    .await
    .unwrap();
  assert_eq!(cached.source, CacheSource::Cache);
  assert_eq!(cached.data, json!([{ "id": 1 }]));
  assert_eq!(h.transport.calls.load(Ordering::SeqCst), 1);

  h.clock.advance(Duration::from_secs(2 * 60));
  let refreshed: CacheResult<Value> = h
    .layer
    .cached_read(CacheDomain::Feed, None, url)
    .await
    .unwrap();
  assert_eq!(refreshed.source, CacheSource::Network);
  assert_eq!(refreshed.data, json!([{ "id": 2 }]));
  assert_eq!(h.transport.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_offline_read_serves_cache_and_misses_fail() {
  let h = harness(false);
  h.layer.cache().cache_feed(&json!([{ "id": "cached" }]), None);

  let feed: CacheResult<Value> = h
    .layer
    .cached_read(CacheDomain::Feed, None, "https://api.example.com/feed")
    .await
    .unwrap();
  assert_eq!(feed.data, json!([{ "id": "cached" }]));

  let reels: Result<CacheResult<Value>> = h
    .layer
    .cached_read(CacheDomain::Reels, None, "https://api.example.com/reels")
    .await;
  assert!(reels.is_err());
  assert_eq!(h.transport.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_drain_converges_for_many_items() {
  let h = harness(true);
  for i in 0..23 {
    h.layer.mutate(
      EntityKind::Comment,
      &format!("c{}", i),
      OperationType::Create,
      json!({ "body": i }),
    );
  }

  let report = h.layer.sync().start_sync().await;
  assert_eq!(report.attempted, 23);
  assert_eq!(report.delivered, 23);
  assert!(h.layer.sync().queue_items().is_empty());

  let second = h.layer.sync().start_sync().await;
  assert_eq!(second.attempted, 0);
  assert_eq!(h.remote.delivered().len(), 23);
}
