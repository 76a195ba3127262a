use feedsync::config::{FetchConfig, NetworkConfig, RemoteConfig};
use feedsync::fetch::{FetchError, FetchOptions, ReqwestTransport, SmartFetch};
use feedsync::network::{HttpProbe, NetworkMonitor, ReachabilityProbe};
use feedsync::sync::{
  EntityKind, HttpRemote, OperationType, RemoteOutcome, RemoteService, SyncQueueItem,
};
use httpmock::Method::{DELETE, GET, HEAD, PATCH, POST};
use httpmock::MockServer;
use serde_json::{json, Value};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

const TOKEN: &str = "secret-token";

fn can_bind_localhost() -> bool {
  TcpListener::bind("127.0.0.1:0").is_ok()
}

fn remote(server: &MockServer) -> HttpRemote {
  let config = RemoteConfig {
    base_url: server.url("/rest/v1"),
  };
  HttpRemote::new(&config, Some(TOKEN.to_string()), Duration::from_secs(5)).unwrap()
}

fn item(entity: EntityKind, id: &str, op: OperationType, data: Value) -> SyncQueueItem {
  SyncQueueItem::new(entity, id, op, data, 1_700_000_000_000)
}

fn fetcher() -> SmartFetch {
  let network = NetworkMonitor::new(&NetworkConfig::default(), None);
  let transport = ReqwestTransport::new(Some(TOKEN.to_string())).unwrap();
  SmartFetch::new(Arc::new(transport), network, FetchConfig::default())
}

#[tokio::test]
async fn test_remote_create_and_update() {
  if !can_bind_localhost() {
    eprintln!("Skipping httpmock tests: cannot bind to localhost");
    return;
  }

  let server = MockServer::start_async().await;
  let remote = remote(&server);

  let create = server
    .mock_async(|when, then| {
      when
        .method(POST)
        .path("/rest/v1/posts")
        .header("authorization", format!("Bearer {}", TOKEN))
        .header("x-client-timestamp", "1700000000000")
        .json_body(json!({ "body": "hello" }));
      then.status(201).json_body(json!({ "id": "p1" }));
    })
    .await;

  let update = server
    .mock_async(|when, then| {
      when
        .method(PATCH)
        .path("/rest/v1/comments/c9")
        .header("x-force-overwrite", "true")
        .json_body(json!({ "body": "edited" }));
      then.status(204);
    })
    .await;

  let created = remote
    .apply(&item(
      EntityKind::Post,
      "p1",
      OperationType::Create,
      json!({ "body": "hello" }),
    ))
    .await
    .unwrap();
  assert_eq!(created, RemoteOutcome::Applied);

  let mut forced = item(
    EntityKind::Comment,
    "c9",
    OperationType::Update,
    json!({ "body": "edited" }),
  );
  forced.force = true;
  assert_eq!(remote.apply(&forced).await.unwrap(), RemoteOutcome::Applied);

  create.assert_async().await;
  update.assert_async().await;
}

#[tokio::test]
async fn test_remote_conflict_and_delete_semantics() {
  if !can_bind_localhost() {
    eprintln!("Skipping httpmock tests: cannot bind to localhost");
    return;
  }

  let server = MockServer::start_async().await;
  let remote = remote(&server);
  let server_copy = json!({ "id": "p2", "body": "theirs", "updated_at": 1_700_000_100_000i64 });

  let conflict = server
    .mock_async(|when, then| {
      when.method(PATCH).path("/rest/v1/posts/p2");
      then.status(409).json_body(server_copy.clone());
    })
    .await;
  let gone = server
    .mock_async(|when, then| {
      when.method(DELETE).path("/rest/v1/friends/u1");
      then.status(404);
    })
    .await;
  let broken = server
    .mock_async(|when, then| {
      when.method(POST).path("/rest/v1/likes");
      then.status(500).body("database unavailable");
    })
    .await;

  let outcome = remote
    .apply(&item(
      EntityKind::Post,
      "p2",
      OperationType::Update,
      json!({ "body": "mine" }),
    ))
    .await
    .unwrap();
  assert_eq!(
    outcome,
    RemoteOutcome::Conflict {
      remote_data: server_copy.clone()
    }
  );

  let deleted = remote
    .apply(&item(EntityKind::Friend, "u1", OperationType::Delete, Value::Null))
    .await
    .unwrap();
  assert_eq!(deleted, RemoteOutcome::Applied);

  let err = remote
    .apply(&item(
      EntityKind::Like,
      "p3",
      OperationType::Create,
      json!({ "post_id": "p3" }),
    ))
    .await
    .unwrap_err();
  assert!(err.to_string().contains("500"));

  conflict.assert_async().await;
  gone.assert_async().await;
  broken.assert_async().await;
}

#[tokio::test]
async fn test_smart_fetch_decodes_json() {
  if !can_bind_localhost() {
    eprintln!("Skipping httpmock tests: cannot bind to localhost");
    return;
  }

  let server = MockServer::start_async().await;
  let feed = server
    .mock_async(|when, then| {
      when
        .method(GET)
        .path("/feed")
        .header("authorization", format!("Bearer {}", TOKEN));
      then.status(200).json_body(json!([{ "id": 1 }, { "id": 2 }]));
    })
    .await;

  let posts: Value = fetcher()
    .get_json(&server.url("/feed"), FetchOptions::default())
    .await
    .unwrap();

  assert_eq!(posts, json!([{ "id": 1 }, { "id": 2 }]));
  feed.assert_async().await;
}

#[tokio::test]
async fn test_smart_fetch_does_not_retry_client_errors() {
  if !can_bind_localhost() {
    eprintln!("Skipping httpmock tests: cannot bind to localhost");
    return;
  }

  let server = MockServer::start_async().await;
  let missing = server
    .mock_async(|when, then| {
      when.method(GET).path("/profiles/ghost");
      then.status(404);
    })
    .await;

  let options = FetchOptions {
    retries: Some(3),
    ..FetchOptions::default()
  };
  let err = fetcher()
    .smart_fetch(&server.url("/profiles/ghost"), options)
    .await
    .unwrap_err();

  assert!(matches!(err, FetchError::Status { status: 404, .. }));
  missing.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_http_probe_reports_reachability() {
  if !can_bind_localhost() {
    eprintln!("Skipping httpmock tests: cannot bind to localhost");
    return;
  }

  let server = MockServer::start_async().await;
  let health = server
    .mock_async(|when, then| {
      when.method(HEAD).path("/health");
      then.status(200);
    })
    .await;

  let probe = HttpProbe::new(&server.url("/health"), Duration::from_secs(5)).unwrap();
  assert!(probe.probe().await.is_ok());
  health.assert_async().await;
}
