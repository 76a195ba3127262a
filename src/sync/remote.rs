//! Delivery of queued mutations to the backend.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::item::{OperationType, SyncQueueItem};
use crate::config::RemoteConfig;

/// Result of applying one mutation remotely. Transient failures are `Err`.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
  Applied,
  /// The remote copy diverged; `remote_data` is the server's version
  Conflict { remote_data: Value },
}

/// The backend data service, as seen by the sync engine.
pub trait RemoteService: Send + Sync {
  fn apply<'a>(&'a self, item: &'a SyncQueueItem) -> BoxFuture<'a, Result<RemoteOutcome>>;
}

/// REST implementation: `POST /<collection>`, `PATCH` and `DELETE /<collection>/<id>`.
///
/// A `409` carries the server copy and is reported as a conflict. Deleting
/// something that is already gone counts as applied.
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base_url: String,
  token: Option<String>,
}

impl HttpRemote {
  pub fn new(config: &RemoteConfig, token: Option<String>, timeout: Duration) -> Result<Self> {
    Url::parse(&config.base_url)
      .map_err(|e| eyre!("Invalid remote base URL {}: {}", config.base_url, e))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url: config.base_url.trim_end_matches('/').to_string(),
      token,
    })
  }

  fn endpoint(&self, item: &SyncQueueItem) -> Result<Url> {
    let mut url = Url::parse(&format!("{}/{}", self.base_url, item.entity.collection()))
      .map_err(|e| eyre!("Failed to build endpoint for {}: {}", item.id, e))?;

    if item.op != OperationType::Create {
      url
        .path_segments_mut()
        .map_err(|_| eyre!("Remote base URL cannot carry a path: {}", self.base_url))?
        .push(&item.entity_id);
    }
    Ok(url)
  }

  async fn send(&self, item: &SyncQueueItem) -> Result<RemoteOutcome> {
    let url = self.endpoint(item)?;
    let method = match item.op {
      OperationType::Create => Method::POST,
      OperationType::Update => Method::PATCH,
      OperationType::Delete => Method::DELETE,
    };

    let mut request = self
      .client
      .request(method.clone(), url.clone())
      .header("X-Client-Timestamp", item.timestamp.to_string());
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }
    if item.force {
      request = request.header("X-Force-Overwrite", "true");
    }
    if item.op != OperationType::Delete {
      request = request.json(&item.data);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("{} {} failed: {}", method, url, e))?;

    let status = response.status();
    if status.is_success() {
      return Ok(RemoteOutcome::Applied);
    }
    if status == StatusCode::NOT_FOUND && item.op == OperationType::Delete {
      return Ok(RemoteOutcome::Applied);
    }
    if status == StatusCode::CONFLICT {
      let remote_data = response.json::<Value>().await.unwrap_or(Value::Null);
      return Ok(RemoteOutcome::Conflict { remote_data });
    }

    let body = response.text().await.unwrap_or_default();
    Err(eyre!("{} {} returned {}: {}", method, url, status, body))
  }
}

impl RemoteService for HttpRemote {
  fn apply<'a>(&'a self, item: &'a SyncQueueItem) -> BoxFuture<'a, Result<RemoteOutcome>> {
    Box::pin(self.send(item))
  }
}
