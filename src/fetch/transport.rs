use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use super::error::FetchError;

/// A completed HTTP response, whatever its status.
#[derive(Debug, Clone)]
pub struct FetchResponse {
  pub url: String,
  pub status: u16,
  pub body: Arc<[u8]>,
}

impl FetchResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
    serde_json::from_slice(&self.body).map_err(|e| FetchError::Decode {
      url: self.url.clone(),
      message: e.to_string(),
    })
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Performs a single GET. Timeouts and retries are layered on top.
pub trait Transport: Send + Sync {
  fn get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<FetchResponse, FetchError>>;
}

/// reqwest-backed transport. Gzip and deflate bodies are decoded transparently.
#[derive(Clone)]
pub struct ReqwestTransport {
  client: reqwest::Client,
  token: Option<String>,
}

impl ReqwestTransport {
  pub fn new(token: Option<String>) -> Result<Self> {
    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;
    Ok(Self { client, token })
  }

  async fn send(&self, url: &str) -> Result<FetchResponse, FetchError> {
    let transport_error = |e: reqwest::Error| FetchError::Transport {
      url: url.to_string(),
      message: e.to_string(),
    };

    let mut request = self.client.get(url);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    let response = request.send().await.map_err(transport_error)?;
    let status = response.status().as_u16();
    let body = response.bytes().await.map_err(transport_error)?;

    Ok(FetchResponse {
      url: url.to_string(),
      status,
      body: Arc::from(body.as_ref()),
    })
  }
}

impl Transport for ReqwestTransport {
  fn get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<FetchResponse, FetchError>> {
    Box::pin(self.send(url))
  }
}
