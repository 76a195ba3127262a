//! Reachability probes feeding the network monitor.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::time::{Duration, Instant};
use url::Url;

/// Something that can tell whether the backend is reachable.
///
/// A successful probe returns the measured round-trip time.
pub trait ReachabilityProbe: Send + Sync {
  fn probe(&self) -> BoxFuture<'_, Result<Duration>>;
}

/// Probe that sends `HEAD` to a fixed URL. Any HTTP response counts as reachable.
pub struct HttpProbe {
  client: reqwest::Client,
  url: Url,
}

impl HttpProbe {
  pub fn new(url: &str, timeout: Duration) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid probe URL {}: {}", url, e))?;
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build probe client: {}", e))?;

    Ok(Self { client, url })
  }
}

impl ReachabilityProbe for HttpProbe {
  fn probe(&self) -> BoxFuture<'_, Result<Duration>> {
    Box::pin(async move {
      let started = Instant::now();
      self
        .client
        .head(self.url.clone())
        .send()
        .await
        .map_err(|e| eyre!("Probe to {} failed: {}", self.url, e))?;
      Ok(started.elapsed())
    })
  }
}
