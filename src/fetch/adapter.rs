//! Network-aware reads: adaptive timeout, retry with backoff, and request
//! coalescing on slow links.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::error::FetchError;
use super::media::adaptive_image_url;
use super::transport::{FetchResponse, Transport};
use crate::config::FetchConfig;
use crate::network::{NetworkMonitor, NetworkSpeed};

/// Advisory request priority; recorded in logs only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Priority {
  Low,
  #[default]
  Normal,
  High,
}

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
  pub priority: Priority,
  /// Rewrite image URLs for the current link speed
  pub adaptive_quality: bool,
  /// Share one request with identical ones inside the batch window on slow links
  pub batchable: bool,
  /// Per-attempt timeout; the configured default when unset. Doubled on slow links.
  pub timeout: Option<Duration>,
  /// Total attempts; the configured default when unset
  pub retries: Option<u32>,
}

impl FetchOptions {
  pub fn batchable() -> Self {
    Self {
      batchable: true,
      ..Self::default()
    }
  }
}

type SharedFetch = Shared<BoxFuture<'static, Result<FetchResponse, FetchError>>>;

struct Batch {
  generation: u64,
  future: SharedFetch,
}

/// Read adapter that adapts to the link reported by the [`NetworkMonitor`].
///
/// Cheap to clone; clones share the coalescing table.
#[derive(Clone)]
pub struct SmartFetch {
  inner: Arc<Inner>,
}

struct Inner {
  transport: Arc<dyn Transport>,
  network: NetworkMonitor,
  config: FetchConfig,
  batches: Mutex<HashMap<String, Batch>>,
  next_generation: AtomicU64,
}

impl SmartFetch {
  pub fn new(transport: Arc<dyn Transport>, network: NetworkMonitor, config: FetchConfig) -> Self {
    Self {
      inner: Arc::new(Inner {
        transport,
        network,
        config,
        batches: Mutex::new(HashMap::new()),
        next_generation: AtomicU64::new(0),
      }),
    }
  }

  /// Fetch `url`. Non-2xx responses are errors.
  pub async fn smart_fetch(
    &self,
    url: &str,
    options: FetchOptions,
  ) -> Result<FetchResponse, FetchError> {
    let speed = self.inner.network.speed();
    let url = if options.adaptive_quality {
      adaptive_image_url(url, speed, None)
    } else {
      url.to_string()
    };

    let mut timeout = options.timeout.unwrap_or_else(|| self.inner.config.timeout());
    if speed == NetworkSpeed::Slow {
      timeout = timeout.saturating_mul(2);
    }
    let attempts = options.retries.unwrap_or(self.inner.config.retries).max(1);

    debug!(%url, priority = ?options.priority, ?speed, "fetch");

    if options.batchable && speed == NetworkSpeed::Slow {
      return self.coalesced(url, timeout, attempts).await;
    }
    self.fetch_with_retry(&url, timeout, attempts).await
  }

  /// [`SmartFetch::smart_fetch`] and decode the body as JSON.
  pub async fn get_json<T: DeserializeOwned>(
    &self,
    url: &str,
    options: FetchOptions,
  ) -> Result<T, FetchError> {
    self.smart_fetch(url, options).await?.json()
  }

  /// Join the open batch for `url` or open a new one.
  ///
  /// The batch stays joinable for the batch window; then the shared fetch
  /// starts and its result goes to every waiter.
  fn coalesced(&self, url: String, timeout: Duration, attempts: u32) -> SharedFetch {
    let mut batches = self
      .inner
      .batches
      .lock()
      .unwrap_or_else(PoisonError::into_inner);

    if let Some(batch) = batches.get(&url) {
      debug!(%url, "joined pending batch");
      return batch.future.clone();
    }

    let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
    let window = self.inner.config.batch_window();
    let fetch = self.clone();
    let key = url.clone();
    let future: BoxFuture<'static, Result<FetchResponse, FetchError>> = Box::pin(async move {
      tokio::time::sleep(window).await;
      fetch.close_batch(&key, generation);
      fetch.fetch_with_retry(&key, timeout, attempts).await
    });

    let shared = future.shared();
    batches.insert(
      url,
      Batch {
        generation,
        future: shared.clone(),
      },
    );
    shared
  }

  fn close_batch(&self, url: &str, generation: u64) {
    let mut batches = self
      .inner
      .batches
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    if batches
      .get(url)
      .is_some_and(|batch| batch.generation == generation)
    {
      batches.remove(url);
    }
  }

  async fn fetch_with_retry(
    &self,
    url: &str,
    timeout: Duration,
    attempts: u32,
  ) -> Result<FetchResponse, FetchError> {
    let base = self.inner.config.retry_base();
    let mut attempt = 0;
    loop {
      match self.fetch_once(url, timeout).await {
        Ok(response) => return Ok(response),
        Err(e) => {
          attempt += 1;
          if attempt >= attempts || !e.is_retryable() {
            return Err(e);
          }
          let delay = base.saturating_mul(2u32.saturating_pow(attempt - 1));
          let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
          warn!(%url, attempt, delay_ms, "Fetch failed, retrying: {}", e);
          tokio::time::sleep(delay).await;
        }
      }
    }
  }

  async fn fetch_once(&self, url: &str, timeout: Duration) -> Result<FetchResponse, FetchError> {
    let started = Instant::now();
    let response = tokio::time::timeout(timeout, self.inner.transport.get(url))
      .await
      .map_err(|_| FetchError::Timeout {
        url: url.to_string(),
        timeout,
      })??;

    self.inner.network.record_latency(started.elapsed());

    if !response.is_success() {
      return Err(FetchError::Status {
        url: url.to_string(),
        status: response.status,
      });
    }
    Ok(response)
  }
}
