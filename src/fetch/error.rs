use std::time::Duration;
use thiserror::Error;

/// Failure of a network read.
///
/// `Clone` so a coalesced fetch can hand the same error to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
  #[error("request to {url} timed out after {timeout:?}")]
  Timeout { url: String, timeout: Duration },

  #[error("{url} returned HTTP {status}")]
  Status { url: String, status: u16 },

  #[error("request to {url} failed: {message}")]
  Transport { url: String, message: String },

  #[error("failed to decode response from {url}: {message}")]
  Decode { url: String, message: String },
}

impl FetchError {
  /// Client errors other than 408 and 429 will not succeed on retry.
  pub fn is_retryable(&self) -> bool {
    match self {
      Self::Status { status, .. } => !(400..500).contains(status) || *status == 408 || *status == 429,
      Self::Decode { .. } => false,
      Self::Timeout { .. } | Self::Transport { .. } => true,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn status(code: u16) -> FetchError {
    FetchError::Status {
      url: "https://api.example.com".to_string(),
      status: code,
    }
  }

  #[test]
  fn test_retryable() {
    assert!(status(500).is_retryable());
    assert!(status(503).is_retryable());
    assert!(status(429).is_retryable());
    assert!(status(408).is_retryable());
    assert!(!status(404).is_retryable());
    assert!(!status(401).is_retryable());
  }

  #[test]
  fn test_display() {
    assert_eq!(status(502).to_string(), "https://api.example.com returned HTTP 502");
  }
}
