//! Cache domains and key construction.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Prefix shared by every domain cache key.
pub const KEY_PREFIX: &str = "cache-";

/// Scope used by domains that hold a single collection.
pub const DEFAULT_SCOPE: &str = "all";

/// A named category of cached data with its own TTL policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheDomain {
  Feed,
  Reels,
  /// Messages of one chat, scoped by chat id
  Messages,
  /// The conversation list
  Conversations,
  /// One user's profile, scoped by user id
  Profile,
  Friends,
  Topics,
  Notifications,
}

impl CacheDomain {
  pub const ALL: [CacheDomain; 8] = [
    CacheDomain::Feed,
    CacheDomain::Reels,
    CacheDomain::Messages,
    CacheDomain::Conversations,
    CacheDomain::Profile,
    CacheDomain::Friends,
    CacheDomain::Topics,
    CacheDomain::Notifications,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Feed => "feed",
      Self::Reels => "reels",
      Self::Messages => "messages",
      Self::Conversations => "conversations",
      Self::Profile => "profile",
      Self::Friends => "friends",
      Self::Topics => "topics",
      Self::Notifications => "notifications",
    }
  }

  /// Default time-to-live, by how quickly the data goes stale.
  pub fn default_ttl(&self) -> Duration {
    const MINUTE: u64 = 60;
    match self {
      Self::Profile | Self::Friends | Self::Topics => Duration::from_secs(60 * MINUTE),
      Self::Feed | Self::Reels | Self::Messages | Self::Conversations => {
        Duration::from_secs(30 * MINUTE)
      }
      Self::Notifications => Duration::from_secs(5 * MINUTE),
    }
  }

  /// Key prefix covering every scope of this domain.
  pub fn key_prefix(&self) -> String {
    format!("{}{}-", KEY_PREFIX, self.as_str())
  }

  /// Store key for `scope` (or the default scope).
  pub fn key(&self, scope: Option<&str>) -> String {
    format!("{}{}", self.key_prefix(), scope.unwrap_or(DEFAULT_SCOPE))
  }

  /// Whether entries are keyed per chat or per user rather than held as one collection.
  pub fn is_scoped(&self) -> bool {
    matches!(self, Self::Messages | Self::Profile)
  }
}

impl fmt::Display for CacheDomain {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for CacheDomain {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let lower = s.trim().to_lowercase();
    Self::ALL
      .into_iter()
      .find(|domain| domain.as_str() == lower)
      .ok_or_else(|| format!("unknown cache domain: {}", s))
  }
}

/// Helpers for building scopes.
pub struct CacheScope;

impl CacheScope {
  /// Stable, fixed-length scope for a request URL.
  pub fn from_url(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.trim().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
  }
}
