//! Domain cache over the key/value store.
//!
//! Each domain (feed, messages, profile, ...) gets its own key namespace
//! (`cache-<domain>-<scope>`) and a default TTL matched to how quickly its
//! data goes stale. Access metadata is kept in an index for statistics and
//! the metadata-aware sweep.

mod domain;
mod manager;
mod metadata;
mod result;

pub use domain::{CacheDomain, CacheScope, DEFAULT_SCOPE, KEY_PREFIX};
pub use manager::{CacheManager, CacheStats, EntrySummary, INDEX_KEY};
pub use metadata::{CacheMetadata, MetadataIndex};
pub use result::{CacheResult, CacheSource};
