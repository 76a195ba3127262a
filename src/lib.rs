//! Offline cache and sync layer for a social feed client.
//!
//! The pieces, leaf to root:
//!
//! - [`store`]: key/value store with per-entry TTL, SQLite-backed with an
//!   in-memory fallback
//! - [`cache`]: per-domain cache with default TTLs and access metadata
//! - [`network`]: connectivity state machine and link speed
//! - [`sync`]: durable mutation queue, retry with backoff, conflict resolution
//! - [`fetch`]: network-aware reads plus image and gzip helpers
//!
//! [`OfflineLayer`] builds and runs all of them from a [`Config`].

pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod event;
pub mod fetch;
pub mod network;
pub mod offline;
pub mod store;
pub mod sync;

pub use config::Config;
pub use event::{Event, EventHandler};
pub use offline::OfflineLayer;
