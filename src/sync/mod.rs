//! Durable mutation queue and reconciliation with the remote service.

mod conflict;
mod engine;
mod item;
mod remote;
mod status;

pub use conflict::{
  last_write_wins, remote_timestamp, ConflictRecord, ConflictStrategy, Resolution, Resolver,
};
pub use engine::{backoff_delay, SyncEngine, CONFLICTS_KEY, LAST_SYNC_KEY, QUEUE_KEY};
pub use item::{EntityKind, ItemStatus, OperationType, SyncQueueItem};
pub use remote::{HttpRemote, RemoteOutcome, RemoteService};
pub use status::{DrainReport, SyncEvent, SyncStatus};
