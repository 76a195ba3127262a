//! Write-behind queue drained to the remote service.
//!
//! Every local mutation is queued durably first. A drain sends deliverable
//! items in FIFO batches, each batch concurrently, and stops early when
//! connectivity drops. Failed items back off individually; conflicts are
//! resolved by a registered resolver or held for a manual decision.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::conflict::{last_write_wins, ConflictRecord, ConflictStrategy, Resolution, Resolver};
use super::item::{EntityKind, ItemStatus, OperationType, SyncQueueItem};
use super::remote::{RemoteOutcome, RemoteService};
use super::status::{DrainReport, SyncEvent, SyncStatus};
use crate::clock;
use crate::config::SyncConfig;
use crate::network::{NetworkMonitor, NetworkState};
use crate::store::KvStore;

pub const QUEUE_KEY: &str = "sync-queue";
pub const CONFLICTS_KEY: &str = "conflicts";
pub const LAST_SYNC_KEY: &str = "last-sync-time";

const EVENT_CAPACITY: usize = 256;

/// Delay before retry number `retry_count`: `base * 2^retry_count`.
pub fn backoff_delay(base: Duration, retry_count: u32) -> Duration {
  base.saturating_mul(2u32.saturating_pow(retry_count))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
  Delivered,
  Conflict,
  Retrying,
  Exhausted,
  /// The item left the queue while in flight
  Dropped,
}

/// The sync queue and its reconciliation state machine.
///
/// Cheap to clone; clones share the queue.
#[derive(Clone)]
pub struct SyncEngine {
  inner: Arc<Inner>,
}

struct Inner {
  store: Arc<KvStore>,
  remote: Arc<dyn RemoteService>,
  network: NetworkMonitor,
  config: SyncConfig,
  state: Mutex<QueueState>,
  resolvers: Mutex<HashMap<String, Resolver>>,
  syncing: AtomicBool,
  trailing_scheduled: AtomicBool,
  /// Drains spawned by `trigger_drain` that have not finished
  pending_drains: AtomicUsize,
  events: broadcast::Sender<SyncEvent>,
}

/// In-memory mirror of the persisted queue plus runtime-only item states.
#[derive(Default)]
struct QueueState {
  queue: Vec<SyncQueueItem>,
  conflicts: Vec<ConflictRecord>,
  in_flight: HashSet<String>,
  backing_off: HashSet<String>,
}

impl QueueState {
  fn is_deliverable(&self, item: &SyncQueueItem) -> bool {
    item.status == ItemStatus::Queued
      && !self.in_flight.contains(&item.id)
      && !self.backing_off.contains(&item.id)
  }

  fn find_mut(&mut self, item_id: &str) -> Option<&mut SyncQueueItem> {
    self.queue.iter_mut().find(|item| item.id == item_id)
  }
}

/// Resets the single-flight flag even if the drain future is dropped.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// Counts a triggered drain until its task finishes or is dropped.
struct PendingDrain(Arc<Inner>);

impl PendingDrain {
  fn new(inner: &Arc<Inner>) -> Self {
    inner.pending_drains.fetch_add(1, Ordering::AcqRel);
    Self(inner.clone())
  }
}

impl Drop for PendingDrain {
  fn drop(&mut self) {
    self.0.pending_drains.fetch_sub(1, Ordering::AcqRel);
  }
}

const SETTLE_POLL: Duration = Duration::from_millis(20);

fn requeue(item: &mut SyncQueueItem, data: Option<Value>) {
  item.status = ItemStatus::Queued;
  item.retry_count = 0;
  item.last_error = None;
  item.force = true;
  if let Some(data) = data {
    item.data = data;
  }
}

impl SyncEngine {
  /// Create an engine, hydrating the queue and conflicts from the store.
  ///
  /// Last-write-wins is registered for every entity type in `config.auto_resolve`.
  pub fn new(
    store: Arc<KvStore>,
    remote: Arc<dyn RemoteService>,
    network: NetworkMonitor,
    config: SyncConfig,
  ) -> Self {
    let queue: Vec<SyncQueueItem> = store.get(QUEUE_KEY).unwrap_or_default();
    let conflicts: Vec<ConflictRecord> = store.get(CONFLICTS_KEY).unwrap_or_default();
    info!(
      queued = queue.len(),
      conflicts = conflicts.len(),
      "sync queue loaded"
    );

    let lww: Resolver = Arc::new(last_write_wins);
    let resolvers = config
      .auto_resolve
      .iter()
      .map(|entity| (entity.as_str().to_string(), lww.clone()))
      .collect();

    let (events, _) = broadcast::channel(EVENT_CAPACITY);

    Self {
      inner: Arc::new(Inner {
        store,
        remote,
        network,
        config,
        state: Mutex::new(QueueState {
          queue,
          conflicts,
          ..QueueState::default()
        }),
        resolvers: Mutex::new(resolvers),
        syncing: AtomicBool::new(false),
        trailing_scheduled: AtomicBool::new(false),
        pending_drains: AtomicUsize::new(0),
        events,
      }),
    }
  }

  fn now(&self) -> i64 {
    self.inner.store.clock().now_millis()
  }

  fn state(&self) -> MutexGuard<'_, QueueState> {
    self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn persist_queue(&self, state: &QueueState) {
    self.inner.store.set(QUEUE_KEY, &state.queue, None);
  }

  fn persist_conflicts(&self, state: &QueueState) {
    self.inner.store.set(CONFLICTS_KEY, &state.conflicts, None);
  }

  fn emit(&self, event: SyncEvent) {
    // No receivers is fine.
    let _ = self.inner.events.send(event);
  }

  /// Subscribe to per-item transitions.
  pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
    self.inner.events.subscribe()
  }

  /// Queue a local mutation and return its item id.
  ///
  /// A mutation of the same entity, id and operation queued within the
  /// debounce window is dropped in favour of the existing item.
  pub fn queue_change(
    &self,
    entity: EntityKind,
    entity_id: &str,
    op: OperationType,
    data: Value,
  ) -> String {
    let now = self.now();
    let debounce = i64::try_from(self.inner.config.debounce_ms).unwrap_or(i64::MAX);

    let item_id = {
      let mut state = self.state();
      let duplicate = state.queue.iter().find(|item| {
        item.same_target(entity, entity_id, op) && now.saturating_sub(item.timestamp) < debounce
      });
      if let Some(existing) = duplicate {
        debug!(item_id = %existing.id, "mutation coalesced into queued item");
        return existing.id.clone();
      }

      let item = SyncQueueItem::new(entity, entity_id, op, data, now);
      let item_id = item.id.clone();
      state.queue.push(item);
      self.persist_queue(&state);
      item_id
    };

    debug!(%item_id, "mutation queued");
    self.emit(SyncEvent::Queued {
      item_id: item_id.clone(),
    });

    if self.inner.network.is_online() {
      self.trigger_drain();
    }
    item_id
  }

  /// Start a drain in the background, if a runtime is available.
  pub fn trigger_drain(&self) {
    match Handle::try_current() {
      Ok(handle) => {
        let engine = self.clone();
        let pending = PendingDrain::new(&self.inner);
        handle.spawn(async move {
          engine.start_sync().await;
          drop(pending);
        });
      }
      Err(_) => debug!("no async runtime; drain deferred"),
    }
  }

  /// No drain is running and none has been triggered.
  pub fn is_idle(&self) -> bool {
    !self.inner.syncing.load(Ordering::Acquire)
      && self.inner.pending_drains.load(Ordering::Acquire) == 0
  }

  /// Wait until triggered and running drains have finished. Backoff and
  /// trailing timers are not waited for.
  pub async fn settle(&self) {
    while !self.is_idle() {
      tokio::time::sleep(SETTLE_POLL).await;
    }
  }

  /// Drain the queue once. A call while a drain is running returns immediately.
  pub async fn start_sync(&self) -> DrainReport {
    if self.inner.syncing.swap(true, Ordering::AcqRel) {
      debug!("drain already running");
      return DrainReport::skipped();
    }

    let report = {
      let _guard = SyncingGuard(&self.inner.syncing);
      self.drain().await
    };

    self.prune_exhausted();
    info!(
      attempted = report.attempted,
      delivered = report.delivered,
      retrying = report.retrying,
      exhausted = report.exhausted,
      conflicts = report.conflicts,
      aborted = report.aborted,
      "drain finished"
    );
    self.emit(SyncEvent::DrainFinished(report));
    self.schedule_trailing();
    report
  }

  async fn drain(&self) -> DrainReport {
    let mut report = DrainReport::default();
    if !self.inner.network.is_online() {
      report.aborted = true;
      return report;
    }

    let ids: Vec<String> = {
      let state = self.state();
      state
        .queue
        .iter()
        .filter(|item| state.is_deliverable(item))
        .map(|item| item.id.clone())
        .collect()
    };

    let batch_size = self.inner.config.batch_size.max(1);
    for (index, chunk) in ids.chunks(batch_size).enumerate() {
      if index > 0 && !self.inner.network.is_online() {
        info!("connectivity lost mid-drain; remaining items stay queued");
        report.aborted = true;
        break;
      }

      // Items may have been resolved or discarded since the snapshot.
      let batch: Vec<SyncQueueItem> = {
        let mut state = self.state();
        let batch: Vec<SyncQueueItem> = chunk
          .iter()
          .filter_map(|id| state.queue.iter().find(|item| &item.id == id))
          .filter(|item| state.is_deliverable(item))
          .cloned()
          .collect();
        for item in &batch {
          state.in_flight.insert(item.id.clone());
        }
        batch
      };

      report.attempted += batch.len();
      let outcomes = join_all(batch.into_iter().map(|item| self.sync_item(item))).await;
      for outcome in outcomes {
        match outcome {
          ItemOutcome::Delivered => report.delivered += 1,
          ItemOutcome::Conflict => report.conflicts += 1,
          ItemOutcome::Retrying => report.retrying += 1,
          ItemOutcome::Exhausted => report.exhausted += 1,
          ItemOutcome::Dropped => {}
        }
      }
    }

    if !report.aborted && !self.inner.network.is_online() {
      report.aborted = true;
    }

    let queue_empty = self.state().queue.is_empty();
    if queue_empty {
      self.inner.store.set(LAST_SYNC_KEY, &self.now(), None);
    }
    report
  }

  /// Deliver one item. The caller marks it in flight.
  async fn sync_item(&self, item: SyncQueueItem) -> ItemOutcome {
    let timeout = self.inner.config.item_timeout();
    let result = tokio::time::timeout(timeout, self.inner.remote.apply(&item)).await;

    let outcome = match result {
      Ok(Ok(RemoteOutcome::Applied)) => self.handle_delivered(&item),
      Ok(Ok(RemoteOutcome::Conflict { remote_data })) => self.handle_conflict(&item, remote_data),
      Ok(Err(e)) => self.handle_failure(&item, e.to_string()),
      Err(_) => self.handle_failure(&item, format!("timed out after {}s", timeout.as_secs())),
    };

    self.state().in_flight.remove(&item.id);
    outcome
  }

  fn handle_delivered(&self, item: &SyncQueueItem) -> ItemOutcome {
    {
      let mut state = self.state();
      state.queue.retain(|queued| queued.id != item.id);
      self.persist_queue(&state);
    }
    info!(item_id = %item.id, "item delivered");
    self.emit(SyncEvent::Delivered {
      item_id: item.id.clone(),
    });
    ItemOutcome::Delivered
  }

  fn handle_failure(&self, item: &SyncQueueItem, error: String) -> ItemOutcome {
    let max_retries = self.inner.config.max_retries;

    let mut state = self.state();
    let Some(entry) = state.find_mut(&item.id) else {
      return ItemOutcome::Dropped;
    };
    entry.last_error = Some(error.clone());

    if entry.retry_count >= max_retries {
      entry.status = ItemStatus::Exhausted;
      self.persist_queue(&state);
      drop(state);

      warn!(item_id = %item.id, "Delivery failed, retries exhausted: {}", error);
      self.emit(SyncEvent::Exhausted {
        item_id: item.id.clone(),
        error,
      });
      return ItemOutcome::Exhausted;
    }

    entry.retry_count += 1;
    let retry_count = entry.retry_count;
    state.backing_off.insert(item.id.clone());
    self.persist_queue(&state);
    drop(state);

    let delay = backoff_delay(self.inner.config.retry_base(), retry_count);
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    warn!(
      item_id = %item.id,
      retry_count,
      delay_ms,
      "Delivery failed, retrying: {}",
      error
    );
    self.emit(SyncEvent::RetryScheduled {
      item_id: item.id.clone(),
      retry_count,
      delay_ms,
      error,
    });
    self.schedule_retry(item.id.clone(), retry_count, delay);
    ItemOutcome::Retrying
  }

  fn schedule_retry(&self, item_id: String, retry_count: u32, delay: Duration) {
    let Ok(handle) = Handle::try_current() else {
      self.state().backing_off.remove(&item_id);
      return;
    };
    let engine = self.clone();
    handle.spawn(async move {
      tokio::time::sleep(delay).await;
      engine.retry_item(&item_id, retry_count).await;
    });
  }

  /// Backoff timer callback. Only an item still waiting on this exact retry is delivered.
  async fn retry_item(&self, item_id: &str, retry_count: u32) {
    let item = {
      let mut state = self.state();
      state.backing_off.remove(item_id);

      let Some(item) = state.queue.iter().find(|item| item.id == item_id).cloned() else {
        debug!(%item_id, "item left the queue during backoff");
        return;
      };
      if item.status != ItemStatus::Queued
        || item.retry_count != retry_count
        || state.in_flight.contains(item_id)
      {
        return;
      }
      if !self.inner.network.is_online() {
        // Picked up by the next drain.
        return;
      }
      state.in_flight.insert(item.id.clone());
      item
    };

    self.sync_item(item).await;
  }

  fn handle_conflict(&self, item: &SyncQueueItem, remote_data: Value) -> ItemOutcome {
    let conflict = {
      let mut state = self.state();
      let Some(entry) = state.find_mut(&item.id) else {
        return ItemOutcome::Dropped;
      };
      entry.status = ItemStatus::Conflict;
      let local_item = entry.clone();

      let conflict = ConflictRecord::new(local_item, remote_data, self.now());
      state.conflicts.retain(|existing| existing.id != conflict.id);
      state.conflicts.push(conflict.clone());
      self.persist_queue(&state);
      self.persist_conflicts(&state);
      conflict
    };

    info!(conflict_id = %conflict.id, item_id = %item.id, "remote conflict detected");
    self.emit(SyncEvent::Conflict {
      conflict_id: conflict.id.clone(),
      item_id: item.id.clone(),
    });

    match self.resolver_for(item) {
      Some(resolver) => {
        let resolution = resolver(&conflict);
        if let Err(e) = self.apply_resolution(&conflict.id, resolution) {
          warn!("Failed to apply automatic resolution: {}", e);
        }
      }
      None => info!(conflict_id = %conflict.id, "conflict awaiting manual resolution"),
    }
    ItemOutcome::Conflict
  }

  fn resolver_for(&self, item: &SyncQueueItem) -> Option<Resolver> {
    let resolvers = self
      .inner
      .resolvers
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    resolvers
      .get(&item.resolver_key())
      .or_else(|| resolvers.get(item.entity.as_str()))
      .cloned()
  }

  /// Register a resolver for an entity type (`"post"`) or one entity (`"post-42"`).
  ///
  /// The per-entity resolver takes precedence.
  pub fn register_resolver<F>(&self, key: impl Into<String>, resolver: F)
  where
    F: Fn(&ConflictRecord) -> Resolution + Send + Sync + 'static,
  {
    self
      .inner
      .resolvers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(key.into(), Arc::new(resolver));
  }

  /// Manually resolve a pending conflict.
  pub fn resolve_conflict(&self, conflict_id: &str, strategy: ConflictStrategy) -> Result<()> {
    let resolution = match strategy {
      ConflictStrategy::Local => Resolution::KeepLocal,
      ConflictStrategy::Remote => Resolution::KeepRemote,
    };
    self.apply_resolution(conflict_id, resolution)
  }

  fn apply_resolution(&self, conflict_id: &str, resolution: Resolution) -> Result<()> {
    let (item_id, kept) = {
      let mut state = self.state();
      let position = state
        .conflicts
        .iter()
        .position(|conflict| conflict.id == conflict_id)
        .ok_or_else(|| eyre!("Conflict not found: {}", conflict_id))?;
      let conflict = state.conflicts.remove(position);
      let item_id = conflict.local_item.id.clone();

      let local_data = match resolution {
        Resolution::KeepRemote => None,
        Resolution::KeepLocal => Some(None),
        Resolution::Merge(data) => Some(Some(data)),
      };

      let kept = match local_data {
        None => {
          state.queue.retain(|item| item.id != item_id);
          ConflictStrategy::Remote
        }
        Some(data) => {
          match state.find_mut(&item_id) {
            Some(item) => requeue(item, data),
            None => {
              let mut item = conflict.local_item;
              requeue(&mut item, data);
              state.queue.push(item);
            }
          }
          ConflictStrategy::Local
        }
      };

      self.persist_queue(&state);
      self.persist_conflicts(&state);
      (item_id, kept)
    };

    info!(%conflict_id, %item_id, ?kept, "conflict resolved");
    self.emit(SyncEvent::ConflictResolved {
      conflict_id: conflict_id.to_string(),
      item_id,
      kept,
    });

    if kept == ConflictStrategy::Local && self.inner.network.is_online() {
      self.trigger_drain();
    }
    Ok(())
  }

  /// Schedule one more drain if online and deliverable work is left.
  fn schedule_trailing(&self) {
    if !self.inner.network.is_online() {
      return;
    }
    let has_work = self
      .state()
      .queue
      .iter()
      .any(|item| item.status == ItemStatus::Queued);
    if !has_work {
      return;
    }
    if self.inner.trailing_scheduled.swap(true, Ordering::AcqRel) {
      return;
    }
    let Ok(handle) = Handle::try_current() else {
      self.inner.trailing_scheduled.store(false, Ordering::Release);
      return;
    };

    let engine = self.clone();
    let delay = self.inner.config.trailing_sync();
    handle.spawn(async move {
      tokio::time::sleep(delay).await;
      engine.inner.trailing_scheduled.store(false, Ordering::Release);
      engine.start_sync().await;
    });
  }

  /// Give exhausted items a fresh set of retries and start a drain.
  pub fn retry_failed(&self) -> usize {
    let count = {
      let mut state = self.state();
      let mut count = 0;
      for item in state
        .queue
        .iter_mut()
        .filter(|item| item.status == ItemStatus::Exhausted)
      {
        item.status = ItemStatus::Queued;
        item.retry_count = 0;
        count += 1;
      }
      if count > 0 {
        self.persist_queue(&state);
      }
      count
    };

    info!(count, "exhausted items re-queued");
    if count > 0 && self.inner.network.is_online() {
      self.trigger_drain();
    }
    count
  }

  /// Drop a queued item and any conflict it is part of.
  pub fn discard(&self, item_id: &str) -> Result<()> {
    {
      let mut state = self.state();
      let before = state.queue.len();
      state.queue.retain(|item| item.id != item_id);
      if state.queue.len() == before {
        return Err(eyre!("Queue item not found: {}", item_id));
      }
      state
        .conflicts
        .retain(|conflict| conflict.local_item.id != item_id);
      self.persist_queue(&state);
      self.persist_conflicts(&state);
    }

    info!(%item_id, "queue item discarded");
    self.emit(SyncEvent::Discarded {
      item_id: item_id.to_string(),
    });
    Ok(())
  }

  /// Drop exhausted items older than `exhausted_max_age_secs`. No-op when unset.
  pub fn prune_exhausted(&self) -> usize {
    let Some(max_age) = self.inner.config.exhausted_max_age() else {
      return 0;
    };
    let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
    let now = self.now();

    let pruned: Vec<String> = {
      let mut state = self.state();
      let pruned: Vec<String> = state
        .queue
        .iter()
        .filter(|item| {
          item.status == ItemStatus::Exhausted && now.saturating_sub(item.timestamp) >= max_age_ms
        })
        .map(|item| item.id.clone())
        .collect();
      if pruned.is_empty() {
        return 0;
      }
      state.queue.retain(|item| !pruned.contains(&item.id));
      self.persist_queue(&state);
      pruned
    };

    for item_id in &pruned {
      warn!(%item_id, "exhausted item dropped after max age");
      self.emit(SyncEvent::Discarded {
        item_id: item_id.clone(),
      });
    }
    pruned.len()
  }

  /// Remove every queued item and conflict. Returns the number of items removed.
  pub fn clear_queue(&self) -> usize {
    let mut state = self.state();
    let count = state.queue.len();
    state.queue.clear();
    state.conflicts.clear();
    self.persist_queue(&state);
    self.persist_conflicts(&state);
    info!(count, "sync queue cleared");
    count
  }

  pub fn queue_items(&self) -> Vec<SyncQueueItem> {
    self.state().queue.clone()
  }

  pub fn pending_conflicts(&self) -> Vec<ConflictRecord> {
    self.state().conflicts.clone()
  }

  pub fn status(&self) -> SyncStatus {
    let last_sync_time = self
      .inner
      .store
      .get::<i64>(LAST_SYNC_KEY)
      .and_then(clock::from_millis);

    let state = self.state();
    let count = |status: ItemStatus| state.queue.iter().filter(|item| item.status == status).count();

    SyncStatus {
      is_syncing: self.inner.syncing.load(Ordering::Acquire),
      queue_length: state.queue.len(),
      last_sync_time,
      is_offline: !self.inner.network.is_online(),
      pending_changes: state.queue.iter().filter(|item| item.is_pending()).count(),
      failed_count: count(ItemStatus::Exhausted),
      conflict_count: state.conflicts.len(),
    }
  }

  /// Drain whenever the monitor reports the network back online.
  pub fn spawn_network_listener(&self) -> JoinHandle<()> {
    let engine = self.clone();
    let mut rx = self.inner.network.watch();
    tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let state = *rx.borrow_and_update();
        if state == NetworkState::Online {
          info!("network online; draining sync queue");
          engine.start_sync().await;
        }
      }
    })
  }
}
