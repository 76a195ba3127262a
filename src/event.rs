use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::network::{NetworkMonitor, NetworkTransition, Subscription};
use crate::sync::{SyncEngine, SyncEvent};

/// Events for a UI loop
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
  /// Connectivity changed
  Network(NetworkTransition),
  /// A queued item changed state, or a drain finished
  Sync(SyncEvent),
}

/// Merges network transitions and sync events into one stream
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
  _subscription: Subscription,
  forwarder: JoinHandle<()>,
}

impl EventHandler {
  pub fn new(network: &NetworkMonitor, sync: &SyncEngine) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    let network_tx = tx.clone();
    let subscription = network.subscribe(move |transition| {
      let _ = network_tx.send(Event::Network(transition));
    });

    // Forward sync events
    let mut sync_events = sync.events();
    let forwarder = tokio::spawn(async move {
      loop {
        match sync_events.recv().await {
          Ok(event) => {
            if tx.send(Event::Sync(event)).is_err() {
              break;
            }
          }
          Err(RecvError::Lagged(skipped)) => warn!(skipped, "event consumer fell behind"),
          Err(RecvError::Closed) => break,
        }
      }
    });

    Self {
      rx,
      _subscription: subscription,
      forwarder,
    }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

impl Drop for EventHandler {
  fn drop(&mut self) {
    self.forwarder.abort();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::config::{NetworkConfig, SyncConfig};
  use crate::network::NetworkState;
  use crate::store::KvStore;
  use crate::sync::{EntityKind, OperationType, RemoteOutcome, RemoteService, SyncQueueItem};
  use color_eyre::Result;
  use futures::future::BoxFuture;
  use serde_json::json;
  use std::sync::Arc;

  struct AcceptAll;

  impl RemoteService for AcceptAll {
    fn apply<'a>(&'a self, _item: &'a SyncQueueItem) -> BoxFuture<'a, Result<RemoteOutcome>> {
      Box::pin(async { Ok(RemoteOutcome::Applied) })
    }
  }

  #[tokio::test]
  async fn test_merges_network_and_sync_events() {
    let store = Arc::new(KvStore::in_memory(Arc::new(ManualClock::at_millis(0))));
    let network = NetworkMonitor::new(&NetworkConfig::default(), None);
    let sync = SyncEngine::new(store, Arc::new(AcceptAll), network.clone(), SyncConfig::default());
    let mut events = EventHandler::new(&network, &sync);

    network.report_connectivity(false).await;
    let id = sync.queue_change(EntityKind::Like, "42", OperationType::Create, json!({}));

    match events.next().await {
      Some(Event::Network(transition)) => assert_eq!(transition.to, NetworkState::Offline),
      other => panic!("expected network event, got {:?}", other),
    }
    assert_eq!(
      events.next().await,
      Some(Event::Sync(SyncEvent::Queued { item_id: id }))
    );
  }
}
