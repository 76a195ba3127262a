use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::probe::{HttpProbe, ReachabilityProbe};
use crate::config::NetworkConfig;

/// Connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkState {
  Online,
  Offline,
  /// Connectivity came back; verifying before declaring online
  Reconnecting,
}

impl fmt::Display for NetworkState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Online => "online",
      Self::Offline => "offline",
      Self::Reconnecting => "reconnecting",
    };
    f.write_str(name)
  }
}

/// Coarse bandwidth class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkSpeed {
  Fast,
  Slow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkTransition {
  pub from: NetworkState,
  pub to: NetworkState,
}

type Listener = Arc<dyn Fn(NetworkTransition) + Send + Sync>;

const UNKNOWN_RTT: u64 = u64::MAX;

/// Single source of truth for connectivity.
///
/// Cheap to clone; all clones share state. Platform connectivity events come
/// in through [`NetworkMonitor::report_connectivity`], and an optional probe
/// verifies reconnects and runs periodically.
#[derive(Clone)]
pub struct NetworkMonitor {
  inner: Arc<Inner>,
}

struct Inner {
  state: watch::Sender<NetworkState>,
  listeners: Mutex<HashMap<u64, Listener>>,
  next_listener: AtomicU64,
  last_rtt_ms: AtomicU64,
  slow_threshold: Duration,
  probe: Option<Arc<dyn ReachabilityProbe>>,
  probe_timeout: Duration,
}

impl NetworkMonitor {
  pub fn new(config: &NetworkConfig, probe: Option<Arc<dyn ReachabilityProbe>>) -> Self {
    let initial = if config.assume_online {
      NetworkState::Online
    } else {
      NetworkState::Offline
    };
    let (state, _) = watch::channel(initial);

    Self {
      inner: Arc::new(Inner {
        state,
        listeners: Mutex::new(HashMap::new()),
        next_listener: AtomicU64::new(0),
        last_rtt_ms: AtomicU64::new(UNKNOWN_RTT),
        slow_threshold: config.slow_threshold(),
        probe,
        probe_timeout: config.probe_timeout(),
      }),
    }
  }

  /// Build a monitor with an [`HttpProbe`] when `probe_url` is configured.
  pub fn from_config(config: &NetworkConfig) -> Self {
    let probe = config.probe_url.as_deref().and_then(|url| {
      match HttpProbe::new(url, config.probe_timeout()) {
        Ok(probe) => Some(Arc::new(probe) as Arc<dyn ReachabilityProbe>),
        Err(e) => {
          warn!("Reachability probe disabled: {}", e);
          None
        }
      }
    });
    Self::new(config, probe)
  }

  pub fn state(&self) -> NetworkState {
    *self.inner.state.borrow()
  }

  /// `Reconnecting` does not count as online.
  pub fn is_online(&self) -> bool {
    self.state() == NetworkState::Online
  }

  /// Fast until a round trip slower than the threshold has been measured.
  pub fn speed(&self) -> NetworkSpeed {
    let rtt = self.inner.last_rtt_ms.load(Ordering::Acquire);
    let threshold = u64::try_from(self.inner.slow_threshold.as_millis()).unwrap_or(u64::MAX);
    if rtt != UNKNOWN_RTT && rtt > threshold {
      NetworkSpeed::Slow
    } else {
      NetworkSpeed::Fast
    }
  }

  /// Record the round-trip time of a completed request.
  pub fn record_latency(&self, rtt: Duration) {
    let millis = u64::try_from(rtt.as_millis()).unwrap_or(UNKNOWN_RTT - 1);
    self.inner.last_rtt_ms.store(millis, Ordering::Release);
  }

  /// Receiver that observes every state change.
  pub fn watch(&self) -> watch::Receiver<NetworkState> {
    self.inner.state.subscribe()
  }

  /// Register `callback` for every state transition.
  pub fn subscribe<F>(&self, callback: F) -> Subscription
  where
    F: Fn(NetworkTransition) + Send + Sync + 'static,
  {
    let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
    self
      .inner
      .listeners
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(id, Arc::new(callback));

    Subscription {
      monitor: Arc::downgrade(&self.inner),
      id,
    }
  }

  fn set_state(&self, to: NetworkState) {
    let mut from = to;
    let changed = self.inner.state.send_if_modified(|state| {
      from = *state;
      if *state == to {
        return false;
      }
      *state = to;
      true
    });
    if !changed {
      return;
    }

    info!(%from, %to, "network state changed");

    // Call listeners outside the lock so they may subscribe or unsubscribe.
    let listeners: Vec<Listener> = self
      .inner
      .listeners
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .values()
      .cloned()
      .collect();
    let transition = NetworkTransition { from, to };
    for listener in listeners {
      listener(transition);
    }
  }

  /// Feed a platform connectivity event.
  ///
  /// Going online passes through `Reconnecting` while the probe verifies the
  /// link. Without a probe the monitor goes straight to `Online`.
  pub async fn report_connectivity(&self, online: bool) {
    if !online {
      self.set_state(NetworkState::Offline);
      return;
    }
    if self.is_online() {
      return;
    }
    if self.inner.probe.is_none() {
      self.set_state(NetworkState::Online);
      return;
    }

    self.set_state(NetworkState::Reconnecting);
    let reachable = self.check_reachability().await;

    // An offline event during verification wins.
    if self.state() == NetworkState::Reconnecting {
      self.set_state(if reachable {
        NetworkState::Online
      } else {
        NetworkState::Offline
      });
    }
  }

  /// Run the probe once, recording its latency. Without a probe this reports
  /// the current state.
  pub async fn check_reachability(&self) -> bool {
    let Some(probe) = self.inner.probe.clone() else {
      return self.is_online();
    };

    match tokio::time::timeout(self.inner.probe_timeout, probe.probe()).await {
      Ok(Ok(rtt)) => {
        self.record_latency(rtt);
        let rtt_ms = u64::try_from(rtt.as_millis()).unwrap_or(u64::MAX);
        debug!(rtt_ms, "reachability probe succeeded");
        true
      }
      Ok(Err(e)) => {
        debug!("Reachability probe failed: {}", e);
        false
      }
      Err(_) => {
        debug!("Reachability probe timed out");
        false
      }
    }
  }

  /// Periodic probe: success means online, failure means offline.
  pub async fn probe_once(&self) {
    if self.inner.probe.is_none() {
      return;
    }
    let reachable = self.check_reachability().await;
    self.set_state(if reachable {
      NetworkState::Online
    } else {
      NetworkState::Offline
    });
  }

  /// Spawn the periodic probe. Returns `None` when no probe is configured.
  pub fn spawn_probe_loop(&self, period: Duration) -> Option<JoinHandle<()>> {
    self.inner.probe.as_ref()?;
    let monitor = self.clone();
    Some(tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      loop {
        ticker.tick().await;
        monitor.probe_once().await;
      }
    }))
  }
}

/// Handle returned by [`NetworkMonitor::subscribe`]. Dropping it unsubscribes.
pub struct Subscription {
  monitor: Weak<Inner>,
  id: u64,
}

impl Subscription {
  pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(inner) = self.monitor.upgrade() {
      inner
        .listeners
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&self.id);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;
  use futures::future::BoxFuture;
  use std::sync::atomic::AtomicBool;

  struct FakeProbe {
    reachable: AtomicBool,
    rtt: Duration,
  }

  impl FakeProbe {
    fn new(reachable: bool, rtt: Duration) -> Arc<Self> {
      Arc::new(Self {
        reachable: AtomicBool::new(reachable),
        rtt,
      })
    }
  }

  impl ReachabilityProbe for FakeProbe {
    fn probe(&self) -> BoxFuture<'_, color_eyre::Result<Duration>> {
      Box::pin(async move {
        tokio::time::sleep(self.rtt).await;
        if self.reachable.load(Ordering::SeqCst) {
          Ok(self.rtt)
        } else {
          Err(eyre!("unreachable"))
        }
      })
    }
  }

  fn offline_config() -> NetworkConfig {
    NetworkConfig {
      assume_online: false,
      ..NetworkConfig::default()
    }
  }

  fn recorder(monitor: &NetworkMonitor) -> (Subscription, Arc<Mutex<Vec<NetworkTransition>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let sub = monitor.subscribe(move |t| sink.lock().unwrap().push(t));
    (sub, seen)
  }

  #[test]
  fn test_initial_state_follows_config() {
    assert!(NetworkMonitor::new(&NetworkConfig::default(), None).is_online());
    assert!(!NetworkMonitor::new(&offline_config(), None).is_online());
  }

  #[test]
  fn test_speed_from_latency() {
    let monitor = NetworkMonitor::new(&NetworkConfig::default(), None);
    assert_eq!(monitor.speed(), NetworkSpeed::Fast);

    monitor.record_latency(Duration::from_millis(1500));
    assert_eq!(monitor.speed(), NetworkSpeed::Slow);

    monitor.record_latency(Duration::from_millis(200));
    assert_eq!(monitor.speed(), NetworkSpeed::Fast);
  }

  #[tokio::test]
  async fn test_without_probe_goes_straight_online() {
    let monitor = NetworkMonitor::new(&offline_config(), None);
    let (_sub, seen) = recorder(&monitor);

    monitor.report_connectivity(true).await;
    assert!(monitor.is_online());
    assert_eq!(
      *seen.lock().unwrap(),
      vec![NetworkTransition {
        from: NetworkState::Offline,
        to: NetworkState::Online
      }]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_reconnect_is_verified_by_probe() {
    let probe = FakeProbe::new(true, Duration::from_millis(50));
    let monitor = NetworkMonitor::new(&offline_config(), Some(probe));
    let (_sub, seen) = recorder(&monitor);

    monitor.report_connectivity(true).await;

    let states: Vec<NetworkState> = seen.lock().unwrap().iter().map(|t| t.to).collect();
    assert_eq!(states, vec![NetworkState::Reconnecting, NetworkState::Online]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_verification_falls_back_offline() {
    let probe = FakeProbe::new(false, Duration::from_millis(50));
    let monitor = NetworkMonitor::new(&offline_config(), Some(probe));

    monitor.report_connectivity(true).await;
    assert_eq!(monitor.state(), NetworkState::Offline);
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_event_during_verification_wins() {
    let probe = FakeProbe::new(true, Duration::from_secs(1));
    let monitor = NetworkMonitor::new(&offline_config(), Some(probe));

    let verifying = {
      let monitor = monitor.clone();
      tokio::spawn(async move { monitor.report_connectivity(true).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(monitor.state(), NetworkState::Reconnecting);

    monitor.report_connectivity(false).await;
    verifying.await.unwrap();
    assert_eq!(monitor.state(), NetworkState::Offline);
  }

  #[tokio::test(start_paused = true)]
  async fn test_probe_loop_tracks_reachability() {
    let probe = FakeProbe::new(true, Duration::from_millis(10));
    let monitor = NetworkMonitor::new(&offline_config(), Some(probe.clone()));
    let mut rx = monitor.watch();

    let handle = monitor.spawn_probe_loop(Duration::from_secs(30)).unwrap();
    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow(), NetworkState::Online);

    probe.reachable.store(false, Ordering::SeqCst);
    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow(), NetworkState::Offline);
    handle.abort();
  }

  #[test]
  fn test_no_probe_loop_without_probe() {
    let monitor = NetworkMonitor::new(&NetworkConfig::default(), None);
    assert!(monitor.spawn_probe_loop(Duration::from_secs(1)).is_none());
  }

  #[tokio::test]
  async fn test_unsubscribe_stops_notifications() {
    let monitor = NetworkMonitor::new(&NetworkConfig::default(), None);
    let (sub, seen) = recorder(&monitor);
    let (_other, other_seen) = recorder(&monitor);

    monitor.report_connectivity(false).await;
    sub.unsubscribe();
    monitor.report_connectivity(true).await;

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(other_seen.lock().unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_repeated_event_is_not_a_transition() {
    let monitor = NetworkMonitor::new(&NetworkConfig::default(), None);
    let (_sub, seen) = recorder(&monitor);

    monitor.report_connectivity(true).await;
    monitor.report_connectivity(false).await;
    monitor.report_connectivity(false).await;

    assert_eq!(seen.lock().unwrap().len(), 1);
  }
}
