//! Network reachability monitor
//!
//! Tracks the current [`NetworkState`] and broadcasts `(old, new)`
//! transitions. Reports that leave the state unchanged are dropped, and
//! transitions are published while the state lock is held so subscribers
//! always see them in the order they happened.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::remote::RemoteBackend;

/// Maximum number of transition timestamps kept for flap detection
const HISTORY_LIMIT: usize = 64;

/// Reachability of the remote backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkState {
    Online,
    Offline,
}

impl NetworkState {
    pub fn is_online(&self) -> bool {
        matches!(self, NetworkState::Online)
    }
}

impl std::fmt::Display for NetworkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkState::Online => f.write_str("online"),
            NetworkState::Offline => f.write_str("offline"),
        }
    }
}

/// A state change delivered to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkTransition {
    pub old: NetworkState,
    pub new: NetworkState,
    pub at: DateTime<Utc>,
}

/// Flap detection settings
#[derive(Debug, Clone, Copy)]
pub struct FlapSettings {
    /// Window in which transitions are counted
    pub window: Duration,
    /// Transitions within the window that count as flapping
    pub threshold: usize,
}

impl Default for FlapSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30),
            threshold: 4,
        }
    }
}

#[derive(Debug)]
struct MonitorState {
    current: NetworkState,
    /// Monotonic, so flap detection follows the runtime clock
    history: VecDeque<Instant>,
}

/// Network monitor
#[derive(Debug)]
pub struct NetworkMonitor {
    state: Mutex<MonitorState>,
    sender: broadcast::Sender<NetworkTransition>,
    flap: FlapSettings,
}

impl NetworkMonitor {
    /// Create a monitor starting in `initial`
    pub fn new(initial: NetworkState) -> Self {
        Self::with_flap_settings(initial, FlapSettings::default())
    }

    pub fn with_flap_settings(initial: NetworkState, flap: FlapSettings) -> Self {
        let (sender, _) = broadcast::channel(100);
        Self {
            state: Mutex::new(MonitorState {
                current: initial,
                history: VecDeque::new(),
            }),
            sender,
            flap,
        }
    }

    /// Current reachability
    pub fn current(&self) -> NetworkState {
        self.lock().current
    }

    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    /// Subscribe to transitions
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkTransition> {
        self.sender.subscribe()
    }

    /// Report an observed reachability value
    ///
    /// Returns the transition if the state actually changed.
    pub fn report(&self, observed: NetworkState) -> Option<NetworkTransition> {
        self.transition_to(observed, Utc::now())
    }

    /// Force a transition without a real connectivity change
    ///
    /// Goes through the same path as [`report`](Self::report), so ordering
    /// and debouncing are identical.
    pub fn simulate(&self, state: NetworkState) -> Option<NetworkTransition> {
        debug!(%state, "Simulated network transition");
        self.transition_to(state, Utc::now())
    }

    /// Whether the state changed at least `threshold` times within the window
    pub fn is_flapping(&self) -> bool {
        self.is_flapping_at(Instant::now())
    }

    fn is_flapping_at(&self, now: Instant) -> bool {
        let state = self.lock();
        let recent = state
            .history
            .iter()
            .filter(|&&at| now.saturating_duration_since(at) <= self.flap.window)
            .count();
        recent >= self.flap.threshold
    }

    /// When recorded transitions happened, oldest first
    pub fn transition_history(&self) -> Vec<Instant> {
        self.lock().history.iter().copied().collect()
    }

    fn transition_to(&self, new: NetworkState, at: DateTime<Utc>) -> Option<NetworkTransition> {
        let mut state = self.lock();
        if state.current == new {
            return None;
        }

        let transition = NetworkTransition {
            old: state.current,
            new,
            at,
        };
        state.current = new;
        state.history.push_back(Instant::now());
        while state.history.len() > HISTORY_LIMIT {
            state.history.pop_front();
        }

        info!(old = %transition.old, new = %transition.new, "Network state changed");

        // Sent under the lock so concurrent reports cannot reorder deliveries
        let _ = self.sender.send(transition);
        Some(transition)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Poll the backend's reachability and feed it into the monitor
///
/// Stops when `token` is cancelled.
pub fn spawn_reachability_poller(
    monitor: Arc<NetworkMonitor>,
    backend: Arc<dyn RemoteBackend>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let observed = backend.reachability().await;
                    monitor.report(observed);
                }
            }
        }
        debug!("Reachability poller stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;

    #[test]
    fn test_initial_state() {
        let monitor = NetworkMonitor::new(NetworkState::Offline);
        assert_eq!(monitor.current(), NetworkState::Offline);
        assert!(!monitor.is_online());
    }

    #[test]
    fn test_unchanged_report_is_debounced() {
        let monitor = NetworkMonitor::new(NetworkState::Online);
        let mut rx = monitor.subscribe();

        assert!(monitor.report(NetworkState::Online).is_none());
        assert!(rx.try_recv().is_err());
        assert!(monitor.transition_history().is_empty());
    }

    #[test]
    fn test_transitions_delivered_in_order() {
        let monitor = NetworkMonitor::new(NetworkState::Online);
        let mut rx = monitor.subscribe();

        monitor.simulate(NetworkState::Offline);
        monitor.simulate(NetworkState::Offline);
        monitor.report(NetworkState::Online);

        let first = rx.try_recv().unwrap();
        assert_eq!(
            (first.old, first.new),
            (NetworkState::Online, NetworkState::Offline)
        );
        let second = rx.try_recv().unwrap();
        assert_eq!(
            (second.old, second.new),
            (NetworkState::Offline, NetworkState::Online)
        );
        assert!(second.at >= first.at);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_flapping_detection() {
        let monitor = NetworkMonitor::with_flap_settings(
            NetworkState::Online,
            FlapSettings {
                window: Duration::from_secs(60),
                threshold: 3,
            },
        );

        monitor.simulate(NetworkState::Offline);
        monitor.simulate(NetworkState::Online);
        assert!(!monitor.is_flapping());

        monitor.simulate(NetworkState::Offline);
        assert!(monitor.is_flapping());

        // Outside the window the history no longer counts
        let later = Instant::now() + Duration::from_secs(120);
        assert!(!monitor.is_flapping_at(later));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flapping_follows_runtime_clock() {
        let monitor = NetworkMonitor::with_flap_settings(
            NetworkState::Online,
            FlapSettings {
                window: Duration::from_secs(30),
                threshold: 2,
            },
        );
        monitor.simulate(NetworkState::Offline);
        monitor.simulate(NetworkState::Online);
        assert!(monitor.is_flapping());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!monitor.is_flapping());
    }

    #[tokio::test]
    async fn test_poller_reports_backend_reachability() {
        let monitor = Arc::new(NetworkMonitor::new(NetworkState::Online));
        let remote = Arc::new(MemoryRemote::new());
        remote.set_reachable(false);

        let mut rx = monitor.subscribe();
        let token = CancellationToken::new();
        let handle = spawn_reachability_poller(
            monitor.clone(),
            remote.clone(),
            Duration::from_millis(10),
            token.clone(),
        );

        let transition = rx.recv().await.unwrap();
        assert_eq!(transition.new, NetworkState::Offline);

        token.cancel();
        handle.await.unwrap();
    }
}
