//! Connection-state tracking.
//!
//! [`ConnectionMonitor`] is a finite state machine over
//! [`ConnectionState`]. It performs no network I/O of its own: it is driven
//! by [`NetworkSignal`] reachability events and by explicit notifications
//! from the client, and fans every transition out to subscribers in the
//! order it occurred.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::current_unix_timestamp;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No connection. Initial state.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// The endpoint is reachable.
    Connected,
    /// An automatic reconnect attempt is in flight.
    Reconnecting,
    /// Reconnection attempts were exhausted.
    Error,
}

impl ConnectionState {
    fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Disconnected, Reconnecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Connected, Reconnecting)
                | (Reconnecting, Connected)
                | (Reconnecting, Error)
                | (Reconnecting, Disconnected)
                | (Error, Reconnecting)
                | (Error, Disconnected)
        )
    }
}

/// Emitted on every state transition, in transition order.
#[derive(Debug, Clone)]
pub struct ConnectionStateChanged {
    /// State before the transition.
    pub previous: ConnectionState,
    /// State after the transition.
    pub current: ConnectionState,
    /// Optional human-readable cause.
    pub reason: Option<String>,
    /// Unix timestamp (seconds).
    pub timestamp: u64,
}

/// A source of raw network reachability events.
pub trait NetworkSignal: Send + Sync {
    /// Whether the network is currently reachable.
    fn currently_online(&self) -> bool;

    /// Subscribes to reachability changes.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Manually driven [`NetworkSignal`] for embedders and tests.
pub struct ManualNetworkSignal {
    sender: watch::Sender<bool>,
}

impl ManualNetworkSignal {
    /// Creates a signal with the given initial reachability.
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self { sender }
    }

    /// Reports a reachability change.
    pub fn set_online(&self, online: bool) {
        self.sender.send_replace(online);
    }
}

impl NetworkSignal for ManualNetworkSignal {
    fn currently_online(&self) -> bool {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

/// Tracks connection state and broadcasts changes.
///
/// Cheap to clone; all clones share the same state and event stream. State
/// mutation and event emission happen under one lock, so subscribers observe
/// transitions as a single linear sequence with no reordering or loss.
#[derive(Clone)]
pub struct ConnectionMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    state: Mutex<ConnectionState>,
    events: broadcast::Sender<ConnectionStateChanged>,
}

impl ConnectionMonitor {
    /// Creates a monitor in the [`ConnectionState::Disconnected`] state.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(MonitorInner {
                state: Mutex::new(ConnectionState::Disconnected),
                events,
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.lock_state()
    }

    /// True only when the state is [`ConnectionState::Connected`].
    pub fn is_online(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscribes to state-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionStateChanged> {
        self.inner.events.subscribe()
    }

    /// Applies a transition if it is valid for the current state.
    ///
    /// Returns whether the transition was applied. Invalid transitions are
    /// ignored with a warning.
    pub fn transition_to(&self, next: ConnectionState, reason: Option<&str>) -> bool {
        let mut state = self.lock_state();
        self.apply_locked(&mut state, next, reason)
    }

    /// Walks the machine toward [`ConnectionState::Connected`] after a
    /// successful send.
    pub fn record_success(&self) {
        use ConnectionState::*;
        let mut state = self.lock_state();
        match *state {
            Connected => {}
            Connecting | Reconnecting => {
                self.apply_locked(&mut state, Connected, Some("request succeeded"));
            }
            Disconnected => {
                self.apply_locked(&mut state, Connecting, Some("request in flight"));
                self.apply_locked(&mut state, Connected, Some("request succeeded"));
            }
            Error => {
                self.apply_locked(&mut state, Reconnecting, Some("request in flight"));
                self.apply_locked(&mut state, Connected, Some("request succeeded"));
            }
        }
    }

    /// Records a send that failed with a connection-loss error.
    pub fn record_network_failure(&self, reason: &str) {
        use ConnectionState::*;
        let mut state = self.lock_state();
        match *state {
            Connected | Connecting | Reconnecting => {
                self.apply_locked(&mut state, Disconnected, Some(reason));
            }
            Disconnected | Error => {}
        }
    }

    /// Drives the monitor from a reachability signal.
    ///
    /// The current reachability is applied immediately; the spawned task then
    /// follows changes until the signal's sender is dropped.
    pub fn watch_signal<S: NetworkSignal>(&self, signal: &S) -> JoinHandle<()> {
        let mut receiver = signal.subscribe();
        if *receiver.borrow_and_update() {
            self.note_network_restored();
        }
        let monitor = self.clone();
        tokio::spawn(async move {
            while receiver.changed().await.is_ok() {
                let online = *receiver.borrow_and_update();
                if online {
                    monitor.note_network_restored();
                } else {
                    monitor.note_network_lost();
                }
            }
        })
    }

    fn note_network_restored(&self) {
        use ConnectionState::*;
        let mut state = self.lock_state();
        match *state {
            Disconnected | Error => {
                self.apply_locked(&mut state, Reconnecting, Some("network restored"));
                self.apply_locked(&mut state, Connected, Some("network restored"));
            }
            Connecting | Reconnecting | Connected => {}
        }
    }

    fn note_network_lost(&self) {
        use ConnectionState::*;
        let mut state = self.lock_state();
        match *state {
            Connected | Connecting | Reconnecting => {
                self.apply_locked(&mut state, Disconnected, Some("network lost"));
            }
            Disconnected | Error => {}
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.inner
            .state
            .lock()
            .expect("connection state lock poisoned")
    }

    fn apply_locked(
        &self,
        state: &mut ConnectionState,
        next: ConnectionState,
        reason: Option<&str>,
    ) -> bool {
        let previous = *state;
        if previous == next {
            return false;
        }
        if !previous.can_transition_to(next) {
            warn!(
                target: "llm_resilience::connection",
                from = ?previous,
                to = ?next,
                event = "invalid_transition",
                "ignoring invalid connection state transition"
            );
            return false;
        }

        *state = next;
        let change = ConnectionStateChanged {
            previous,
            current: next,
            reason: reason.map(str::to_owned),
            timestamp: current_unix_timestamp(),
        };
        debug!(
            target: "llm_resilience::connection",
            from = ?previous,
            to = ?next,
            reason = ?change.reason,
            event = "state_changed",
            "connection state changed"
        );
        let _ = self.inner.events.send(change);
        true
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_events(
        receiver: &mut broadcast::Receiver<ConnectionStateChanged>,
    ) -> Vec<(ConnectionState, ConnectionState)> {
        let mut events = Vec::new();
        while let Ok(change) = receiver.try_recv() {
            events.push((change.previous, change.current));
        }
        events
    }

    #[test]
    fn test_initial_state_is_disconnected() {
        let monitor = ConnectionMonitor::new();
        assert_eq!(monitor.state(), ConnectionState::Disconnected);
        assert!(!monitor.is_online());
    }

    #[test]
    fn test_valid_transition_emits_event() {
        let monitor = ConnectionMonitor::new();
        let mut events = monitor.subscribe();

        assert!(monitor.transition_to(ConnectionState::Connecting, Some("dialing")));
        assert!(monitor.transition_to(ConnectionState::Connected, None));
        assert!(monitor.is_online());

        let seen = drain_events(&mut events);
        assert_eq!(
            seen,
            vec![
                (ConnectionState::Disconnected, ConnectionState::Connecting),
                (ConnectionState::Connecting, ConnectionState::Connected),
            ]
        );
    }

    #[test]
    fn test_invalid_transition_is_ignored() {
        let monitor = ConnectionMonitor::new();
        let mut events = monitor.subscribe();

        // Disconnected -> Connected is not a valid edge.
        assert!(!monitor.transition_to(ConnectionState::Connected, None));
        assert_eq!(monitor.state(), ConnectionState::Disconnected);
        assert!(drain_events(&mut events).is_empty());
    }

    #[test]
    fn test_event_carries_reason_and_timestamp() {
        let monitor = ConnectionMonitor::new();
        let mut events = monitor.subscribe();

        monitor.transition_to(ConnectionState::Connecting, Some("startup"));
        let change = events.try_recv().unwrap();
        assert_eq!(change.previous, ConnectionState::Disconnected);
        assert_eq!(change.current, ConnectionState::Connecting);
        assert_eq!(change.reason.as_deref(), Some("startup"));
        assert!(change.timestamp > 0);
    }

    #[test]
    fn test_record_success_walks_to_connected() {
        let monitor = ConnectionMonitor::new();
        let mut events = monitor.subscribe();

        monitor.record_success();
        assert!(monitor.is_online());

        let seen = drain_events(&mut events);
        assert_eq!(
            seen,
            vec![
                (ConnectionState::Disconnected, ConnectionState::Connecting),
                (ConnectionState::Connecting, ConnectionState::Connected),
            ]
        );

        // Already connected: no further events.
        monitor.record_success();
        assert!(drain_events(&mut events).is_empty());
    }

    #[test]
    fn test_record_network_failure_disconnects() {
        let monitor = ConnectionMonitor::new();
        monitor.record_success();
        assert!(monitor.is_online());

        monitor.record_network_failure("connection refused");
        assert_eq!(monitor.state(), ConnectionState::Disconnected);
        assert!(!monitor.is_online());
    }

    #[test]
    fn test_reconnecting_can_fail_to_error_and_recover() {
        let monitor = ConnectionMonitor::new();
        assert!(monitor.transition_to(ConnectionState::Reconnecting, None));
        assert!(monitor.transition_to(ConnectionState::Error, Some("attempts exhausted")));
        assert_eq!(monitor.state(), ConnectionState::Error);

        assert!(monitor.transition_to(ConnectionState::Reconnecting, Some("manual retry")));
        assert!(monitor.transition_to(ConnectionState::Connected, None));
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_watch_signal_follows_reachability() {
        let monitor = ConnectionMonitor::new();
        let signal = ManualNetworkSignal::new(false);
        let _watcher = monitor.watch_signal(&signal);
        assert_eq!(monitor.state(), ConnectionState::Disconnected);

        signal.set_online(true);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(monitor.is_online());

        signal.set_online(false);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(monitor.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_watch_signal_applies_initial_reachability() {
        let monitor = ConnectionMonitor::new();
        let signal = ManualNetworkSignal::new(true);
        let _watcher = monitor.watch_signal(&signal);
        assert!(monitor.is_online());
    }
}
