//! Connectivity monitor.
//!
//! Holds the terminal's current online/offline state and broadcasts
//! transitions over a `watch` channel. The state is fed either by the health
//! probe loop below or directly by a host that has its own network signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::RemoteApi;
use crate::models::ConnectivityState;

#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<ConnectivityState>,
}

impl ConnectivityMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    /// Record the latest observation. Returns `true` when the state changed;
    /// subscribers are only woken on a change.
    pub fn set_state(&self, next: ConnectivityState) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(state = ?next, "connectivity changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectivityState::Offline)
    }
}

/// Probe the server health endpoint once and feed the result into `monitor`.
pub async fn probe_once<R: RemoteApi>(monitor: &ConnectivityMonitor, remote: &R) -> bool {
    let online = remote.check_health().await;
    let state = if online {
        ConnectivityState::Online
    } else {
        ConnectivityState::Offline
    };
    monitor.set_state(state)
}

/// Probe immediately, then every `interval`, until `cancel` fires.
pub async fn run_probe_loop<R: RemoteApi>(
    monitor: Arc<ConnectivityMonitor>,
    remote: Arc<R>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!("Connectivity probe started (interval: {}s)", interval.as_secs());
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let changed = probe_once(&monitor, remote.as_ref()).await;
                debug!(online = monitor.is_online(), changed, "connectivity probed");
            }
        }
    }
    info!("Connectivity probe stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{PaymentStatusResponse, SubmitOutcome};
    use crate::error::{OfflineError, Result};
    use crate::models::Collection;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct HealthOnly {
        healthy: AtomicBool,
        probes: AtomicUsize,
    }

    impl RemoteApi for HealthOnly {
        async fn submit_sale(&self, _body: &Value) -> Result<SubmitOutcome> {
            Err(OfflineError::TransportFailure("unused".into()))
        }

        async fn fetch_collection(&self, _collection: Collection) -> Result<Vec<Value>> {
            Ok(Vec::new())
        }

        async fn check_health(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.healthy.load(Ordering::SeqCst)
        }

        async fn payment_status(&self, _id: &str) -> Result<PaymentStatusResponse> {
            Err(OfflineError::TransportFailure("unused".into()))
        }
    }

    #[test]
    fn test_set_state_reports_transitions_only() {
        let monitor = ConnectivityMonitor::default();
        assert!(!monitor.is_online());
        assert!(!monitor.set_state(ConnectivityState::Offline));
        assert!(monitor.set_state(ConnectivityState::Online));
        assert!(monitor.is_online());
        assert!(!monitor.set_state(ConnectivityState::Online));
        assert!(monitor.set_state(ConnectivityState::Offline));
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let monitor = ConnectivityMonitor::default();
        let mut rx = monitor.subscribe();
        monitor.set_state(ConnectivityState::Offline);
        assert!(!rx.has_changed().unwrap());

        monitor.set_state(ConnectivityState::Online);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectivityState::Online);
    }

    #[tokio::test]
    async fn test_probe_once_follows_health() {
        let monitor = ConnectivityMonitor::default();
        let remote = HealthOnly::default();
        assert!(!probe_once(&monitor, &remote).await);

        remote.healthy.store(true, Ordering::SeqCst);
        assert!(probe_once(&monitor, &remote).await);
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_probe_loop_stops_on_cancel() {
        let monitor = Arc::new(ConnectivityMonitor::default());
        let remote = Arc::new(HealthOnly::default());
        remote.healthy.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_probe_loop(
            monitor.clone(),
            remote.clone(),
            Duration::from_millis(20),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(90)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(monitor.is_online());
        let probes = remote.probes.load(Ordering::SeqCst);
        assert!(probes >= 2, "expected repeated probes, got {probes}");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(remote.probes.load(Ordering::SeqCst), probes);
    }
}
