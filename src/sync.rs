//! Background sync engine.
//!
//! Submits `pending` sales to the server and records the outcome on each one.
//! Delivery is at-least-once: a sale whose submission got no definitive
//! answer stays `pending` and is resubmitted on a later pass, carrying the
//! same `local_reference` so the server can deduplicate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{RemoteApi, SubmitOutcome};
use crate::connectivity::ConnectivityMonitor;
use crate::error::{OfflineError, Result};
use crate::models::{PendingSale, SaleStatus, SyncReport, SyncStatus};
use crate::store::LocalStore;

/// Payload keys that belong to local bookkeeping and are never sent.
const BOOKKEEPING_KEYS: &[&str] = &["local_id", "created_at", "status"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Skipped(SkipReason),
    Completed(SyncReport),
}

/// Outbound body for one sale: the payload plus `local_reference`, without
/// bookkeeping fields.
pub fn build_outbound_body(sale: &PendingSale) -> Value {
    let mut body = match &sale.payload {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    for key in BOOKKEEPING_KEYS {
        body.remove(*key);
    }
    body.insert(
        "local_reference".to_string(),
        Value::String(sale.local_reference.clone()),
    );
    Value::Object(body)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine<R> {
    store: LocalStore,
    remote: Arc<R>,
    monitor: Arc<ConnectivityMonitor>,
    in_flight: AtomicBool,
    last_sync: Mutex<Option<String>>,
}

/// Clears the in-flight flag when a pass ends, including on early return.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<R: RemoteApi> SyncEngine<R> {
    pub fn new(store: LocalStore, remote: Arc<R>, monitor: Arc<ConnectivityMonitor>) -> Self {
        Self {
            store,
            remote,
            monitor,
            in_flight: AtomicBool::new(false),
            last_sync: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// RFC 3339 time of the last completed pass.
    pub fn last_sync(&self) -> Option<String> {
        self.last_sync.lock().ok().and_then(|guard| guard.clone())
    }

    /// Run one pass over the pending sales.
    ///
    /// Returns immediately when offline or when another pass is in flight.
    /// Only a failure to list pending sales is returned as an error; failures
    /// on individual sales are logged and the pass moves on.
    pub async fn run_pass(&self) -> Result<PassOutcome> {
        if !self.monitor.is_online() {
            debug!("Skipping sync - offline");
            return Ok(PassOutcome::Skipped(SkipReason::Offline));
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Skipping sync - a pass is already in flight");
            return Ok(PassOutcome::Skipped(SkipReason::AlreadyRunning));
        }
        let _guard = InFlightGuard(&self.in_flight);

        let pending = self.store.sales_by_status(SaleStatus::Pending)?;
        let mut report = SyncReport::default();

        for sale in pending {
            report.attempted += 1;
            let body = build_outbound_body(&sale);

            match self.remote.submit_sale(&body).await {
                Ok(SubmitOutcome::Accepted { server_reference }) => {
                    match self.store.mark_synced(sale.local_id, &server_reference) {
                        Ok(false) => {}
                        Ok(true) => {
                            report.synced += 1;
                            info!(
                                local_reference = %sale.local_reference,
                                server_reference = %server_reference,
                                "offline sale synced"
                            );
                        }
                        Err(e) => error!(
                            local_id = sale.local_id,
                            error = %e,
                            "failed to mark sale synced"
                        ),
                    }
                }
                Ok(SubmitOutcome::Rejected { message }) => {
                    let rejection = OfflineError::ServerRejected(message).to_string();
                    match self.store.mark_failed(sale.local_id, &rejection) {
                        Ok(false) => {}
                        Ok(true) => {
                            report.rejected += 1;
                            warn!(
                                local_reference = %sale.local_reference,
                                error = %rejection,
                                "offline sale rejected by server"
                            );
                        }
                        Err(e) => error!(
                            local_id = sale.local_id,
                            error = %e,
                            "failed to mark sale failed"
                        ),
                    }
                }
                Err(e) => {
                    report.deferred += 1;
                    warn!(
                        local_reference = %sale.local_reference,
                        error = %e,
                        "sale submission deferred"
                    );
                }
            }
        }

        if let Ok(mut guard) = self.last_sync.lock() {
            *guard = Some(Utc::now().to_rfc3339());
        }
        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                synced = report.synced,
                rejected = report.rejected,
                deferred = report.deferred,
                "Sync pass complete"
            );
        }
        Ok(PassOutcome::Completed(report))
    }

    /// Counts per status plus connectivity and last-pass time.
    pub fn sync_status(&self) -> Result<SyncStatus> {
        let counts = self.store.status_counts()?;
        Ok(SyncStatus {
            is_online: self.monitor.is_online(),
            pending: counts.pending,
            synced: counts.synced,
            failed: counts.failed,
            last_sync: self.last_sync(),
        })
    }
}

/// Run a pass every `interval` until `cancel` fires. Passes are never
/// interrupted; cancellation is observed between passes.
pub async fn start_sync_loop<R: RemoteApi>(
    engine: Arc<SyncEngine<R>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!("Sync loop started (interval: {}s)", interval.as_secs());
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = engine.run_pass().await {
                    warn!("Sync pass failed: {e}");
                }
            }
        }
    }
    info!("Sync loop stopped");
}
