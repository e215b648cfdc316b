//! Terminal runtime.
//!
//! Owns the database handle and every component built on it. `start` spawns
//! the background loops (health probe, transition listener, periodic sync);
//! `shutdown` stops them between passes and checkpoints the database.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::RemoteApi;
use crate::config::TerminalConfig;
use crate::connectivity::{self, ConnectivityMonitor};
use crate::db::{self, DbState};
use crate::error::Result;
use crate::intake::SaleIntake;
use crate::models::{
    Collection, ConnectivityState, PendingSale, ReferenceItem, SaleReceipt, SaleStatus, SyncStatus,
};
use crate::payment_poll::PaymentPoller;
use crate::refresh::{self, ReferenceCacheRefresher};
use crate::store::LocalStore;
use crate::sync::{self, PassOutcome, SyncEngine};

pub struct Terminal<R> {
    config: TerminalConfig,
    db: Arc<DbState>,
    store: LocalStore,
    intake: SaleIntake,
    remote: Arc<R>,
    monitor: Arc<ConnectivityMonitor>,
    engine: Arc<SyncEngine<R>>,
    refresher: Arc<ReferenceCacheRefresher<R>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<R: RemoteApi> Terminal<R> {
    /// Open the database under `config.data_dir` and build the terminal.
    pub fn open(config: TerminalConfig, remote: R) -> Result<Self> {
        let db = Arc::new(db::init(&config.data_dir)?);
        Ok(Self::with_db(db, config, remote))
    }

    /// Build the terminal on an already opened database.
    pub fn with_db(db: Arc<DbState>, config: TerminalConfig, remote: R) -> Self {
        let store = LocalStore::new(db.clone());
        let remote = Arc::new(remote);
        let monitor = Arc::new(ConnectivityMonitor::default());
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            remote.clone(),
            monitor.clone(),
        ));
        let refresher = Arc::new(ReferenceCacheRefresher::new(store.clone(), remote.clone()));

        Self {
            config,
            db,
            intake: SaleIntake::new(store.clone()),
            store,
            remote,
            monitor,
            engine,
            refresher,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the background loops. Calling `start` twice is a no-op.
    pub fn start(&self) {
        let Ok(mut tasks) = self.tasks.lock() else {
            warn!("terminal task list poisoned; background loops not started");
            return;
        };
        if !tasks.is_empty() {
            return;
        }

        // Subscribe before the first probe so its transition is observed.
        tasks.push(tokio::spawn(transition_listener(
            self.monitor.subscribe(),
            self.engine.clone(),
            self.refresher.clone(),
            self.cancel.clone(),
        )));
        tasks.push(tokio::spawn(connectivity::run_probe_loop(
            self.monitor.clone(),
            self.remote.clone(),
            self.config.probe_interval(),
            self.cancel.clone(),
        )));
        tasks.push(tokio::spawn(sync::start_sync_loop(
            self.engine.clone(),
            self.config.sync_interval(),
            self.cancel.clone(),
        )));

        info!(
            server_url = %self.config.server_url,
            data_dir = %self.config.data_dir.display(),
            "terminal started"
        );
    }

    /// Stop the background loops, wait for them, and checkpoint the database.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        let tasks = match self.tasks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!("background task ended abnormally: {e}");
            }
        }
        db::close(&self.db)?;
        info!("terminal shut down");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // UI boundary
    // -----------------------------------------------------------------------

    pub fn record_sale(&self, payload: Value) -> Result<SaleReceipt> {
        self.intake.record_sale(payload)
    }

    pub fn sale_by_reference(&self, local_reference: &str) -> Result<Option<PendingSale>> {
        self.intake.sale_by_reference(local_reference)
    }

    pub fn list_sales(&self, status: Option<SaleStatus>) -> Result<Vec<PendingSale>> {
        self.intake.list_sales(status)
    }

    pub fn find_reference_items(
        &self,
        collection: Collection,
        term: &str,
    ) -> Result<Vec<ReferenceItem>> {
        refresh::find_reference_items(&self.store, collection, term)
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.monitor.state()
    }

    /// Feed a host-side network signal into the monitor.
    pub fn set_connectivity(&self, state: ConnectivityState) -> bool {
        self.monitor.set_state(state)
    }

    pub fn sync_status(&self) -> Result<SyncStatus> {
        self.engine.sync_status()
    }

    /// Run a sync pass now. Skipped when offline or already in flight.
    pub async fn sync_now(&self) -> Result<PassOutcome> {
        self.engine.run_pass().await
    }

    pub fn payment_poller(&self) -> PaymentPoller<R> {
        PaymentPoller::new(
            self.remote.clone(),
            self.config.payment_poll_interval(),
            self.config.payment_poll_max_attempts,
        )
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.config
    }
}

/// On every transition to online, refresh both reference collections and run
/// a sync pass, each as a detached task.
async fn transition_listener<R: RemoteApi>(
    mut rx: tokio::sync::watch::Receiver<ConnectivityState>,
    engine: Arc<SyncEngine<R>>,
    refresher: Arc<ReferenceCacheRefresher<R>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *rx.borrow_and_update();
                if !state.is_online() {
                    continue;
                }
                info!("Network restored; refreshing caches and resuming sync");

                let refresher = refresher.clone();
                tokio::spawn(async move {
                    refresher.refresh_all().await;
                });
                let engine = engine.clone();
                tokio::spawn(async move {
                    if let Err(e) = engine.run_pass().await {
                        warn!("Sync pass failed: {e}");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{PaymentStatusResponse, SubmitOutcome};
    use crate::error::OfflineError;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Backend {
        healthy: AtomicBool,
        accepted: AtomicUsize,
    }

    impl RemoteApi for Backend {
        async fn submit_sale(&self, _body: &Value) -> crate::error::Result<SubmitOutcome> {
            let n = self.accepted.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(SubmitOutcome::Accepted {
                server_reference: format!("SALE-{n:08}"),
            })
        }

        async fn fetch_collection(
            &self,
            collection: Collection,
        ) -> crate::error::Result<Vec<Value>> {
            Ok(match collection {
                Collection::Products => {
                    vec![json!({ "id": 1, "name": "Milk 500ml", "barcode": "600500" })]
                }
                Collection::Customers => {
                    vec![json!({ "id": 1, "name": "Amina", "phone": "0700111222" })]
                }
            })
        }

        async fn check_health(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        async fn payment_status(&self, _id: &str) -> crate::error::Result<PaymentStatusResponse> {
            Err(OfflineError::TransportFailure("unused".into()))
        }
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("pos_offline_terminal_{}", uuid::Uuid::new_v4()))
    }

    fn open(dir: &PathBuf, healthy: bool) -> Terminal<Backend> {
        let backend = Backend::default();
        backend.healthy.store(healthy, Ordering::SeqCst);
        Terminal::open(TerminalConfig::defaults(dir.clone()), backend).unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_offline_sale_syncs_when_terminal_comes_online() {
        let dir = temp_dir();
        let terminal = open(&dir, true);
        let receipt = terminal
            .record_sale(json!({ "total_amount": 60, "payment_method": "cash" }))
            .unwrap();
        assert_eq!(terminal.connectivity(), ConnectivityState::Offline);

        terminal.start();
        assert!(
            wait_until(|| terminal.sync_status().map(|s| s.synced == 1).unwrap_or(false)).await
        );
        assert!(
            wait_until(|| terminal
                .find_reference_items(Collection::Customers, "")
                .map(|items| items.len() == 1)
                .unwrap_or(false))
            .await
        );

        let sale = terminal
            .sale_by_reference(&receipt.local_reference)
            .unwrap()
            .unwrap();
        assert_eq!(sale.status, SaleStatus::Synced);
        assert_eq!(
            terminal
                .find_reference_items(Collection::Products, "milk")
                .unwrap()
                .len(),
            1
        );

        terminal.shutdown().await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_sync_now_respects_connectivity() {
        let dir = temp_dir();
        let terminal = open(&dir, false);
        terminal.record_sale(json!({ "total_amount": 5 })).unwrap();

        assert_eq!(
            terminal.sync_now().await.unwrap(),
            PassOutcome::Skipped(sync::SkipReason::Offline)
        );
        assert!(terminal.set_connectivity(ConnectivityState::Online));
        assert!(matches!(
            terminal.sync_now().await.unwrap(),
            PassOutcome::Completed(report) if report.synced == 1
        ));
        assert_eq!(terminal.list_sales(Some(SaleStatus::Pending)).unwrap().len(), 0);

        terminal.shutdown().await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_pending_sales_survive_restart() {
        let dir = temp_dir();
        let reference = {
            let terminal = open(&dir, false);
            let receipt = terminal.record_sale(json!({ "total_amount": 42 })).unwrap();
            terminal.shutdown().await.unwrap();
            receipt.local_reference
        };

        let terminal = open(&dir, false);
        let sale = terminal.sale_by_reference(&reference).unwrap().unwrap();
        assert_eq!(sale.status, SaleStatus::Pending);
        assert_eq!(sale.payload["total_amount"], json!(42));
        terminal.shutdown().await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
