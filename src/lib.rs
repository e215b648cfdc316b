//! POS Offline Core
//!
//! Keeps a point-of-sale terminal selling while the server is unreachable.
//! Sales are written to a local SQLite store before checkout returns, then
//! submitted in the background once connectivity comes back. Product and
//! customer lists are cached locally and refreshed on every reconnect.

use std::path::PathBuf;

use anyhow::Context;
use tracing::info;

pub mod api;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod intake;
pub mod logging;
pub mod models;
pub mod payment_poll;
pub mod refresh;
pub mod store;
pub mod sync;
pub mod terminal;

pub use api::{HttpRemote, RemoteApi, SubmitOutcome};
pub use config::TerminalConfig;
pub use connectivity::ConnectivityMonitor;
pub use error::{OfflineError, Result};
pub use models::{
    Collection, ConnectivityState, PendingSale, ReferenceItem, SaleReceipt, SaleStatus,
    SyncReport, SyncStatus,
};
pub use payment_poll::{PaymentOutcome, PaymentPoller};
pub use sync::{PassOutcome, SkipReason};
pub use terminal::Terminal;

/// Open the terminal against the configured server and run until Ctrl-C.
pub async fn run() -> anyhow::Result<()> {
    let data_dir: PathBuf = config::resolve_data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("create data directory {}", data_dir.display()))?;

    let _guard = logging::init(&logging::log_dir(&data_dir));
    info!(
        "Starting POS offline core v{} ({}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_GIT_SHA"),
        env!("BUILD_TIMESTAMP")
    );

    let db = std::sync::Arc::new(db::init(&data_dir).context("open local database")?);
    let config = {
        let conn = db.lock().context("lock local database")?;
        TerminalConfig::load(&conn, data_dir.clone()).context("load terminal configuration")?
    };
    api::describe(&config);

    let remote = HttpRemote::new(&config).context("build server API client")?;
    let terminal = Terminal::with_db(db, config, remote);
    terminal.start();

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!("Shutdown requested");

    terminal.shutdown().await.context("shut down terminal")?;
    Ok(())
}
