//! Structured logging: console plus a daily rolling file under the data dir.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_FILE_PREFIX: &str = "pos-offline";
pub const MAX_LOG_FILES: usize = 14;

const DEFAULT_FILTER: &str = "info,pos_offline_core=debug";
const JSON_ENV: &str = "POS_OFFLINE_LOG_JSON";

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Install the global subscriber. Keep the returned guard alive for the life
/// of the process; dropping it flushes and stops the file writer.
pub fn init(log_dir: &Path) -> WorkerGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    prune_old_logs(log_dir, MAX_LOG_FILES);
    fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // POS_OFFLINE_LOG_JSON=1 switches the file to one JSON object per line.
    let json = std::env::var(JSON_ENV)
        .map(|v| matches!(v.trim(), "1" | "true"))
        .unwrap_or(false);
    let json_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_writer(non_blocking.clone())
            .with_target(true)
    });
    let file_layer = (!json).then(|| {
        fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
    });
    let console_layer = fmt::layer().with_target(true);

    if let Err(e) = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .with(json_layer)
        .try_init()
    {
        eprintln!("logging already initialised: {e}");
    }

    guard
}

/// Delete rolled log files beyond the newest `keep`.
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> usize {
    if !log_dir.exists() {
        return 0;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|name| name.starts_with(LOG_FILE_PREFIX))
                .unwrap_or(false);
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}
