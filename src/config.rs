//! Terminal configuration.
//!
//! Resolved in three layers: built-in defaults, then overrides persisted in
//! `local_settings` (category `terminal`), then `POS_OFFLINE_*` environment
//! variables.

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::Connection;
use serde::Serialize;
use tracing::debug;

use crate::db;
use crate::error::{OfflineError, Result};

/// `local_settings` category holding configuration overrides.
pub const SETTINGS_CATEGORY: &str = "terminal";

const ENV_PREFIX: &str = "POS_OFFLINE_";
const APP_DIR_NAME: &str = "com.thesmall.pos-offline";

/// Keys accepted in `local_settings` and as `POS_OFFLINE_<KEY>` variables.
const OVERRIDE_KEYS: &[&str] = &[
    "server_url",
    "sale_path",
    "products_path",
    "customers_path",
    "health_path",
    "payment_status_path",
    "request_timeout_secs",
    "probe_timeout_secs",
    "probe_interval_secs",
    "sync_interval_secs",
    "payment_poll_interval_secs",
    "payment_poll_max_attempts",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminalConfig {
    pub data_dir: PathBuf,
    pub server_url: String,
    pub sale_path: String,
    pub products_path: String,
    pub customers_path: String,
    pub health_path: String,
    pub payment_status_path: String,
    pub request_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub probe_interval_secs: u64,
    pub sync_interval_secs: u64,
    pub payment_poll_interval_secs: u64,
    pub payment_poll_max_attempts: u32,
}

impl TerminalConfig {
    pub fn defaults(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            server_url: "http://localhost:5000".to_string(),
            sale_path: "/pos/checkout".to_string(),
            products_path: "/api/products".to_string(),
            customers_path: "/api/customers".to_string(),
            health_path: "/api/health".to_string(),
            payment_status_path: "/pos/check-payment-status".to_string(),
            request_timeout_secs: 15,
            probe_timeout_secs: 5,
            probe_interval_secs: 15,
            sync_interval_secs: 30,
            payment_poll_interval_secs: 5,
            payment_poll_max_attempts: 12,
        }
    }

    /// Resolve the full configuration against an open database.
    pub fn load(conn: &Connection, data_dir: PathBuf) -> Result<Self> {
        let mut config = Self::defaults(data_dir);
        config.apply_overrides(|key| db::get_setting(conn, SETTINGS_CATEGORY, key))?;
        config.apply_overrides(env_override)?;
        config.validate()?;
        debug!(config = ?config, "terminal configuration resolved");
        Ok(config)
    }

    /// Persist one override into `local_settings`. The value is validated
    /// before it is written.
    pub fn persist_override(conn: &Connection, key: &str, value: &str) -> Result<()> {
        if !OVERRIDE_KEYS.contains(&key) {
            return Err(OfflineError::Config(format!("unknown setting '{key}'")));
        }
        let mut probe = Self::defaults(PathBuf::new());
        probe.apply_overrides(|k| (k == key).then(|| value.to_string()))?;
        probe.validate()?;
        db::set_setting(conn, SETTINGS_CATEGORY, key, value.trim())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        for key in OVERRIDE_KEYS {
            let Some(raw) = lookup(key) else { continue };
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            match *key {
                "server_url" => self.server_url = normalize_server_url(raw),
                "sale_path" => self.sale_path = normalize_path(raw),
                "products_path" => self.products_path = normalize_path(raw),
                "customers_path" => self.customers_path = normalize_path(raw),
                "health_path" => self.health_path = normalize_path(raw),
                "payment_status_path" => self.payment_status_path = normalize_path(raw),
                "request_timeout_secs" => self.request_timeout_secs = parse_number(key, raw)?,
                "probe_timeout_secs" => self.probe_timeout_secs = parse_number(key, raw)?,
                "probe_interval_secs" => self.probe_interval_secs = parse_number(key, raw)?,
                "sync_interval_secs" => self.sync_interval_secs = parse_number(key, raw)?,
                "payment_poll_interval_secs" => {
                    self.payment_poll_interval_secs = parse_number(key, raw)?
                }
                "payment_poll_max_attempts" => {
                    self.payment_poll_max_attempts = parse_number(key, raw)?
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            return Err(OfflineError::Config("server_url is empty".into()));
        }
        let zero = [
            ("request_timeout_secs", self.request_timeout_secs),
            ("probe_timeout_secs", self.probe_timeout_secs),
            ("probe_interval_secs", self.probe_interval_secs),
            ("sync_interval_secs", self.sync_interval_secs),
            ("payment_poll_interval_secs", self.payment_poll_interval_secs),
            (
                "payment_poll_max_attempts",
                u64::from(self.payment_poll_max_attempts),
            ),
        ]
        .into_iter()
        .find(|(_, value)| *value == 0);
        if let Some((key, _)) = zero {
            return Err(OfflineError::Config(format!("{key} must be greater than zero")));
        }
        Ok(())
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.server_url, path)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn payment_poll_interval(&self) -> Duration {
        Duration::from_secs(self.payment_poll_interval_secs)
    }
}

/// Data directory: `POS_OFFLINE_DATA_DIR`, else the platform app-data folder.
pub fn resolve_data_dir() -> PathBuf {
    if let Some(dir) = env_override("data_dir") {
        return PathBuf::from(dir);
    }
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join(APP_DIR_NAME)
}

fn env_override(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{}", key.to_uppercase()))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| OfflineError::Config(format!("{key}: '{raw}' is not a valid number")))
}

fn normalize_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Normalise the server URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/api` segment
pub fn normalize_server_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}
