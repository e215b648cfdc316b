//! Local SQLite database layer for the offline core.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings helpers
//! and the shared connection state owned by the terminal runtime.

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info};

use crate::error::{OfflineError, Result};

/// Database file name inside the terminal data directory.
pub const DB_FILE_NAME: &str = "pos-offline.db";

/// Shared database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Lock the connection, mapping a poisoned lock to `StorageUnavailable`.
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| OfflineError::storage(format!("connection lock poisoned: {e}")))
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Initialize the database at `{data_dir}/pos-offline.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. A file that cannot be opened or migrated
/// is left on disk untouched and the error is returned; it may hold sales
/// that never reached the server.
pub fn init(data_dir: &Path) -> Result<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| OfflineError::storage(format!("failed to create data dir: {e}")))?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let conn = open_and_configure(&db_path)
        .and_then(|c| {
            run_migrations(&c)?;
            Ok(c)
        })
        .map_err(|e| {
            error!(
                path = %db_path.display(),
                error = %e,
                "Database unusable; file left in place for recovery"
            );
            e
        })?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open an in-memory database with the full schema.
pub fn init_in_memory() -> Result<DbState> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Flush the WAL into the main database file before the process exits.
pub fn close(db: &DbState) -> Result<()> {
    let conn = db.lock()?;
    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
        .optional()?;
    info!("Database closed ({})", db.db_path.display());
    Ok(())
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .map_err(|e| OfflineError::storage(format!("sqlite open: {e}")))?;

    // synchronous = FULL: a recorded sale must survive power loss.
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = FULL;",
    )
    .map_err(|e| OfflineError::storage(format!("pragma setup: {e}")))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| OfflineError::storage(format!("create schema_version: {e}")))?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: settings and the offline sales queue.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );

        -- AUTOINCREMENT: local_id is never reused, even after the highest row is gone.
        CREATE TABLE IF NOT EXISTS offline_sales (
            local_id INTEGER PRIMARY KEY AUTOINCREMENT,
            local_reference TEXT NOT NULL UNIQUE,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'synced', 'failed')),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            server_reference TEXT,
            last_error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_offline_sales_status ON offline_sales(status);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        OfflineError::storage(format!("migration v1: {e}"))
    })?;

    info!("Applied migration v1 (offline_sales, local_settings)");
    Ok(())
}

/// Migration v2: reference caches for offline product and customer lookup.
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS products_cache (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            unique_key TEXT UNIQUE,
            data TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_products_cache_name ON products_cache(name);

        CREATE TABLE IF NOT EXISTS customers_cache (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            unique_key TEXT UNIQUE,
            data TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_customers_cache_name ON customers_cache(name);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        OfflineError::storage(format!("migration v2: {e}"))
    })?;

    info!("Applied migration v2 (products_cache, customers_cache)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
