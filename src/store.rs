//! Local durable store.
//!
//! Three collections live in the SQLite database opened by [`crate::db`]:
//! the offline sales queue and the product/customer reference caches. Every
//! logical unit of work (one sale insert, one status transition, one
//! collection replace) is a single statement or a single transaction, and all
//! access goes through the one connection mutex, so readers never observe a
//! half-applied unit.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::{debug, warn};

use crate::db::DbState;
use crate::error::{OfflineError, Result};
use crate::models::{Collection, PendingSale, ReferenceItem, SaleStatus};

const SALE_COLUMNS: &str = "local_id, local_reference, payload, status, created_at, updated_at, \
                            server_reference, last_error";

/// Secondary-index lookup on a reference collection. Exact match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceIndex<'a> {
    Name(&'a str),
    /// Barcode for products, phone for customers.
    UniqueKey(&'a str),
}

/// Per-status sale counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: i64,
    pub synced: i64,
    pub failed: i64,
}

#[derive(Clone)]
pub struct LocalStore {
    db: Arc<DbState>,
}

impl LocalStore {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    // -----------------------------------------------------------------------
    // Sales
    // -----------------------------------------------------------------------

    /// Insert a new `pending` sale. `local_id` is assigned by SQLite and is
    /// never reused.
    pub fn insert_sale(
        &self,
        local_reference: &str,
        payload: &Value,
        created_at: DateTime<Utc>,
    ) -> Result<PendingSale> {
        let payload_json = serde_json::to_string(payload)
            .map_err(|e| OfflineError::storage(format!("serialize payload: {e}")))?;
        let stamp = format_ts(created_at);

        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO offline_sales (local_reference, payload, status, created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, ?3)",
            params![local_reference, payload_json, stamp],
        )?;
        let local_id = conn.last_insert_rowid();
        debug!(local_id, local_reference, "offline sale inserted");

        Ok(PendingSale {
            local_id,
            local_reference: local_reference.to_string(),
            payload: payload.clone(),
            status: SaleStatus::Pending,
            created_at: parse_ts(&stamp).unwrap_or(created_at),
            updated_at: parse_ts(&stamp).unwrap_or(created_at),
            server_reference: None,
            last_error: None,
        })
    }

    pub fn get_sale(&self, local_id: i64) -> Result<Option<PendingSale>> {
        let conn = self.db.lock()?;
        let sale = conn
            .query_row(
                &format!("SELECT {SALE_COLUMNS} FROM offline_sales WHERE local_id = ?1"),
                params![local_id],
                row_to_sale,
            )
            .optional()?;
        Ok(sale)
    }

    pub fn sale_by_reference(&self, local_reference: &str) -> Result<Option<PendingSale>> {
        let conn = self.db.lock()?;
        let sale = conn
            .query_row(
                &format!("SELECT {SALE_COLUMNS} FROM offline_sales WHERE local_reference = ?1"),
                params![local_reference],
                row_to_sale,
            )
            .optional()?;
        Ok(sale)
    }

    /// Sales with the given status, via the status index. Unordered.
    pub fn sales_by_status(&self, status: SaleStatus) -> Result<Vec<PendingSale>> {
        let conn = self.db.lock()?;
        query_sales(
            &conn,
            &format!("SELECT {SALE_COLUMNS} FROM offline_sales WHERE status = ?1"),
            params![status.as_str()],
        )
    }

    /// Every recorded sale, newest first.
    pub fn all_sales(&self) -> Result<Vec<PendingSale>> {
        let conn = self.db.lock()?;
        query_sales(
            &conn,
            &format!("SELECT {SALE_COLUMNS} FROM offline_sales ORDER BY local_id DESC"),
            [],
        )
    }

    /// Move a pending sale to `synced`. Returns `false` when the sale was not
    /// pending (terminal states are never left).
    pub fn mark_synced(&self, local_id: i64, server_reference: &str) -> Result<bool> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE offline_sales
             SET status = 'synced',
                 server_reference = ?2,
                 last_error = NULL,
                 updated_at = ?3
             WHERE local_id = ?1 AND status = 'pending'",
            params![local_id, server_reference, format_ts(Utc::now())],
        )?;
        if changed == 0 {
            warn!(local_id, "mark_synced ignored: sale is not pending");
        }
        Ok(changed == 1)
    }

    /// Move a pending sale to `failed`. Returns `false` when the sale was not
    /// pending.
    pub fn mark_failed(&self, local_id: i64, error: &str) -> Result<bool> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE offline_sales
             SET status = 'failed',
                 last_error = ?2,
                 updated_at = ?3
             WHERE local_id = ?1 AND status = 'pending'",
            params![local_id, error, format_ts(Utc::now())],
        )?;
        if changed == 0 {
            warn!(local_id, "mark_failed ignored: sale is not pending");
        }
        Ok(changed == 1)
    }

    pub fn status_counts(&self) -> Result<StatusCounts> {
        let conn = self.db.lock()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM offline_sales GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, count) = row?;
            match SaleStatus::parse(&status) {
                Some(SaleStatus::Pending) => counts.pending = count,
                Some(SaleStatus::Synced) => counts.synced = count,
                Some(SaleStatus::Failed) => counts.failed = count,
                None => warn!(status = %status, "unknown sale status in offline_sales"),
            }
        }
        Ok(counts)
    }

    // -----------------------------------------------------------------------
    // Reference caches
    // -----------------------------------------------------------------------

    /// Insert or overwrite one cached item by id.
    pub fn put_reference(&self, collection: Collection, item: &ReferenceItem) -> Result<()> {
        let conn = self.db.lock()?;
        put_reference_row(&conn, collection, item)
    }

    pub fn get_reference(&self, collection: Collection, id: &str) -> Result<Option<ReferenceItem>> {
        let conn = self.db.lock()?;
        let item = conn
            .query_row(
                &format!(
                    "SELECT id, name, unique_key, data FROM {} WHERE id = ?1",
                    collection.table()
                ),
                params![id],
                row_to_reference,
            )
            .optional()?;
        Ok(item)
    }

    /// Iterate a reference collection, optionally through one of its indexes.
    /// Unordered.
    pub fn iterate_references(
        &self,
        collection: Collection,
        index: Option<ReferenceIndex<'_>>,
    ) -> Result<Vec<ReferenceItem>> {
        let table = collection.table();
        let conn = self.db.lock()?;
        let (sql, arg) = match index {
            None => (format!("SELECT id, name, unique_key, data FROM {table}"), None),
            Some(ReferenceIndex::Name(name)) => (
                format!("SELECT id, name, unique_key, data FROM {table} WHERE name = ?1"),
                Some(name),
            ),
            Some(ReferenceIndex::UniqueKey(key)) => (
                format!("SELECT id, name, unique_key, data FROM {table} WHERE unique_key = ?1"),
                Some(key),
            ),
        };

        let mut stmt = conn.prepare(&sql)?;
        let rows = match arg {
            Some(value) => stmt
                .query_map(params![value], row_to_reference)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map([], row_to_reference)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(rows)
    }

    pub fn count_references(&self, collection: Collection) -> Result<i64> {
        let conn = self.db.lock()?;
        let count = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", collection.table()),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Remove every cached item in the collection.
    pub fn clear_references(&self, collection: Collection) -> Result<usize> {
        let conn = self.db.lock()?;
        let removed = conn.execute(&format!("DELETE FROM {}", collection.table()), [])?;
        Ok(removed)
    }

    /// Clear the collection and write `items` in one transaction. On any error
    /// the transaction rolls back and the previous contents stay in place.
    pub fn replace_references(
        &self,
        collection: Collection,
        items: &[ReferenceItem],
    ) -> Result<usize> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        tx.execute(&format!("DELETE FROM {}", collection.table()), [])?;
        for item in items {
            put_reference_row(&tx, collection, item)?;
        }
        tx.commit()?;
        debug!(
            collection = collection.as_str(),
            count = items.len(),
            "reference cache replaced"
        );
        Ok(items.len())
    }
}

fn put_reference_row(
    conn: &Connection,
    collection: Collection,
    item: &ReferenceItem,
) -> Result<()> {
    let data = serde_json::to_string(&item.data)
        .map_err(|e| OfflineError::storage(format!("serialize reference item: {e}")))?;
    conn.execute(
        &format!(
            "INSERT INTO {} (id, name, unique_key, data) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                unique_key = excluded.unique_key,
                data = excluded.data",
            collection.table()
        ),
        params![item.id, item.name, item.unique_key, data],
    )?;
    Ok(())
}

fn query_sales<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<PendingSale>> {
    let mut stmt = conn.prepare(sql)?;
    let sales = stmt
        .query_map(params, row_to_sale)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(sales)
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn row_to_sale(row: &Row<'_>) -> rusqlite::Result<PendingSale> {
    let payload_str: String = row.get(2)?;
    let payload = serde_json::from_str(&payload_str)
        .map_err(|e| conversion_error(2, format!("invalid payload JSON: {e}")))?;

    let status_str: String = row.get(3)?;
    let status = SaleStatus::parse(&status_str)
        .ok_or_else(|| conversion_error(3, format!("unknown sale status '{status_str}'")))?;

    let created_str: String = row.get(4)?;
    let created_at = parse_ts(&created_str)
        .ok_or_else(|| conversion_error(4, format!("invalid created_at '{created_str}'")))?;
    let updated_str: String = row.get(5)?;
    let updated_at = parse_ts(&updated_str)
        .ok_or_else(|| conversion_error(5, format!("invalid updated_at '{updated_str}'")))?;

    Ok(PendingSale {
        local_id: row.get(0)?,
        local_reference: row.get(1)?,
        payload,
        status,
        created_at,
        updated_at,
        server_reference: row.get(6)?,
        last_error: row.get(7)?,
    })
}

fn row_to_reference(row: &Row<'_>) -> rusqlite::Result<ReferenceItem> {
    let data_str: String = row.get(3)?;
    let data = serde_json::from_str(&data_str)
        .map_err(|e| conversion_error(3, format!("invalid reference JSON: {e}")))?;
    Ok(ReferenceItem {
        id: row.get(0)?,
        name: row.get(1)?,
        unique_key: row.get(2)?,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;

    fn test_store() -> LocalStore {
        LocalStore::new(Arc::new(db::init_in_memory().expect("in-memory db")))
    }

    fn product(id: i64, name: &str, barcode: &str) -> ReferenceItem {
        ReferenceItem::from_server_record(
            Collection::Products,
            json!({ "id": id, "name": name, "barcode": barcode, "price": 100 }),
        )
        .unwrap()
    }

    #[test]
    fn test_insert_assigns_increasing_ids() {
        let store = test_store();
        let a = store
            .insert_sale("OFF-AAAAAAAAA", &json!({ "total_amount": 500 }), Utc::now())
            .unwrap();
        let b = store
            .insert_sale("OFF-BBBBBBBBB", &json!({ "total_amount": 200 }), Utc::now())
            .unwrap();
        assert!(b.local_id > a.local_id);
        assert_eq!(a.status, SaleStatus::Pending);

        let loaded = store.get_sale(a.local_id).unwrap().expect("stored");
        assert_eq!(loaded.local_reference, "OFF-AAAAAAAAA");
        assert_eq!(loaded.payload, json!({ "total_amount": 500 }));
        assert!(loaded.server_reference.is_none());
    }

    #[test]
    fn test_local_id_not_reused_after_delete() {
        let store = test_store();
        let first = store.insert_sale("OFF-000000001", &json!({}), Utc::now()).unwrap();
        {
            let conn = store.db().lock().unwrap();
            conn.execute("DELETE FROM offline_sales WHERE local_id = ?1", params![first.local_id])
                .unwrap();
        }
        let second = store.insert_sale("OFF-000000002", &json!({}), Utc::now()).unwrap();
        assert!(second.local_id > first.local_id);
    }

    #[test]
    fn test_duplicate_local_reference_is_rejected() {
        let store = test_store();
        store.insert_sale("OFF-DUPLICATE", &json!({}), Utc::now()).unwrap();
        let err = store
            .insert_sale("OFF-DUPLICATE", &json!({}), Utc::now())
            .unwrap_err();
        assert!(matches!(err, OfflineError::StorageUnavailable(_)));
    }

    #[test]
    fn test_status_index_and_terminal_transitions() {
        let store = test_store();
        let a = store.insert_sale("OFF-A00000000", &json!({}), Utc::now()).unwrap();
        let b = store.insert_sale("OFF-B00000000", &json!({}), Utc::now()).unwrap();
        let c = store.insert_sale("OFF-C00000000", &json!({}), Utc::now()).unwrap();

        assert!(store.mark_synced(a.local_id, "SALE-1234ABCD").unwrap());
        assert!(store.mark_failed(b.local_id, "Insufficient stock").unwrap());

        let pending = store.sales_by_status(SaleStatus::Pending).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].local_id, c.local_id);

        // Terminal states are never left.
        assert!(!store.mark_failed(a.local_id, "late error").unwrap());
        assert!(!store.mark_synced(b.local_id, "SALE-LATE").unwrap());
        let a = store.get_sale(a.local_id).unwrap().unwrap();
        assert_eq!(a.status, SaleStatus::Synced);
        assert_eq!(a.server_reference.as_deref(), Some("SALE-1234ABCD"));
        assert!(a.last_error.is_none());
        let b = store.get_sale(b.local_id).unwrap().unwrap();
        assert_eq!(b.status, SaleStatus::Failed);
        assert_eq!(b.last_error.as_deref(), Some("Insufficient stock"));

        let counts = store.status_counts().unwrap();
        assert_eq!(
            counts,
            StatusCounts {
                pending: 1,
                synced: 1,
                failed: 1
            }
        );
    }

    #[test]
    fn test_poisoned_lock_surfaces_storage_unavailable() {
        let store = test_store();
        let sale = store
            .insert_sale("OFF-POISON001", &json!({ "total_amount": 90 }), Utc::now())
            .unwrap();

        let db = store.db().clone();
        let _ = std::thread::spawn(move || {
            let _conn = db.conn.lock().unwrap();
            panic!("connection lock poisoned on purpose");
        })
        .join();

        let is_unavailable = |r: Result<()>| matches!(r, Err(OfflineError::StorageUnavailable(_)));
        assert!(is_unavailable(store.get_sale(sale.local_id).map(|_| ())));
        assert!(is_unavailable(store.sales_by_status(SaleStatus::Pending).map(|_| ())));
        assert!(is_unavailable(store.mark_synced(sale.local_id, "SALE-1").map(|_| ())));
        assert!(is_unavailable(store.status_counts().map(|_| ())));
        assert!(is_unavailable(
            store
                .insert_sale("OFF-POISON002", &json!({}), Utc::now())
                .map(|_| ())
        ));
    }

    #[test]
    fn test_unreadable_pending_row_surfaces_storage_unavailable() {
        let store = test_store();
        let sale = store
            .insert_sale("OFF-BROKEN001", &json!({ "total_amount": 90 }), Utc::now())
            .unwrap();
        store
            .db()
            .lock()
            .unwrap()
            .execute(
                "UPDATE offline_sales SET payload = 'not json' WHERE local_id = ?1",
                params![sale.local_id],
            )
            .unwrap();

        assert!(matches!(
            store.get_sale(sale.local_id),
            Err(OfflineError::StorageUnavailable(_))
        ));
        assert!(matches!(
            store.sales_by_status(SaleStatus::Pending),
            Err(OfflineError::StorageUnavailable(_))
        ));

        store
            .db()
            .lock()
            .unwrap()
            .execute_batch("DROP TABLE offline_sales")
            .unwrap();
        assert!(matches!(
            store.sales_by_status(SaleStatus::Pending),
            Err(OfflineError::StorageUnavailable(_))
        ));
    }

    #[test]
    fn test_sale_by_reference() {
        let store = test_store();
        store.insert_sale("OFF-FINDME123", &json!({ "total_amount": 80 }), Utc::now()).unwrap();
        let found = store.sale_by_reference("OFF-FINDME123").unwrap().unwrap();
        assert_eq!(found.payload["total_amount"], json!(80));
        assert!(store.sale_by_reference("OFF-MISSING00").unwrap().is_none());
        assert!(store.get_sale(9999).unwrap().is_none());
    }

    #[test]
    fn test_reference_put_get_and_indexes() {
        let store = test_store();
        store.put_reference(Collection::Products, &product(1, "Sugar 1kg", "600100")).unwrap();
        store.put_reference(Collection::Products, &product(2, "Salt", "600200")).unwrap();
        // Overwrite by primary key.
        store.put_reference(Collection::Products, &product(1, "Sugar 2kg", "600100")).unwrap();

        assert_eq!(store.count_references(Collection::Products).unwrap(), 2);
        assert_eq!(store.count_references(Collection::Customers).unwrap(), 0);
        let sugar = store.get_reference(Collection::Products, "1").unwrap().unwrap();
        assert_eq!(sugar.name, "Sugar 2kg");

        let by_barcode = store
            .iterate_references(Collection::Products, Some(ReferenceIndex::UniqueKey("600200")))
            .unwrap();
        assert_eq!(by_barcode.len(), 1);
        assert_eq!(by_barcode[0].name, "Salt");

        let by_name = store
            .iterate_references(Collection::Products, Some(ReferenceIndex::Name("Sugar 2kg")))
            .unwrap();
        assert_eq!(by_name.len(), 1);

        assert_eq!(store.clear_references(Collection::Products).unwrap(), 2);
        assert!(store.iterate_references(Collection::Products, None).unwrap().is_empty());
    }

    #[test]
    fn test_replace_rolls_back_on_duplicate_unique_key() {
        let store = test_store();
        store
            .replace_references(
                Collection::Products,
                &[product(1, "Sugar", "600100"), product(2, "Salt", "600200")],
            )
            .unwrap();

        let result = store.replace_references(
            Collection::Products,
            &[product(3, "Rice", "600300"), product(4, "Rice again", "600300")],
        );
        assert!(result.is_err());

        let mut names: Vec<String> = store
            .iterate_references(Collection::Products, None)
            .unwrap()
            .into_iter()
            .map(|item| item.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["Salt".to_string(), "Sugar".to_string()]);
    }
}
