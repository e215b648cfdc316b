//! Record types shared by the store, the sync engine and the UI boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sync status of a locally recorded sale.
///
/// `Synced` and `Failed` are terminal: nothing in this crate moves a sale out
/// of either state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaleStatus {
    Pending,
    Synced,
    Failed,
}

impl SaleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaleStatus::Pending => "pending",
            SaleStatus::Synced => "synced",
            SaleStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(SaleStatus::Pending),
            "synced" => Some(SaleStatus::Synced),
            "failed" => Some(SaleStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SaleStatus::Pending)
    }
}

/// A sale recorded on this terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSale {
    pub local_id: i64,
    pub local_reference: String,
    pub payload: Value,
    pub status: SaleStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub server_reference: Option<String>,
    pub last_error: Option<String>,
}

/// Returned to checkout once a sale is on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SaleReceipt {
    pub local_id: i64,
    pub local_reference: String,
}

/// Server-owned reference data cached for offline lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Products,
    Customers,
}

impl Collection {
    pub const ALL: [Collection; 2] = [Collection::Products, Collection::Customers];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Products => "products",
            Collection::Customers => "customers",
        }
    }

    /// Name of the uniquely indexed lookup field.
    pub fn unique_field(&self) -> &'static str {
        match self {
            Collection::Products => "barcode",
            Collection::Customers => "phone",
        }
    }

    pub(crate) fn table(&self) -> &'static str {
        match self {
            Collection::Products => "products_cache",
            Collection::Customers => "customers_cache",
        }
    }
}

/// One cached product or customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceItem {
    pub id: String,
    pub name: String,
    /// Barcode for products, phone for customers.
    pub unique_key: Option<String>,
    /// The record exactly as the server sent it.
    pub data: Value,
}

impl ReferenceItem {
    /// Build a cache row from a server record. Returns `None` when the record
    /// lacks an `id` or a `name`.
    pub fn from_server_record(collection: Collection, record: Value) -> Option<Self> {
        let id = match record.get("id")? {
            Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let name = record.get("name").and_then(Value::as_str)?.to_string();
        let unique_key = record
            .get(collection.unique_field())
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string);
        Some(Self {
            id,
            name,
            unique_key,
            data: record,
        })
    }

    pub fn matches(&self, term: &str) -> bool {
        let term = term.trim();
        if term.is_empty() {
            return true;
        }
        if self.name.to_lowercase().contains(&term.to_lowercase()) {
            return true;
        }
        self.unique_key
            .as_deref()
            .map(|key| key.contains(term))
            .unwrap_or(false)
    }
}

/// Connectivity as seen by this terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl ConnectivityState {
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectivityState::Online)
    }
}

/// Counts of what happened during one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub attempted: usize,
    pub synced: usize,
    pub rejected: usize,
    /// Left pending after a transport failure.
    pub deferred: usize,
}

/// Status-bar summary for the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub pending: i64,
    pub synced: i64,
    pub failed: i64,
    pub last_sync: Option<String>,
}
