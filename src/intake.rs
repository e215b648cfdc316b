//! Sale intake: the checkout-facing entry point.
//!
//! Recording a sale only touches local storage. It never waits on the network,
//! and once it returns the sale is on disk.

use chrono::Utc;
use serde_json::Value;
use tracing::{error, info};

use crate::error::{OfflineError, Result};
use crate::models::{PendingSale, SaleReceipt, SaleStatus};
use crate::store::LocalStore;

const REFERENCE_PREFIX: &str = "OFF-";
const REFERENCE_LEN: usize = 9;
const BASE36: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Generate a human-readable local reference, e.g. `OFF-K3V9Q0ZT1`.
pub fn generate_local_reference() -> String {
    let mut n = uuid::Uuid::new_v4().as_u128();
    let mut out = String::with_capacity(REFERENCE_PREFIX.len() + REFERENCE_LEN);
    out.push_str(REFERENCE_PREFIX);
    for _ in 0..REFERENCE_LEN {
        out.push(BASE36[(n % 36) as usize] as char);
        n /= 36;
    }
    out
}

#[derive(Clone)]
pub struct SaleIntake {
    store: LocalStore,
}

impl SaleIntake {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Persist a sale as `pending` and hand back its local identity.
    pub fn record_sale(&self, payload: Value) -> Result<SaleReceipt> {
        if !payload.is_object() {
            return Err(OfflineError::InvalidPayload(
                "sale payload must be a JSON object".into(),
            ));
        }

        let local_reference = generate_local_reference();
        let sale = self
            .store
            .insert_sale(&local_reference, &payload, Utc::now())
            .map_err(|e| {
                error!(
                    local_reference = %local_reference,
                    error = %e,
                    "failed to record offline sale"
                );
                OfflineError::IntakeFailed(e.to_string())
            })?;

        info!(
            local_id = sale.local_id,
            local_reference = %sale.local_reference,
            "sale recorded offline"
        );
        Ok(SaleReceipt {
            local_id: sale.local_id,
            local_reference: sale.local_reference,
        })
    }

    pub fn sale_by_reference(&self, local_reference: &str) -> Result<Option<PendingSale>> {
        self.store.sale_by_reference(local_reference.trim())
    }

    /// Sales with the given status, or every sale (newest first) when `None`.
    pub fn list_sales(&self, status: Option<SaleStatus>) -> Result<Vec<PendingSale>> {
        match status {
            Some(status) => self.store.sales_by_status(status),
            None => self.store.all_sales(),
        }
    }
}
