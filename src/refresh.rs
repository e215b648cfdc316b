//! Reference cache refresher.
//!
//! Keeps the local product and customer caches in step with the server. A
//! refresh fetches the whole collection with no lock held, then swaps the
//! cached set in one transaction. A failed fetch or a failed swap leaves the
//! previous cache untouched.

use std::sync::Arc;

use tracing::{info, warn};

use crate::api::RemoteApi;
use crate::error::{OfflineError, Result};
use crate::models::{Collection, ReferenceItem};
use crate::store::LocalStore;

pub struct ReferenceCacheRefresher<R> {
    store: LocalStore,
    remote: Arc<R>,
}

impl<R: RemoteApi> ReferenceCacheRefresher<R> {
    pub fn new(store: LocalStore, remote: Arc<R>) -> Self {
        Self { store, remote }
    }

    /// Replace the cached `collection` with the server's current copy.
    /// Returns the number of cached items on success.
    pub async fn refresh(&self, collection: Collection) -> Result<usize> {
        let records = match self.remote.fetch_collection(collection).await {
            Ok(records) => records,
            Err(e) => {
                warn!(
                    collection = collection.as_str(),
                    error = %e,
                    "reference refresh failed; keeping cached copy"
                );
                return Err(OfflineError::RefreshFailure(e.to_string()));
            }
        };

        let fetched = records.len();
        let items: Vec<ReferenceItem> = records
            .into_iter()
            .filter_map(|record| {
                let item = ReferenceItem::from_server_record(collection, record);
                if item.is_none() {
                    warn!(
                        collection = collection.as_str(),
                        "skipping record without id or name"
                    );
                }
                item
            })
            .collect();

        match self.store.replace_references(collection, &items) {
            Ok(count) => {
                info!(
                    collection = collection.as_str(),
                    fetched,
                    cached = count,
                    "reference cache refreshed"
                );
                Ok(count)
            }
            Err(e) => {
                warn!(
                    collection = collection.as_str(),
                    error = %e,
                    "reference cache replace failed; keeping cached copy"
                );
                Err(OfflineError::RefreshFailure(e.to_string()))
            }
        }
    }

    /// Refresh every collection. A failure in one does not stop the others.
    pub async fn refresh_all(&self) -> Vec<(Collection, Result<usize>)> {
        let mut results = Vec::with_capacity(Collection::ALL.len());
        for collection in Collection::ALL {
            results.push((collection, self.refresh(collection).await));
        }
        results
    }
}

/// Search a cached collection. An empty term returns everything; otherwise
/// items match on a case-insensitive name substring or a unique-field
/// substring. Unordered.
pub fn find_reference_items(
    store: &LocalStore,
    collection: Collection,
    term: &str,
) -> Result<Vec<ReferenceItem>> {
    let items = store.iterate_references(collection, None)?;
    if term.trim().is_empty() {
        return Ok(items);
    }
    Ok(items.into_iter().filter(|item| item.matches(term)).collect())
}
