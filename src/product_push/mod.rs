//! Pushes local listing edits to the external catalog.
//!
//! Every push goes through the [`OutboundGate`], so edits share the
//! account's rate budget and the dependency's breaker with bulk exports.
//! Webhook reconciliation never holds a pusher: a change the catalog
//! reported is not sent back to it.

use crate::catalog_api::{CatalogOperation, OutboundCall, ALREADY_DELETED};
use crate::gate::{GateError, OutboundGate};
use crate::inventory::{InventoryItem, SqliteInventoryStore};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PushError {
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error("local inventory unavailable: {0:#}")]
    Storage(#[source] anyhow::Error),
}

/// How a push ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PushOutcome {
    /// The catalog accepted the update as an asynchronous job.
    Queued { job_id: String },
    /// The catalog answered without a job id.
    Applied { response: Value },
    Deleted {
        already_deleted: bool,
        local_rows_removed: usize,
    },
    /// No local row carries this listing id; nothing was sent.
    ListingNotFound,
}

pub struct ProductPusher {
    store: SqliteInventoryStore,
    gate: Arc<OutboundGate>,
}

/// Listing ids go out as numbers when they are numeric.
fn wire_listing_id(listing_id: &str) -> Value {
    match listing_id.parse::<i64>() {
        Ok(id) => json!(id),
        Err(_) => json!(listing_id),
    }
}

fn full_update(listing_id: &str, item: &InventoryItem) -> Value {
    json!({
        "id": wire_listing_id(listing_id),
        "price": item.price_cents as f64 / 100.0,
        "quantity": item.quantity,
        "description": item.description,
        "user_data_field": item.user_data_field,
        "graded": item.graded,
        "properties": item.properties,
    })
}

fn quantity_update(listing_id: &str, item: &InventoryItem) -> Value {
    json!({
        "id": wire_listing_id(listing_id),
        "quantity": item.quantity,
    })
}

impl ProductPusher {
    pub fn new(store: SqliteInventoryStore, gate: Arc<OutboundGate>) -> Self {
        Self { store, gate }
    }

    fn local_item(&self, account_id: &str, listing_id: &str) -> Result<Option<InventoryItem>, PushError> {
        self.store
            .find_by_listing(account_id, listing_id)
            .map_err(PushError::Storage)
    }

    async fn bulk_update(&self, account_id: &str, product: Value) -> Result<PushOutcome, PushError> {
        let call = OutboundCall::new(account_id, CatalogOperation::BulkUpdateProducts)
            .with_payload(json!({"products": [product]}));
        let response = self.gate.call(call).await?;
        Ok(match response.get("job").and_then(Value::as_str) {
            Some(job_id) => PushOutcome::Queued {
                job_id: job_id.to_string(),
            },
            None => PushOutcome::Applied { response },
        })
    }

    /// Sends every editable field of the local listing: price, quantity,
    /// description, user data, graded flag and properties.
    pub async fn push_update(&self, account_id: &str, listing_id: &str) -> Result<PushOutcome, PushError> {
        let Some(item) = self.local_item(account_id, listing_id)? else {
            warn!("Listing {} of account {} not found locally, not pushed", listing_id, account_id);
            return Ok(PushOutcome::ListingNotFound);
        };
        let outcome = self
            .bulk_update(account_id, full_update(listing_id, &item))
            .await?;
        info!("Pushed listing {} of account {}: {:?}", listing_id, account_id, outcome);
        Ok(outcome)
    }

    /// Sends only the local quantity of the listing.
    pub async fn push_quantity(&self, account_id: &str, listing_id: &str) -> Result<PushOutcome, PushError> {
        let Some(item) = self.local_item(account_id, listing_id)? else {
            warn!("Listing {} of account {} not found locally, not pushed", listing_id, account_id);
            return Ok(PushOutcome::ListingNotFound);
        };
        self.bulk_update(account_id, quantity_update(listing_id, &item))
            .await
    }

    /// Moves the local quantity by `delta` (floored at zero), commits, then
    /// pushes the new quantity. A failed push leaves the local change in
    /// place; pushing again sends the same absolute quantity.
    pub async fn adjust_quantity(
        &self,
        account_id: &str,
        listing_id: &str,
        delta: i64,
    ) -> Result<PushOutcome, PushError> {
        let session = self.store.begin_session().map_err(PushError::Storage)?;
        let Some((old_quantity, new_quantity)) = session
            .adjust_quantity(account_id, listing_id, delta)
            .map_err(PushError::Storage)?
        else {
            return Ok(PushOutcome::ListingNotFound);
        };
        session.commit().map_err(PushError::Storage)?;
        info!(
            "Listing {} of account {} adjusted by {}: {} -> {}",
            listing_id, account_id, delta, old_quantity, new_quantity
        );
        self.push_quantity(account_id, listing_id).await
    }

    /// Deletes the listing on the catalog, then locally. A listing the
    /// catalog no longer has counts as deleted.
    pub async fn push_delete(&self, account_id: &str, listing_id: &str) -> Result<PushOutcome, PushError> {
        let call = OutboundCall::new(
            account_id,
            CatalogOperation::DeleteProduct {
                product_id: listing_id.to_string(),
            },
        );
        let response = self.gate.call(call).await?;
        let already_deleted =
            response.get("status").and_then(Value::as_str) == Some(ALREADY_DELETED);

        let session = self.store.begin_session().map_err(PushError::Storage)?;
        let local_rows_removed = session
            .delete_listing(account_id, listing_id)
            .map_err(PushError::Storage)?;
        session.commit().map_err(PushError::Storage)?;

        info!(
            "Deleted listing {} of account {} (already gone remotely: {}, local rows: {})",
            listing_id, account_id, already_deleted, local_rows_removed
        );
        Ok(PushOutcome::Deleted {
            already_deleted,
            local_rows_removed,
        })
    }

    /// Raw status of an asynchronous job returned by an update.
    pub async fn job_status(&self, account_id: &str, job_id: &str) -> Result<Value, PushError> {
        let call = OutboundCall::new(
            account_id,
            CatalogOperation::JobStatus {
                job_id: job_id.to_string(),
            },
        );
        Ok(self.gate.call(call).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(quantity: i64) -> InventoryItem {
        InventoryItem {
            id: 1,
            account_id: "acct".into(),
            catalog_item_id: 10,
            external_listing_id: Some("981".into()),
            quantity,
            price_cents: 1250,
            properties: json!({"condition": "Near Mint"}),
            description: Some("mint copy".into()),
            user_data_field: None,
            graded: true,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_full_update_payload() {
        let product = full_update("981", &item(3));
        assert_eq!(product["id"], json!(981));
        assert_eq!(product["price"], json!(12.5));
        assert_eq!(product["quantity"], json!(3));
        assert_eq!(product["graded"], json!(true));
        assert_eq!(product["properties"]["condition"], "Near Mint");
        assert_eq!(product["user_data_field"], Value::Null);
    }

    #[test]
    fn test_non_numeric_listing_ids_stay_strings() {
        assert_eq!(quantity_update("A-77", &item(0)), json!({"id": "A-77", "quantity": 0}));
    }
}
