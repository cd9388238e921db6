//! Inventory rows and the values written into them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One stocked listing of a catalog item for an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub id: i64,
    pub account_id: String,
    pub catalog_item_id: i64,
    /// Listing id on the external catalog. `None` until first synced.
    pub external_listing_id: Option<String>,
    pub quantity: i64,
    /// Minor currency units.
    pub price_cents: i64,
    /// Condition, language, foil and similar attributes.
    pub properties: Value,
    pub description: Option<String>,
    pub user_data_field: Option<String>,
    pub graded: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Identity of an inventory row within one account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub catalog_item_id: i64,
    pub external_listing_id: String,
}

/// Values written for one row by a bulk sync.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemUpsert {
    pub catalog_item_id: i64,
    pub external_listing_id: String,
    pub quantity: i64,
    pub price_cents: i64,
    pub properties: Value,
    pub description: Option<String>,
    pub user_data_field: Option<String>,
    pub graded: bool,
}

impl ItemUpsert {
    pub fn key(&self) -> ItemKey {
        ItemKey {
            catalog_item_id: self.catalog_item_id,
            external_listing_id: self.external_listing_id.clone(),
        }
    }
}

/// Result of removing sold units from a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaleOutcome {
    Applied {
        old_quantity: i64,
        new_quantity: i64,
        /// Units actually removed; less than ordered when the listing was
        /// oversold.
        removed: i64,
    },
    /// This order already removed units from this listing.
    AlreadyApplied,
    ListingNotFound,
}

/// Result of putting back units an order removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored {
        old_quantity: i64,
        new_quantity: i64,
    },
    AlreadyRestored,
    /// No sale was recorded for this order and listing.
    NothingToRestore,
    ListingNotFound,
}
