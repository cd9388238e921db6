//! Database schema for inventory.db.

use crate::ledger::SYNC_OPERATIONS_TABLE;
use crate::sqlite_column;
use crate::sqlite_persistence::{SqlType, Table, VersionedSchema};

/// One row per (account, catalog item, external listing).
///
/// The unique constraint doubles as the composite index serving batched
/// existence lookups.
pub const INVENTORY_ITEMS_TABLE: Table = Table {
    name: "inventory_items",
    columns: &[
        sqlite_column!("id", SqlType::Integer, is_primary_key = true),
        sqlite_column!("account_id", SqlType::Text, non_null = true),
        sqlite_column!("catalog_item_id", SqlType::Integer, non_null = true),
        sqlite_column!("external_listing_id", SqlType::Text),
        sqlite_column!(
            "quantity",
            SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "price_cents",
            SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "properties",
            SqlType::Text,
            non_null = true,
            default_value = Some("'{}'")
        ),
        sqlite_column!("description", SqlType::Text),
        sqlite_column!("user_data_field", SqlType::Text),
        sqlite_column!(
            "graded",
            SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("created_at", SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_inventory_account_listing", "account_id, external_listing_id")],
    unique_constraints: &[&["account_id", "catalog_item_id", "external_listing_id"]],
};

/// Units each order removed from each listing, so cancellation and deletion
/// put back exactly that amount, once.
pub const ORDER_ADJUSTMENTS_TABLE: Table = Table {
    name: "order_adjustments",
    columns: &[
        sqlite_column!("id", SqlType::Integer, is_primary_key = true),
        sqlite_column!("account_id", SqlType::Text, non_null = true),
        sqlite_column!("order_id", SqlType::Text, non_null = true),
        sqlite_column!("external_listing_id", SqlType::Text, non_null = true),
        sqlite_column!("ordered_quantity", SqlType::Integer, non_null = true),
        sqlite_column!("removed_quantity", SqlType::Integer, non_null = true),
        sqlite_column!(
            "restored",
            SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("created_at", SqlType::Integer, non_null = true),
        sqlite_column!("restored_at", SqlType::Integer),
    ],
    indices: &[],
    unique_constraints: &[&["account_id", "order_id", "external_listing_id"]],
};

pub const INVENTORY_DB_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[
        INVENTORY_ITEMS_TABLE,
        ORDER_ADJUSTMENTS_TABLE,
        SYNC_OPERATIONS_TABLE,
    ],
    migration: None,
}];
