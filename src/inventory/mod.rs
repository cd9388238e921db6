mod models;
mod schema;
mod session;

pub use models::{InventoryItem, ItemKey, ItemUpsert, RestoreOutcome, SaleOutcome};
pub use schema::{INVENTORY_DB_SCHEMAS, INVENTORY_ITEMS_TABLE, ORDER_ADJUSTMENTS_TABLE};
pub use session::StorageSession;

use crate::sqlite_persistence::{configure_connection, open_versioned};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Inventory rows in `inventory.db`.
///
/// Reads go through one shared connection. Writes go through
/// [`StorageSession`]s, each on a connection of its own, so concurrent
/// chunks never share a transaction.
#[derive(Clone)]
pub struct SqliteInventoryStore {
    db_path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteInventoryStore {
    /// Opens (or creates) the inventory database and validates its schema,
    /// including the composite key bulk lookups depend on.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let conn = open_versioned(&db_path, INVENTORY_DB_SCHEMAS, "inventory")?;
        Ok(Self {
            db_path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Opens a fresh connection and starts a write transaction on it.
    pub fn begin_session(&self) -> Result<StorageSession> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open session on {:?}", self.db_path))?;
        configure_connection(&conn)?;
        StorageSession::begin(conn, chrono::Utc::now().timestamp())
    }

    fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<InventoryItem> {
        let properties: String = row.get("properties")?;
        Ok(InventoryItem {
            id: row.get("id")?,
            account_id: row.get("account_id")?,
            catalog_item_id: row.get("catalog_item_id")?,
            external_listing_id: row.get("external_listing_id")?,
            quantity: row.get("quantity")?,
            price_cents: row.get("price_cents")?,
            properties: serde_json::from_str(&properties).unwrap_or(serde_json::Value::Null),
            description: row.get("description")?,
            user_data_field: row.get("user_data_field")?,
            graded: row.get::<_, i64>("graded")? != 0,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub fn get_item(
        &self,
        account_id: &str,
        catalog_item_id: i64,
        external_listing_id: &str,
    ) -> Result<Option<InventoryItem>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT * FROM inventory_items
                 WHERE account_id = ?1 AND catalog_item_id = ?2 AND external_listing_id = ?3",
                params![account_id, catalog_item_id, external_listing_id],
                Self::row_to_item,
            )
            .optional()?)
    }

    pub fn find_by_listing(
        &self,
        account_id: &str,
        external_listing_id: &str,
    ) -> Result<Option<InventoryItem>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT * FROM inventory_items
                 WHERE account_id = ?1 AND external_listing_id = ?2
                 ORDER BY id LIMIT 1",
                params![account_id, external_listing_id],
                Self::row_to_item,
            )
            .optional()?)
    }

    pub fn list_items(&self, account_id: &str) -> Result<Vec<InventoryItem>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM inventory_items WHERE account_id = ?1
             ORDER BY catalog_item_id, external_listing_id",
        )?;
        let items = stmt
            .query_map(params![account_id], Self::row_to_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    pub fn count_items(&self, account_id: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM inventory_items WHERE account_id = ?1",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, SqliteInventoryStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteInventoryStore::open(dir.path().join("inventory.db")).unwrap();
        (dir, store)
    }

    fn upsert(catalog_item_id: i64, listing: &str, quantity: i64) -> ItemUpsert {
        ItemUpsert {
            catalog_item_id,
            external_listing_id: listing.to_string(),
            quantity,
            price_cents: 150,
            properties: json!({"condition": "Near Mint"}),
            description: None,
            user_data_field: Some("shelf-3".to_string()),
            graded: false,
        }
    }

    fn seed(store: &SqliteInventoryStore, items: &[ItemUpsert]) {
        let session = store.begin_session().unwrap();
        session.insert_items("acct", items).unwrap();
        session.commit().unwrap();
    }

    #[test]
    fn test_insert_and_read_back() {
        let (_dir, store) = store();
        seed(&store, &[upsert(1, "L1", 4), upsert(2, "L2", 0)]);

        let item = store.get_item("acct", 1, "L1").unwrap().unwrap();
        assert_eq!(item.quantity, 4);
        assert_eq!(item.price_cents, 150);
        assert_eq!(item.properties["condition"], "Near Mint");
        assert_eq!(item.user_data_field.as_deref(), Some("shelf-3"));
        assert_eq!(store.count_items("acct").unwrap(), 2);
        assert_eq!(store.count_items("other").unwrap(), 0);
    }

    #[test]
    fn test_find_existing_single_lookup() {
        let (_dir, store) = store();
        seed(&store, &[upsert(1, "L1", 1), upsert(2, "L2", 1)]);

        let session = store.begin_session().unwrap();
        let keys = vec![upsert(1, "L1", 0).key(), upsert(2, "L2", 0).key(), upsert(3, "L3", 0).key()];
        let existing = session.find_existing("acct", &keys).unwrap();
        assert_eq!(existing.len(), 2);
        assert!(existing.contains(&keys[0]));
        assert!(!existing.contains(&keys[2]));

        assert!(session.find_existing("other", &keys).unwrap().is_empty());
    }

    #[test]
    fn test_update_items_only_touches_matching_rows() {
        let (_dir, store) = store();
        seed(&store, &[upsert(1, "L1", 1), upsert(2, "L2", 1)]);

        let session = store.begin_session().unwrap();
        let mut changed = upsert(1, "L1", 9);
        changed.price_cents = 999;
        let updated = session
            .update_items("acct", &[changed, upsert(7, "missing", 3)])
            .unwrap();
        session.commit().unwrap();

        assert_eq!(updated, 1);
        let item = store.get_item("acct", 1, "L1").unwrap().unwrap();
        assert_eq!((item.quantity, item.price_cents), (9, 999));
        assert_eq!(store.get_item("acct", 2, "L2").unwrap().unwrap().quantity, 1);
    }

    #[test]
    fn test_dropped_session_rolls_back() {
        let (_dir, store) = store();
        {
            let session = store.begin_session().unwrap();
            session.insert_items("acct", &[upsert(1, "L1", 1)]).unwrap();
        }
        assert_eq!(store.count_items("acct").unwrap(), 0);

        // The write lock was released with the session.
        seed(&store, &[upsert(1, "L1", 1)]);
        assert_eq!(store.count_items("acct").unwrap(), 1);
    }

    #[test]
    fn test_large_batches_split_under_parameter_limit() {
        let (_dir, store) = store();
        let items: Vec<_> = (0..7_000).map(|i| upsert(i, &format!("L{i}"), 1)).collect();
        seed(&store, &items);
        assert_eq!(store.count_items("acct").unwrap(), 7_000);

        let session = store.begin_session().unwrap();
        let keys: Vec<_> = items.iter().map(ItemUpsert::key).collect();
        assert_eq!(session.find_existing("acct", &keys).unwrap().len(), 7_000);
        assert_eq!(session.update_items("acct", &items).unwrap(), 7_000);
    }

    #[test]
    fn test_sale_and_restore_are_exact_and_once() {
        let (_dir, store) = store();
        seed(&store, &[upsert(1, "L1", 5)]);

        let session = store.begin_session().unwrap();
        assert_eq!(
            session.apply_sale("acct", "order-1", "L1", 2).unwrap(),
            SaleOutcome::Applied {
                old_quantity: 5,
                new_quantity: 3,
                removed: 2
            }
        );
        assert_eq!(
            session.apply_sale("acct", "order-1", "L1", 2).unwrap(),
            SaleOutcome::AlreadyApplied
        );
        assert_eq!(
            session.restore_sale("acct", "order-1", "L1").unwrap(),
            RestoreOutcome::Restored {
                old_quantity: 3,
                new_quantity: 5
            }
        );
        assert_eq!(
            session.restore_sale("acct", "order-1", "L1").unwrap(),
            RestoreOutcome::AlreadyRestored
        );
        assert_eq!(
            session.restore_sale("acct", "order-2", "L1").unwrap(),
            RestoreOutcome::NothingToRestore
        );
        session.commit().unwrap();

        assert_eq!(store.find_by_listing("acct", "L1").unwrap().unwrap().quantity, 5);
    }

    #[test]
    fn test_oversell_clamps_and_restores_what_was_removed() {
        let (_dir, store) = store();
        seed(&store, &[upsert(1, "L1", 2)]);

        let session = store.begin_session().unwrap();
        assert_eq!(
            session.apply_sale("acct", "order-9", "L1", 5).unwrap(),
            SaleOutcome::Applied {
                old_quantity: 2,
                new_quantity: 0,
                removed: 2
            }
        );
        session.restore_sale("acct", "order-9", "L1").unwrap();
        session.commit().unwrap();

        assert_eq!(store.find_by_listing("acct", "L1").unwrap().unwrap().quantity, 2);
    }

    #[test]
    fn test_unknown_listing() {
        let (_dir, store) = store();
        let session = store.begin_session().unwrap();
        assert_eq!(
            session.apply_sale("acct", "o", "nope", 1).unwrap(),
            SaleOutcome::ListingNotFound
        );
    }

    #[test]
    fn test_quantity_delta_floors_at_zero_and_delete_removes_listing() {
        let (_dir, store) = store();
        seed(&store, &[upsert(1, "L1", 3), upsert(2, "L2", 1)]);

        let session = store.begin_session().unwrap();
        assert_eq!(session.adjust_quantity("acct", "L1", 4).unwrap(), Some((3, 7)));
        assert_eq!(session.adjust_quantity("acct", "L1", -10).unwrap(), Some((7, 0)));
        assert_eq!(session.adjust_quantity("acct", "nope", 1).unwrap(), None);
        assert_eq!(session.delete_listing("acct", "L2").unwrap(), 1);
        assert_eq!(session.delete_listing("other", "L1").unwrap(), 0);
        session.commit().unwrap();

        assert_eq!(store.find_by_listing("acct", "L1").unwrap().unwrap().quantity, 0);
        assert!(store.find_by_listing("acct", "L2").unwrap().is_none());
    }

    #[test]
    fn test_reopen_validates_existing_schema() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inventory.db");
        drop(SqliteInventoryStore::open(&path).unwrap());
        SqliteInventoryStore::open(&path).unwrap();
    }
}
