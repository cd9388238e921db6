//! Storage sessions: one connection and one write transaction per unit of
//! work (a bulk sync chunk or a webhook event).
//!
//! A session rolls back when dropped without [`StorageSession::commit`], so
//! every exit path (error, panic, abandoned chunk) releases the transaction
//! and the connection.

use super::models::{ItemKey, ItemUpsert, RestoreOutcome, SaleOutcome};
use crate::metrics;
use anyhow::{Context, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, InterruptHandle, OptionalExtension};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Stay under SQLite's bound-parameter limit (32766 in current builds).
const MAX_SQL_PARAMS: usize = 32_000;

const INSERT_COLUMNS: usize = 11;
const UPDATE_COLUMNS: usize = 8;

pub struct StorageSession {
    conn: Connection,
    now: i64,
    finished: bool,
}

impl StorageSession {
    /// Takes the database write lock immediately, so reads made in this
    /// session cannot go stale before its writes.
    pub(super) fn begin(conn: Connection, now: i64) -> Result<Self> {
        conn.execute_batch("BEGIN IMMEDIATE")
            .context("Failed to begin storage session")?;
        Ok(Self {
            conn,
            now,
            finished: false,
        })
    }

    /// Handle that aborts whatever statement this session is running.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.conn.get_interrupt_handle()
    }

    /// Returns which of `keys` already exist for `account_id`, using one
    /// `IN (VALUES ...)` lookup per batch of keys.
    pub fn find_existing(&self, account_id: &str, keys: &[ItemKey]) -> Result<HashSet<ItemKey>> {
        let mut existing = HashSet::new();
        for batch in keys.chunks(MAX_SQL_PARAMS / 3) {
            let tuples = vec!["(?, ?, ?)"; batch.len()].join(", ");
            let sql = format!(
                "SELECT catalog_item_id, external_listing_id FROM inventory_items
                 WHERE (account_id, catalog_item_id, external_listing_id) IN (VALUES {})",
                tuples
            );
            let mut values = Vec::with_capacity(batch.len() * 3);
            for key in batch {
                values.push(SqlValue::Text(account_id.to_string()));
                values.push(SqlValue::Integer(key.catalog_item_id));
                values.push(SqlValue::Text(key.external_listing_id.clone()));
            }

            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
                Ok(ItemKey {
                    catalog_item_id: row.get(0)?,
                    external_listing_id: row.get(1)?,
                })
            })?;
            for row in rows {
                existing.insert(row?);
            }
        }
        Ok(existing)
    }

    /// Multi-row insert of new listings. A row that appeared since the
    /// existence lookup is updated in place instead of violating the unique
    /// key.
    pub fn insert_items(&self, account_id: &str, items: &[ItemUpsert]) -> Result<usize> {
        let mut written = 0;
        for batch in items.chunks(MAX_SQL_PARAMS / INSERT_COLUMNS) {
            let tuples = vec!["(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"; batch.len()].join(", ");
            let sql = format!(
                "INSERT INTO inventory_items (account_id, catalog_item_id, external_listing_id,
                    quantity, price_cents, properties, description, user_data_field, graded,
                    created_at, updated_at)
                 VALUES {}
                 ON CONFLICT(account_id, catalog_item_id, external_listing_id) DO UPDATE SET
                    quantity = excluded.quantity,
                    price_cents = excluded.price_cents,
                    properties = excluded.properties,
                    description = excluded.description,
                    user_data_field = excluded.user_data_field,
                    graded = excluded.graded,
                    updated_at = excluded.updated_at",
                tuples
            );
            let mut values = Vec::with_capacity(batch.len() * INSERT_COLUMNS);
            for item in batch {
                values.push(SqlValue::Text(account_id.to_string()));
                push_item_values(&mut values, item);
                values.push(SqlValue::Integer(self.now));
                values.push(SqlValue::Integer(self.now));
            }
            written += self.conn.execute(&sql, params_from_iter(values.iter()))?;
        }
        Ok(written)
    }

    /// Updates existing listings from a `VALUES` table, one statement per
    /// batch.
    pub fn update_items(&self, account_id: &str, items: &[ItemUpsert]) -> Result<usize> {
        let mut written = 0;
        for batch in items.chunks(MAX_SQL_PARAMS / UPDATE_COLUMNS - 1) {
            let tuples = vec!["(?, ?, ?, ?, ?, ?, ?, ?)"; batch.len()].join(", ");
            let sql = format!(
                "WITH v(catalog_item_id, external_listing_id, quantity, price_cents, properties,
                        description, user_data_field, graded) AS (VALUES {})
                 UPDATE inventory_items SET
                    quantity = v.quantity,
                    price_cents = v.price_cents,
                    properties = v.properties,
                    description = v.description,
                    user_data_field = v.user_data_field,
                    graded = v.graded,
                    updated_at = ?
                 FROM v
                 WHERE inventory_items.account_id = ?
                   AND inventory_items.catalog_item_id = v.catalog_item_id
                   AND inventory_items.external_listing_id = v.external_listing_id",
                tuples
            );
            let mut values = Vec::with_capacity(batch.len() * UPDATE_COLUMNS + 2);
            for item in batch {
                push_item_values(&mut values, item);
            }
            values.push(SqlValue::Integer(self.now));
            values.push(SqlValue::Text(account_id.to_string()));
            written += self.conn.execute(&sql, params_from_iter(values.iter()))?;
        }
        Ok(written)
    }

    fn find_listing(&self, account_id: &str, listing_id: &str) -> Result<Option<(i64, i64)>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, quantity FROM inventory_items
                 WHERE account_id = ?1 AND external_listing_id = ?2
                 ORDER BY id LIMIT 1",
                params![account_id, listing_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    }

    /// Removes up to `ordered` units from the listing for `order_id`,
    /// clamping at zero, and records how many were actually removed.
    pub fn apply_sale(
        &self,
        account_id: &str,
        order_id: &str,
        listing_id: &str,
        ordered: i64,
    ) -> Result<SaleOutcome> {
        let already: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM order_adjustments
                 WHERE account_id = ?1 AND order_id = ?2 AND external_listing_id = ?3",
                params![account_id, order_id, listing_id],
                |row| row.get(0),
            )
            .optional()?;
        if already.is_some() {
            return Ok(SaleOutcome::AlreadyApplied);
        }

        let Some((item_id, old_quantity)) = self.find_listing(account_id, listing_id)? else {
            return Ok(SaleOutcome::ListingNotFound);
        };

        let removed = ordered.clamp(0, old_quantity.max(0));
        let new_quantity = old_quantity - removed;
        if ordered > old_quantity {
            metrics::record_quantity_clamp();
            warn!(
                "Listing {} of account {} oversold by order {}: had {}, ordered {}; clamped to 0",
                listing_id, account_id, order_id, old_quantity, ordered
            );
        }

        self.conn.execute(
            "UPDATE inventory_items SET quantity = ?1, updated_at = ?2 WHERE id = ?3",
            params![new_quantity, self.now, item_id],
        )?;
        self.conn.execute(
            "INSERT INTO order_adjustments (account_id, order_id, external_listing_id,
                ordered_quantity, removed_quantity, restored, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![account_id, order_id, listing_id, ordered, removed, self.now],
        )?;
        debug!(
            "Listing {} quantity {} -> {} (order {})",
            listing_id, old_quantity, new_quantity, order_id
        );

        Ok(SaleOutcome::Applied {
            old_quantity,
            new_quantity,
            removed,
        })
    }

    /// Puts back exactly the units `order_id` removed from the listing.
    /// A second restore for the same order is a no-op.
    pub fn restore_sale(
        &self,
        account_id: &str,
        order_id: &str,
        listing_id: &str,
    ) -> Result<RestoreOutcome> {
        let adjustment: Option<(i64, i64, bool)> = self
            .conn
            .query_row(
                "SELECT id, removed_quantity, restored FROM order_adjustments
                 WHERE account_id = ?1 AND order_id = ?2 AND external_listing_id = ?3",
                params![account_id, order_id, listing_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? != 0)),
            )
            .optional()?;

        let Some((adjustment_id, removed, restored)) = adjustment else {
            return Ok(RestoreOutcome::NothingToRestore);
        };
        if restored {
            return Ok(RestoreOutcome::AlreadyRestored);
        }
        let Some((item_id, old_quantity)) = self.find_listing(account_id, listing_id)? else {
            return Ok(RestoreOutcome::ListingNotFound);
        };

        let new_quantity = old_quantity + removed;
        self.conn.execute(
            "UPDATE inventory_items SET quantity = ?1, updated_at = ?2 WHERE id = ?3",
            params![new_quantity, self.now, item_id],
        )?;
        self.conn.execute(
            "UPDATE order_adjustments SET restored = 1, restored_at = ?1 WHERE id = ?2",
            params![self.now, adjustment_id],
        )?;

        Ok(RestoreOutcome::Restored {
            old_quantity,
            new_quantity,
        })
    }

    /// Moves the listing's quantity by `delta`, never below zero. Returns
    /// the old and new quantity, or `None` when the listing is unknown.
    pub fn adjust_quantity(
        &self,
        account_id: &str,
        listing_id: &str,
        delta: i64,
    ) -> Result<Option<(i64, i64)>> {
        let Some((item_id, old_quantity)) = self.find_listing(account_id, listing_id)? else {
            return Ok(None);
        };
        let new_quantity = old_quantity.saturating_add(delta).max(0);
        self.conn.execute(
            "UPDATE inventory_items SET quantity = ?1, updated_at = ?2 WHERE id = ?3",
            params![new_quantity, self.now, item_id],
        )?;
        Ok(Some((old_quantity, new_quantity)))
    }

    /// Removes every row of the listing for the account.
    pub fn delete_listing(&self, account_id: &str, listing_id: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM inventory_items WHERE account_id = ?1 AND external_listing_id = ?2",
            params![account_id, listing_id],
        )?)
    }

    pub fn commit(mut self) -> Result<()> {
        self.conn
            .execute_batch("COMMIT")
            .context("Failed to commit storage session")?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for StorageSession {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                debug!("Rollback on session drop failed: {}", err);
            }
        }
    }
}

fn push_item_values(values: &mut Vec<SqlValue>, item: &ItemUpsert) {
    values.push(SqlValue::Integer(item.catalog_item_id));
    values.push(SqlValue::Text(item.external_listing_id.clone()));
    values.push(SqlValue::Integer(item.quantity));
    values.push(SqlValue::Integer(item.price_cents));
    values.push(SqlValue::Text(item.properties.to_string()));
    values.push(
        item.description
            .clone()
            .map(SqlValue::Text)
            .unwrap_or(SqlValue::Null),
    );
    values.push(
        item.user_data_field
            .clone()
            .map(SqlValue::Text)
            .unwrap_or(SqlValue::Null),
    );
    values.push(SqlValue::Integer(item.graded as i64));
}
