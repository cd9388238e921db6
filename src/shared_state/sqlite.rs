use super::{expires_at, SharedStateStore, StateKey, StateUpdate};
use crate::sqlite_column;
use crate::sqlite_persistence::{open_versioned, SqlType, Table, VersionedSchema};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

const SHARED_STATE_TABLE: Table = Table {
    name: "shared_state",
    columns: &[
        sqlite_column!("key", SqlType::Text, is_primary_key = true),
        sqlite_column!("value", SqlType::Text, non_null = true),
        sqlite_column!("expires_at", SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_shared_state_expires_at", "expires_at")],
    unique_constraints: &[],
};

const SHARED_STATE_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[SHARED_STATE_TABLE],
    migration: None,
}];

/// Shared store backed by a SQLite file.
///
/// Every process opening the same file sees the same records. Each
/// compare-and-update runs inside a `BEGIN IMMEDIATE` transaction, which
/// takes the database write lock before the read, so no two writers can
/// interleave their read and write.
#[derive(Clone)]
pub struct SqliteSharedStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSharedStateStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path, SHARED_STATE_SCHEMAS, "shared state")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

impl SharedStateStore for SqliteSharedStateStore {
    fn compare_and_update(
        &self,
        key: &StateKey,
        now_ms: i64,
        ttl: Duration,
        update: &mut dyn FnMut(Option<&str>) -> StateUpdate,
    ) -> Result<Option<String>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context(|| format!("Failed to lock shared state for {}", key))?;

        let current: Option<String> = tx
            .query_row(
                "SELECT value FROM shared_state WHERE key = ?1 AND expires_at > ?2",
                params![key.as_str(), now_ms],
                |row| row.get(0),
            )
            .optional()?;

        let stored = match update(current.as_deref()) {
            StateUpdate::Keep => current,
            StateUpdate::Put(value) => {
                tx.execute(
                    "INSERT INTO shared_state (key, value, expires_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                    params![key.as_str(), value, expires_at(now_ms, ttl)],
                )?;
                Some(value)
            }
            StateUpdate::Delete => {
                tx.execute(
                    "DELETE FROM shared_state WHERE key = ?1",
                    params![key.as_str()],
                )?;
                None
            }
        };

        tx.commit()
            .with_context(|| format!("Failed to commit shared state for {}", key))?;
        Ok(stored)
    }

    fn purge_expired(&self, now_ms: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM shared_state WHERE expires_at <= ?1",
            params![now_ms],
        )?;
        if removed > 0 {
            debug!("Purged {} expired shared state records", removed);
        }
        Ok(removed)
    }
}
