//! Sync operation ledger: one record per bulk import, resync or webhook
//! event, keyed by an idempotency id and carrying its progress counters.
//!
//! Only the unit of work that started an operation writes to it, and only
//! while it is pending. Status collaborators read it through
//! [`SyncLedger::get_progress`] and [`SyncLedger::latest_for_account`].

mod models;

pub use models::{
    percent, BeginOutcome, ChunkReport, OperationKind, OperationStatus, Progress, SyncError,
    SyncOperation,
};

use crate::inventory::INVENTORY_DB_SCHEMAS;
use crate::sqlite_column;
use crate::sqlite_persistence::{open_versioned, SqlType, Table};
use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Errors kept per operation; the count keeps growing past this.
pub const MAX_RECORDED_ERRORS: usize = 5_000;

pub const SYNC_OPERATIONS_TABLE: Table = Table {
    name: "sync_operations",
    columns: &[
        sqlite_column!("id", SqlType::Integer, is_primary_key = true),
        sqlite_column!("account_id", SqlType::Text, non_null = true),
        sqlite_column!("operation_id", SqlType::Text, non_null = true),
        sqlite_column!("kind", SqlType::Text, non_null = true),
        sqlite_column!("status", SqlType::Text, non_null = true),
        sqlite_column!(
            "chunks_total",
            SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "chunks_done",
            SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "items_created",
            SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "items_updated",
            SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "items_skipped",
            SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "error_count",
            SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "errors",
            SqlType::Text,
            non_null = true,
            default_value = Some("'[]'")
        ),
        sqlite_column!(
            "metadata",
            SqlType::Text,
            non_null = true,
            default_value = Some("'{}'")
        ),
        sqlite_column!("created_at", SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", SqlType::Integer, non_null = true),
        sqlite_column!("completed_at", SqlType::Integer),
    ],
    indices: &[("idx_sync_operations_account", "account_id, created_at")],
    unique_constraints: &[&["operation_id"]],
};

pub trait SyncLedger: Send + Sync {
    /// Registers `operation_id`. A known id is never started twice.
    fn begin_operation(
        &self,
        account_id: &str,
        operation_id: &str,
        kind: OperationKind,
        chunks_total: u64,
        metadata: Value,
    ) -> Result<BeginOutcome>;

    /// Sets the chunk count once it is known (after the export is parsed).
    fn set_chunks_total(&self, operation_id: &str, chunks_total: u64) -> Result<()>;

    /// Adds one finished chunk and its counters. This is the only write
    /// path to progress, so progress never goes backwards. Returns false if
    /// the operation is no longer pending.
    fn record_chunk(&self, operation_id: &str, report: &ChunkReport) -> Result<bool>;

    fn complete(&self, operation_id: &str) -> Result<bool>;

    fn fail(&self, operation_id: &str, reason: &str) -> Result<bool>;

    /// Stops dispatch of chunks that have not started yet.
    fn cancel(&self, operation_id: &str) -> Result<bool>;

    fn get(&self, operation_id: &str) -> Result<Option<SyncOperation>>;

    fn get_progress(&self, operation_id: &str) -> Result<Option<Progress>> {
        Ok(self.get(operation_id)?.map(|op| op.progress()))
    }

    /// Most recently created operation for the account.
    fn latest_for_account(&self, account_id: &str) -> Result<Option<SyncOperation>>;
}

pub struct SqliteSyncLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSyncLedger {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path, INVENTORY_DB_SCHEMAS, "inventory")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn row_to_operation(row: &rusqlite::Row) -> rusqlite::Result<SyncOperation> {
        let kind: String = row.get("kind")?;
        let status: String = row.get("status")?;
        let errors: String = row.get("errors")?;
        let metadata: String = row.get("metadata")?;
        Ok(SyncOperation {
            account_id: row.get("account_id")?,
            operation_id: row.get("operation_id")?,
            kind: OperationKind::from_str(&kind).unwrap_or(OperationKind::BulkImport),
            status: OperationStatus::from_str(&status).unwrap_or(OperationStatus::Failed),
            chunks_total: row.get::<_, i64>("chunks_total")? as u64,
            chunks_done: row.get::<_, i64>("chunks_done")? as u64,
            created: row.get::<_, i64>("items_created")? as u64,
            updated: row.get::<_, i64>("items_updated")? as u64,
            skipped: row.get::<_, i64>("items_skipped")? as u64,
            error_count: row.get::<_, i64>("error_count")? as u64,
            errors: serde_json::from_str(&errors).unwrap_or_default(),
            metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
            created_at: row.get("created_at")?,
            completed_at: row.get("completed_at")?,
        })
    }

    fn fetch(conn: &Connection, operation_id: &str) -> Result<Option<SyncOperation>> {
        Ok(conn
            .query_row(
                "SELECT * FROM sync_operations WHERE operation_id = ?1",
                params![operation_id],
                Self::row_to_operation,
            )
            .optional()?)
    }

    /// Appends `new_errors` to the stored list inside `tx`, keeping at most
    /// [`MAX_RECORDED_ERRORS`] entries.
    fn merged_errors(
        tx: &rusqlite::Transaction,
        operation_id: &str,
        new_errors: &[SyncError],
    ) -> Result<String> {
        let stored: String = tx.query_row(
            "SELECT errors FROM sync_operations WHERE operation_id = ?1",
            params![operation_id],
            |row| row.get(0),
        )?;
        let mut errors: Vec<SyncError> = serde_json::from_str(&stored).unwrap_or_default();
        let room = MAX_RECORDED_ERRORS.saturating_sub(errors.len());
        errors.extend(new_errors.iter().take(room).cloned());
        serde_json::to_string(&errors).context("Failed to encode error list")
    }

    fn finish(&self, operation_id: &str, status: OperationStatus) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let now = Self::now();
        let changed = conn.execute(
            "UPDATE sync_operations SET status = ?1, completed_at = ?2, updated_at = ?2
             WHERE operation_id = ?3 AND status = 'pending'",
            params![status.as_str(), now, operation_id],
        )?;
        if changed > 0 {
            info!("Sync operation {} {}", operation_id, status.as_str());
        }
        Ok(changed > 0)
    }
}

impl SyncLedger for SqliteSyncLedger {
    fn begin_operation(
        &self,
        account_id: &str,
        operation_id: &str,
        kind: OperationKind,
        chunks_total: u64,
        metadata: Value,
    ) -> Result<BeginOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = Self::fetch(&tx, operation_id)? {
            if existing.account_id != account_id {
                bail!(
                    "Operation id {} already belongs to account {}",
                    operation_id,
                    existing.account_id
                );
            }
            return Ok(if existing.status.is_terminal() {
                info!(
                    "Operation {} already {}, replay ignored",
                    operation_id,
                    existing.status.as_str()
                );
                BeginOutcome::Replay(existing)
            } else {
                info!("Operation {} is already in progress", operation_id);
                BeginOutcome::InProgress(existing)
            });
        }

        let now = Self::now();
        tx.execute(
            "INSERT INTO sync_operations (account_id, operation_id, kind, status, chunks_total,
                metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?6)",
            params![
                account_id,
                operation_id,
                kind.as_str(),
                chunks_total as i64,
                metadata.to_string(),
                now
            ],
        )?;
        let created = Self::fetch(&tx, operation_id)?
            .with_context(|| format!("Operation {} vanished after insert", operation_id))?;
        tx.commit()?;

        debug!(
            "Started {} operation {} for account {}",
            kind.as_str(),
            operation_id,
            account_id
        );
        Ok(BeginOutcome::Started(created))
    }

    fn set_chunks_total(&self, operation_id: &str, chunks_total: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sync_operations SET chunks_total = ?1, updated_at = ?2
             WHERE operation_id = ?3 AND status = 'pending'",
            params![chunks_total as i64, Self::now(), operation_id],
        )?;
        Ok(())
    }

    fn record_chunk(&self, operation_id: &str, report: &ChunkReport) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let errors = Self::merged_errors(&tx, operation_id, &report.errors)?;
        let changed = tx.execute(
            "UPDATE sync_operations SET
                chunks_done = MIN(chunks_done + 1, chunks_total),
                items_created = items_created + ?1,
                items_updated = items_updated + ?2,
                items_skipped = items_skipped + ?3,
                error_count = error_count + ?4,
                errors = ?5,
                updated_at = ?6
             WHERE operation_id = ?7 AND status = 'pending'",
            params![
                report.created as i64,
                report.updated as i64,
                report.skipped as i64,
                report.errors.len() as i64,
                errors,
                Self::now(),
                operation_id
            ],
        )?;
        tx.commit()?;
        Ok(changed > 0)
    }

    fn complete(&self, operation_id: &str) -> Result<bool> {
        self.finish(operation_id, OperationStatus::Completed)
    }

    fn fail(&self, operation_id: &str, reason: &str) -> Result<bool> {
        {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let errors = Self::merged_errors(
                &tx,
                operation_id,
                &[SyncError {
                    chunk: None,
                    item: None,
                    message: reason.to_string(),
                }],
            )?;
            tx.execute(
                "UPDATE sync_operations SET errors = ?1, error_count = error_count + 1
                 WHERE operation_id = ?2 AND status = 'pending'",
                params![errors, operation_id],
            )?;
            tx.commit()?;
        }
        self.finish(operation_id, OperationStatus::Failed)
    }

    fn cancel(&self, operation_id: &str) -> Result<bool> {
        self.finish(operation_id, OperationStatus::Cancelled)
    }

    fn get(&self, operation_id: &str) -> Result<Option<SyncOperation>> {
        let conn = self.conn.lock().unwrap();
        Self::fetch(&conn, operation_id)
    }

    fn latest_for_account(&self, account_id: &str) -> Result<Option<SyncOperation>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT * FROM sync_operations WHERE account_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                params![account_id],
                Self::row_to_operation,
            )
            .optional()?)
    }
}
