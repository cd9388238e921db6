//! The blocking work of one chunk: decode, resolve, one existence lookup,
//! one batched insert and one batched update, in one storage session.

use super::export::{raw_listing_id, ExportRow};
use super::resolver::CatalogResolver;
use crate::inventory::{ItemKey, ItemUpsert, SqliteInventoryStore};
use crate::ledger::{ChunkReport, SyncError};
use anyhow::{bail, Result};
use rusqlite::InterruptHandle;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::debug;

#[derive(Default)]
struct GuardState {
    abandoned: bool,
    committed: bool,
    interrupt: Option<InterruptHandle>,
}

/// Shared between a running chunk and the task waiting on it, so a chunk
/// that outlives its deadline can be stopped and kept from committing.
///
/// Abandoning and committing take the same lock: a chunk is either
/// abandoned before its commit starts, or committed and no longer
/// abandonable.
#[derive(Default)]
pub(crate) struct ChunkGuard {
    state: Mutex<GuardState>,
}

impl ChunkGuard {
    fn attach(&self, handle: InterruptHandle) {
        self.state.lock().unwrap().interrupt = Some(handle);
    }

    fn is_abandoned(&self) -> bool {
        self.state.lock().unwrap().abandoned
    }

    /// Runs `commit` unless the chunk was abandoned first.
    fn commit_unless_abandoned(&self, commit: impl FnOnce() -> Result<()>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.abandoned {
            bail!("chunk abandoned after its deadline, rolled back");
        }
        commit()?;
        state.committed = true;
        Ok(())
    }

    /// Marks the chunk abandoned and interrupts any statement in flight.
    /// Returns false when the chunk had already committed; its writes stand.
    pub(crate) fn abandon(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.committed {
            return false;
        }
        state.abandoned = true;
        if let Some(handle) = state.interrupt.as_ref() {
            handle.interrupt();
        }
        true
    }
}

/// Turns raw rows into upserts. Rows without a listing id or blueprint id,
/// rows whose blueprint does not resolve, and rows that fail to decode are
/// skipped. When a chunk lists the same key twice the last row wins and the
/// earlier one counts as skipped.
pub(crate) fn prepare_rows(
    rows: &[Value],
    resolver: &dyn CatalogResolver,
) -> Result<(Vec<ItemUpsert>, u64)> {
    let mut skipped = 0u64;
    let mut decoded = Vec::with_capacity(rows.len());
    for raw in rows {
        match ExportRow::deserialize(raw) {
            Ok(row) => match (row.id.clone(), row.blueprint_id) {
                (Some(listing_id), Some(blueprint_id)) => {
                    decoded.push((row, listing_id, blueprint_id))
                }
                _ => skipped += 1,
            },
            Err(err) => {
                debug!(
                    "Skipping malformed export row {:?}: {}",
                    raw_listing_id(raw),
                    err
                );
                skipped += 1;
            }
        }
    }

    let mut blueprint_ids: Vec<i64> = decoded.iter().map(|(_, _, bp)| *bp).collect();
    blueprint_ids.sort_unstable();
    blueprint_ids.dedup();
    let mapping = resolver.resolve(&blueprint_ids)?;

    let mut upserts: Vec<ItemUpsert> = Vec::with_capacity(decoded.len());
    let mut positions: HashMap<ItemKey, usize> = HashMap::with_capacity(decoded.len());
    for (row, listing_id, blueprint_id) in decoded {
        let Some(catalog_item_id) = mapping.get(&blueprint_id) else {
            skipped += 1;
            continue;
        };
        let upsert = row.to_upsert(*catalog_item_id, listing_id);
        match positions.get(&upsert.key()) {
            Some(&position) => {
                upserts[position] = upsert;
                skipped += 1;
            }
            None => {
                positions.insert(upsert.key(), upserts.len());
                upserts.push(upsert);
            }
        }
    }
    Ok((upserts, skipped))
}

pub(crate) fn process_chunk(
    store: &SqliteInventoryStore,
    resolver: &dyn CatalogResolver,
    account_id: &str,
    rows: &[Value],
    guard: &ChunkGuard,
) -> Result<ChunkReport> {
    let (upserts, skipped) = prepare_rows(rows, resolver)?;
    if guard.is_abandoned() {
        bail!("chunk abandoned before writing");
    }

    let session = store.begin_session()?;
    guard.attach(session.interrupt_handle());

    let keys: Vec<ItemKey> = upserts.iter().map(ItemUpsert::key).collect();
    let existing: HashSet<ItemKey> = session.find_existing(account_id, &keys)?;
    let (to_update, to_insert): (Vec<ItemUpsert>, Vec<ItemUpsert>) = upserts
        .into_iter()
        .partition(|upsert| existing.contains(&upsert.key()));

    session.insert_items(account_id, &to_insert)?;
    session.update_items(account_id, &to_update)?;

    guard.commit_unless_abandoned(|| session.commit())?;

    Ok(ChunkReport {
        created: to_insert.len() as u64,
        updated: to_update.len() as u64,
        skipped,
        errors: vec![],
    })
}

/// Report for a chunk whose writes were given up on: every row goes into
/// the error list.
pub(crate) fn failed_chunk_report(index: usize, rows: &[Value], reason: &str) -> ChunkReport {
    ChunkReport {
        created: 0,
        updated: 0,
        skipped: 0,
        errors: rows
            .iter()
            .enumerate()
            .map(|(offset, row)| SyncError {
                chunk: Some(index),
                item: Some(raw_listing_id(row).unwrap_or_else(|| format!("row {}", offset))),
                message: reason.to_string(),
            })
            .collect(),
    }
}
