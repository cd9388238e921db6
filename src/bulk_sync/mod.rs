//! Chunked bulk sync engine.
//!
//! A full export is split into fixed-size chunks that run with bounded
//! concurrency. Each chunk has its own storage session and its own retry
//! scope, so one chunk's lock conflict or failure never blocks or corrupts
//! another. Progress reaches the ledger through exactly one path:
//! [`SyncLedger::record_chunk`] after each chunk settles.

mod chunk;
mod export;
mod resolver;

pub use export::{parse_export, rows_from_value, ExportRow};
pub use resolver::{CatalogResolver, IdentityResolver, StaticResolver};

use crate::catalog_api::{CatalogOperation, OutboundCall};
use crate::gate::OutboundGate;
use crate::inventory::SqliteInventoryStore;
use crate::ledger::{BeginOutcome, ChunkReport, OperationKind, OperationStatus, SyncLedger, SyncOperation};
use crate::metrics;
use crate::retry::RetryPolicy;
use crate::sqlite_persistence::is_transient_conflict;
use anyhow::{bail, Context, Result};
use chunk::{failed_chunk_report, process_chunk, ChunkGuard};
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct BulkSyncSettings {
    pub chunk_size: usize,
    /// Chunks in flight at once.
    pub concurrency: usize,
    /// Retries per chunk after transient storage conflicts.
    pub retry: RetryPolicy,
    /// A chunk still running after this long is abandoned and fails.
    pub chunk_timeout: Duration,
}

impl Default for BulkSyncSettings {
    fn default() -> Self {
        Self {
            chunk_size: 5000,
            concurrency: 3,
            retry: RetryPolicy::default(),
            chunk_timeout: Duration::from_secs(300),
        }
    }
}

/// How a sync request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// This call did the work; the operation is now terminal.
    Finished(SyncOperation),
    /// The operation id had already finished. Nothing was done.
    Replayed(SyncOperation),
    /// The operation id is pending elsewhere. Nothing was done.
    AlreadyRunning(SyncOperation),
}

impl SyncOutcome {
    pub fn operation(&self) -> &SyncOperation {
        match self {
            SyncOutcome::Finished(op) | SyncOutcome::Replayed(op) | SyncOutcome::AlreadyRunning(op) => op,
        }
    }
}

enum ChunkFailure {
    Transient(anyhow::Error),
    Permanent(anyhow::Error),
    TimedOut,
}

pub struct BulkSyncEngine {
    store: SqliteInventoryStore,
    ledger: Arc<dyn SyncLedger>,
    resolver: Arc<dyn CatalogResolver>,
    gate: Option<Arc<OutboundGate>>,
    settings: BulkSyncSettings,
    shutdown: CancellationToken,
}

impl BulkSyncEngine {
    pub fn new(
        store: SqliteInventoryStore,
        ledger: Arc<dyn SyncLedger>,
        resolver: Arc<dyn CatalogResolver>,
        settings: BulkSyncSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            resolver,
            gate: None,
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    /// Enables [`sync_account`](Self::sync_account), which fetches exports
    /// through `gate`.
    pub fn with_gate(mut self, gate: Arc<OutboundGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Token that stops dispatch of new chunks for every operation this
    /// engine runs.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancels a pending operation. Chunks already running finish; chunks
    /// not yet started never start.
    pub fn cancel(&self, operation_id: &str) -> Result<bool> {
        self.ledger.cancel(operation_id)
    }

    fn chunk_count(&self, rows: usize) -> u64 {
        rows.div_ceil(self.settings.chunk_size.max(1)) as u64
    }

    /// Imports `rows` (an already-fetched export) for `account_id` under
    /// `operation_id`.
    pub async fn import_rows(
        &self,
        account_id: &str,
        operation_id: &str,
        kind: OperationKind,
        rows: Vec<Value>,
    ) -> Result<SyncOutcome> {
        let metadata = json!({"rows": rows.len(), "chunk_size": self.settings.chunk_size});
        let operation = match self.ledger.begin_operation(
            account_id,
            operation_id,
            kind,
            self.chunk_count(rows.len()),
            metadata,
        )? {
            BeginOutcome::Started(op) => op,
            BeginOutcome::Replay(op) => return Ok(SyncOutcome::Replayed(op)),
            BeginOutcome::InProgress(op) => return Ok(SyncOutcome::AlreadyRunning(op)),
        };

        self.run_chunks(&operation, rows).await
    }

    /// Parses a raw export and imports it. An export that cannot be parsed
    /// leaves the operation `failed`.
    pub async fn import_export(
        &self,
        account_id: &str,
        operation_id: &str,
        kind: OperationKind,
        export: &[u8],
    ) -> Result<SyncOutcome> {
        match parse_export(export) {
            Ok(rows) => self.import_rows(account_id, operation_id, kind, rows).await,
            Err(err) => self.fail_unparsed(account_id, operation_id, kind, &format!("{:#}", err)),
        }
    }

    fn fail_unparsed(
        &self,
        account_id: &str,
        operation_id: &str,
        kind: OperationKind,
        reason: &str,
    ) -> Result<SyncOutcome> {
        match self
            .ledger
            .begin_operation(account_id, operation_id, kind, 0, json!({}))?
        {
            BeginOutcome::Started(_) => {}
            BeginOutcome::Replay(op) => return Ok(SyncOutcome::Replayed(op)),
            BeginOutcome::InProgress(op) => return Ok(SyncOutcome::AlreadyRunning(op)),
        }
        error!("Operation {} failed: {}", operation_id, reason);
        self.ledger.fail(operation_id, reason)?;
        self.finished(operation_id)
    }

    /// Fetches the account's full export through the outbound gate and
    /// imports it.
    pub async fn sync_account(
        &self,
        account_id: &str,
        operation_id: &str,
        kind: OperationKind,
    ) -> Result<SyncOutcome> {
        let Some(gate) = self.gate.as_ref() else {
            bail!("Account sync needs an outbound gate");
        };

        let operation = match self.ledger.begin_operation(
            account_id,
            operation_id,
            kind,
            0,
            json!({"source": CatalogOperation::ExportProducts.as_str()}),
        )? {
            BeginOutcome::Started(op) => op,
            BeginOutcome::Replay(op) => return Ok(SyncOutcome::Replayed(op)),
            BeginOutcome::InProgress(op) => return Ok(SyncOutcome::AlreadyRunning(op)),
        };

        info!("Fetching export for account {} ({})", account_id, operation_id);
        let fetched = gate
            .call(OutboundCall::new(account_id, CatalogOperation::ExportProducts))
            .await;
        let rows = match fetched
            .map_err(anyhow::Error::from)
            .and_then(rows_from_value)
        {
            Ok(rows) => rows,
            Err(err) => {
                let reason = format!("export fetch failed: {:#}", err);
                error!("Operation {} failed: {}", operation_id, reason);
                self.ledger_write(operation_id, "fail", || self.ledger.fail(operation_id, &reason))
                    .await?;
                return self.finished(operation_id);
            }
        };

        let chunks_total = self.chunk_count(rows.len());
        if let Err(err) = self
            .ledger_write(operation_id, "chunk count", || {
                self.ledger.set_chunks_total(operation_id, chunks_total)
            })
            .await
        {
            self.abort(operation_id, &err).await;
            return Err(err);
        }
        let operation = SyncOperation {
            chunks_total: self.chunk_count(rows.len()),
            ..operation
        };
        self.run_chunks(&operation, rows).await
    }

    fn finished(&self, operation_id: &str) -> Result<SyncOutcome> {
        let op = self
            .ledger
            .get(operation_id)?
            .with_context(|| format!("Operation {} disappeared", operation_id))?;
        Ok(SyncOutcome::Finished(op))
    }

    fn is_cancelled(&self, operation_id: &str) -> bool {
        if self.shutdown.is_cancelled() {
            return true;
        }
        match self.ledger.get(operation_id) {
            Ok(Some(op)) => op.status == OperationStatus::Cancelled,
            Ok(None) => false,
            Err(err) => {
                warn!("Could not read status of {}: {:#}", operation_id, err);
                false
            }
        }
    }

    /// Retries a ledger write that hit a busy or locked database, with the
    /// chunk backoff policy.
    async fn ledger_write<T>(
        &self,
        operation_id: &str,
        what: &str,
        mut write: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let policy = &self.settings.retry;
        let mut retries = 0u32;
        loop {
            match write() {
                Ok(value) => return Ok(value),
                Err(err) if is_transient_conflict(&err) && policy.should_retry(retries) => {
                    let delay = policy.delay(retries);
                    retries += 1;
                    warn!(
                        "Ledger {} for {} hit a storage conflict (retry {}/{} in {:?}): {:#}",
                        what, operation_id, retries, policy.max_retries, delay, err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("Ledger {} for {} failed", what, operation_id)
                    })
                }
            }
        }
    }

    /// Marks an operation whose run stopped on an error as failed, so a
    /// resubmit replays it instead of finding it pending forever.
    async fn abort(&self, operation_id: &str, err: &anyhow::Error) {
        let reason = format!("sync aborted: {:#}", err);
        error!("Operation {} failed: {}", operation_id, reason);
        if let Err(fail_err) = self
            .ledger_write(operation_id, "fail", || self.ledger.fail(operation_id, &reason))
            .await
        {
            error!(
                "Operation {} could not be marked failed and stays pending: {:#}",
                operation_id, fail_err
            );
        }
    }

    async fn run_chunks(&self, operation: &SyncOperation, rows: Vec<Value>) -> Result<SyncOutcome> {
        let operation_id = operation.operation_id.as_str();
        match self.drive_chunks(operation, rows).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.abort(operation_id, &err).await;
                Err(err)
            }
        }
    }

    async fn drive_chunks(&self, operation: &SyncOperation, rows: Vec<Value>) -> Result<SyncOutcome> {
        let operation_id = operation.operation_id.as_str();
        let account_id = operation.account_id.as_str();
        let started = Instant::now();

        if rows.is_empty() {
            info!("Operation {} has an empty export, nothing to do", operation_id);
            self.ledger_write(operation_id, "complete", || self.ledger.complete(operation_id))
                .await?;
            return self.finished(operation_id);
        }

        let chunk_size = self.settings.chunk_size.max(1);
        let chunks: Vec<Arc<[Value]>> = rows
            .chunks(chunk_size)
            .map(|chunk| Arc::from(chunk.to_vec()))
            .collect();
        drop(rows);
        let total = chunks.len();
        info!(
            "Operation {} for account {}: {} chunks of up to {} rows, {} in flight",
            operation_id, account_id, total, chunk_size, self.settings.concurrency
        );

        let mut results = stream::iter(chunks.into_iter().enumerate())
            .map(|(index, rows)| self.run_chunk(account_id, operation_id, index, total, rows))
            .buffer_unordered(self.settings.concurrency.max(1));

        let mut skipped_chunks = 0usize;
        while let Some(report) = results.next().await {
            match report {
                Some(report) => {
                    metrics::record_sync_items(report.created, report.updated, report.skipped);
                    let recorded = self
                        .ledger_write(operation_id, "chunk record", || {
                            self.ledger.record_chunk(operation_id, &report)
                        })
                        .await?;
                    if !recorded {
                        warn!(
                            "Operation {} is no longer pending, chunk result discarded",
                            operation_id
                        );
                    }
                }
                None => skipped_chunks += 1,
            }
        }

        if skipped_chunks > 0 {
            self.ledger_write(operation_id, "cancel", || self.ledger.cancel(operation_id))
                .await?;
            warn!(
                "Operation {} cancelled with {} chunks never started",
                operation_id, skipped_chunks
            );
        } else {
            self.ledger_write(operation_id, "complete", || self.ledger.complete(operation_id))
                .await?;
        }

        let outcome = self.finished(operation_id)?;
        let op = outcome.operation();
        info!(
            "Operation {} {} in {:?}: {} created, {} updated, {} skipped, {} errors",
            operation_id,
            op.status.as_str(),
            started.elapsed(),
            op.created,
            op.updated,
            op.skipped,
            op.error_count
        );
        Ok(outcome)
    }

    /// Runs one chunk to a settled result, retrying transient storage
    /// conflicts. Returns `None` when the chunk was never started because
    /// the operation was cancelled.
    async fn run_chunk(
        &self,
        account_id: &str,
        operation_id: &str,
        index: usize,
        total: usize,
        rows: Arc<[Value]>,
    ) -> Option<ChunkReport> {
        if self.is_cancelled(operation_id) {
            return None;
        }

        let policy = &self.settings.retry;
        let mut retries = 0u32;
        loop {
            let started = Instant::now();
            info!(
                "Chunk {}/{} of {} started ({} rows)",
                index + 1,
                total,
                operation_id,
                rows.len()
            );
            match self.attempt_chunk(account_id, rows.clone()).await {
                Ok(report) => {
                    metrics::record_chunk("completed");
                    info!(
                        "Chunk {}/{} of {} finished in {:?}: {} created, {} updated, {} skipped",
                        index + 1,
                        total,
                        operation_id,
                        started.elapsed(),
                        report.created,
                        report.updated,
                        report.skipped
                    );
                    return Some(report);
                }
                Err(ChunkFailure::Transient(err)) if policy.should_retry(retries) => {
                    let delay = policy.delay(retries);
                    retries += 1;
                    metrics::record_chunk_retry();
                    warn!(
                        "Chunk {}/{} of {} hit a storage conflict (retry {}/{} in {:?}): {:#}",
                        index + 1,
                        total,
                        operation_id,
                        retries,
                        policy.max_retries,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(failure) => {
                    let reason = match failure {
                        ChunkFailure::Transient(err) => {
                            format!("storage conflict after {} retries: {:#}", retries, err)
                        }
                        ChunkFailure::Permanent(err) => format!("{:#}", err),
                        ChunkFailure::TimedOut => format!(
                            "chunk abandoned after {:?}",
                            self.settings.chunk_timeout
                        ),
                    };
                    metrics::record_chunk("failed");
                    error!(
                        "Chunk {}/{} of {} failed: {}",
                        index + 1,
                        total,
                        operation_id,
                        reason
                    );
                    return Some(failed_chunk_report(index, &rows, &reason));
                }
            }
        }
    }

    /// One attempt on a blocking thread, bounded by the chunk timeout.
    async fn attempt_chunk(
        &self,
        account_id: &str,
        rows: Arc<[Value]>,
    ) -> Result<ChunkReport, ChunkFailure> {
        let guard = Arc::new(ChunkGuard::default());
        let mut task = {
            let store = self.store.clone();
            let resolver = self.resolver.clone();
            let account_id = account_id.to_string();
            let guard = guard.clone();
            tokio::task::spawn_blocking(move || {
                process_chunk(&store, resolver.as_ref(), &account_id, &rows, &guard)
            })
        };

        let joined = match tokio::time::timeout(self.settings.chunk_timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) if guard.abandon() => return Err(ChunkFailure::TimedOut),
            // Committed just as the deadline passed; collect its report.
            Err(_) => task.await,
        };
        match joined {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(err)) if is_transient_conflict(&err) => Err(ChunkFailure::Transient(err)),
            Ok(Err(err)) => Err(ChunkFailure::Permanent(err)),
            Err(join_err) => Err(ChunkFailure::Permanent(anyhow::anyhow!(
                "chunk worker panicked: {}",
                join_err
            ))),
        }
    }
}
