//! Webhook reconciler: applies inbound order events to local inventory.
//!
//! Every event becomes one `webhook_apply` operation in the ledger, keyed by
//! the event id, so a redelivered event is a replay and changes nothing.
//! The reconciler only writes local storage. It holds no outbound gate, so
//! an inbound change can never be pushed back to the catalog it came from.

mod payload;
mod signature;

pub use payload::{OrderAction, OrderData, OrderItem, Seller, WebhookEvent};
pub use signature::{sign_payload, verify_signature, SignatureError, SignaturePolicy};

use crate::inventory::{RestoreOutcome, SaleOutcome, SqliteInventoryStore};
use crate::ledger::{BeginOutcome, ChunkReport, OperationKind, SyncError, SyncLedger, SyncOperation};
use crate::metrics;
use crate::retry::RetryPolicy;
use crate::sqlite_persistence::is_transient_conflict;
use anyhow::Context;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid webhook payload: {0}")]
    Payload(String),
    #[error("webhook has no account: none supplied and no data.seller.id")]
    NoAccount,
    #[error("webhook signature rejected: {0}")]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    /// Quantities were adjusted (or the event touched nothing adjustable).
    Applied {
        action: OrderAction,
        operation: SyncOperation,
    },
    /// The event needs no inventory change.
    Ignored {
        reason: String,
        operation: SyncOperation,
    },
    /// The event id already finished.
    Replayed(SyncOperation),
    /// The event id is being applied elsewhere.
    AlreadyRunning(SyncOperation),
}

impl WebhookOutcome {
    pub fn operation(&self) -> &SyncOperation {
        match self {
            WebhookOutcome::Applied { operation, .. }
            | WebhookOutcome::Ignored { operation, .. }
            | WebhookOutcome::Replayed(operation)
            | WebhookOutcome::AlreadyRunning(operation) => operation,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            WebhookOutcome::Applied { .. } => "applied",
            WebhookOutcome::Ignored { .. } => "ignored",
            WebhookOutcome::Replayed(_) => "replayed",
            WebhookOutcome::AlreadyRunning(_) => "in_progress",
        }
    }
}

pub struct WebhookReconciler {
    store: SqliteInventoryStore,
    ledger: Arc<dyn SyncLedger>,
    /// Webhook shared secret per account.
    secrets: HashMap<String, String>,
    policy: SignaturePolicy,
    retry: RetryPolicy,
}

fn cause_label(cause: &str) -> &'static str {
    match cause {
        "order.create" => "order.create",
        "order.update" => "order.update",
        "order.destroy" => "order.destroy",
        _ => "other",
    }
}

/// Events without an id are keyed by a digest of their body, so the same
/// delivery is still recognized as a replay.
fn operation_id(event: &WebhookEvent, body: &[u8]) -> String {
    match &event.id {
        Some(id) => format!("webhook:{}", id),
        None => {
            let digest = Sha256::digest(body);
            let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
            format!("webhook:sha256:{}", hex)
        }
    }
}

impl WebhookReconciler {
    pub fn new(
        store: SqliteInventoryStore,
        ledger: Arc<dyn SyncLedger>,
        secrets: HashMap<String, String>,
        policy: SignaturePolicy,
    ) -> Self {
        Self {
            store,
            ledger,
            secrets,
            policy,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn policy(&self) -> SignaturePolicy {
        self.policy
    }

    /// Checks the signature per policy. Returns an error only when the
    /// policy rejects.
    fn check_signature(
        &self,
        account_id: &str,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<(), SignatureError> {
        let result = match (self.secrets.get(account_id), signature) {
            (None, _) => Err(SignatureError::MissingSecret(account_id.to_string())),
            (Some(_), None) => Err(SignatureError::MissingSignature),
            (Some(secret), Some(signature)) => verify_signature(body, signature, secret),
        };
        let Err(err) = result else {
            debug!("Webhook signature valid for account {}", account_id);
            return Ok(());
        };

        metrics::record_webhook_signature_failure();
        match self.policy {
            SignaturePolicy::LogAndAccept => {
                warn!(
                    "Webhook signature check failed for account {}: {}; processing anyway",
                    account_id, err
                );
                Ok(())
            }
            SignaturePolicy::Reject => {
                warn!(
                    "Webhook signature check failed for account {}: {}; rejected",
                    account_id, err
                );
                Err(err)
            }
        }
    }

    /// Verifies and applies one raw webhook delivery. `account_id` overrides
    /// the seller id carried in the payload.
    pub async fn apply(
        &self,
        body: &[u8],
        signature: Option<&str>,
        account_id: Option<&str>,
    ) -> Result<WebhookOutcome, WebhookError> {
        let event = WebhookEvent::parse(body).map_err(|e| WebhookError::Payload(e.to_string()))?;
        let cause = cause_label(&event.cause);
        let account_id = account_id
            .or(event.seller_id())
            .map(str::to_string)
            .ok_or(WebhookError::NoAccount)?;

        if let Err(err) = self.check_signature(&account_id, body, signature) {
            metrics::record_webhook_event(cause, "rejected");
            return Err(err.into());
        }

        let operation_id = operation_id(&event, body);
        info!(
            "Processing webhook {}: cause={}, mode={}, account={}",
            operation_id,
            event.cause,
            event.mode.as_deref().unwrap_or("live"),
            account_id
        );

        let result = self.apply_event(&event, &account_id, &operation_id).await;
        match &result {
            Ok(outcome) => metrics::record_webhook_event(cause, outcome.label()),
            Err(_) => metrics::record_webhook_event(cause, "failed"),
        }
        result
    }

    async fn apply_event(
        &self,
        event: &WebhookEvent,
        account_id: &str,
        operation_id: &str,
    ) -> Result<WebhookOutcome, WebhookError> {
        let action = event.action();
        let metadata = json!({
            "cause": event.cause,
            "order_id": event.data.id,
            "state": event.data.state,
            "action": action.as_str(),
        });
        match self.ledger.begin_operation(
            account_id,
            operation_id,
            OperationKind::WebhookApply,
            1,
            metadata,
        )? {
            BeginOutcome::Started(_) => {}
            BeginOutcome::Replay(op) => return Ok(WebhookOutcome::Replayed(op)),
            BeginOutcome::InProgress(op) => return Ok(WebhookOutcome::AlreadyRunning(op)),
        }

        if let OrderAction::Ignore(reason) = action {
            info!("Webhook {} ignored: {}", operation_id, reason);
            self.ledger.record_chunk(operation_id, &ChunkReport::default())?;
            self.ledger.complete(operation_id)?;
            return Ok(WebhookOutcome::Ignored {
                reason,
                operation: self.fetch(operation_id)?,
            });
        }

        let Some(order_id) = event.data.id.clone() else {
            let reason = "order event has no order id";
            error!("Webhook {} failed: {}", operation_id, reason);
            self.ledger.fail(operation_id, reason)?;
            return Err(WebhookError::Payload(reason.to_string()));
        };

        match self
            .adjust_with_retry(event, &action, account_id, &order_id)
            .await
        {
            Ok(report) => {
                self.ledger.record_chunk(operation_id, &report)?;
                self.ledger.complete(operation_id)?;
                info!(
                    "Webhook {} applied {} for order {}: {} items adjusted, {} skipped, {} errors",
                    operation_id,
                    action.as_str(),
                    order_id,
                    report.updated,
                    report.skipped,
                    report.errors.len()
                );
                Ok(WebhookOutcome::Applied {
                    action,
                    operation: self.fetch(operation_id)?,
                })
            }
            Err(err) => {
                let reason = format!("{:#}", err);
                error!("Webhook {} failed: {}", operation_id, reason);
                self.ledger.fail(operation_id, &reason)?;
                Err(WebhookError::Storage(err))
            }
        }
    }

    fn fetch(&self, operation_id: &str) -> anyhow::Result<SyncOperation> {
        self.ledger
            .get(operation_id)?
            .with_context(|| format!("Operation {} disappeared", operation_id))
    }

    async fn adjust_with_retry(
        &self,
        event: &WebhookEvent,
        action: &OrderAction,
        account_id: &str,
        order_id: &str,
    ) -> anyhow::Result<ChunkReport> {
        let mut retries = 0u32;
        loop {
            let store = self.store.clone();
            let items = event.data.order_items.clone();
            let action = action.clone();
            let account = account_id.to_string();
            let order = order_id.to_string();
            let result = tokio::task::spawn_blocking(move || {
                adjust_quantities(&store, &action, &account, &order, &items)
            })
            .await
            .context("webhook worker panicked")?;

            match result {
                Err(err) if is_transient_conflict(&err) && self.retry.should_retry(retries) => {
                    let delay = self.retry.delay(retries);
                    retries += 1;
                    warn!(
                        "Order {} hit a storage conflict (retry {}/{} in {:?}): {:#}",
                        order_id, retries, self.retry.max_retries, delay, err
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

/// Sums line items per listing, in order of first appearance. Lines
/// without a listing or with a non-positive quantity are counted apart.
fn quantities_per_listing(items: &[OrderItem]) -> (Vec<(&str, i64)>, u64) {
    let mut lines: Vec<(&str, i64)> = Vec::with_capacity(items.len());
    let mut unusable = 0u64;
    for item in items {
        let Some(listing_id) = item.product_id.as_deref() else {
            unusable += 1;
            continue;
        };
        if item.quantity <= 0 {
            unusable += 1;
            continue;
        }
        match lines.iter_mut().find(|(seen, _)| *seen == listing_id) {
            Some((_, quantity)) => *quantity = quantity.saturating_add(item.quantity),
            None => lines.push((listing_id, item.quantity)),
        }
    }
    (lines, unusable)
}

/// Applies every line item of one order in one storage session. Lines for
/// the same listing are applied as one sale. Line items that fail are
/// reported and do not stop the others.
fn adjust_quantities(
    store: &SqliteInventoryStore,
    action: &OrderAction,
    account_id: &str,
    order_id: &str,
    items: &[OrderItem],
) -> anyhow::Result<ChunkReport> {
    let session = store.begin_session()?;
    let (lines, unusable) = quantities_per_listing(items);
    let mut report = ChunkReport {
        skipped: unusable,
        ..Default::default()
    };

    for (listing_id, quantity) in lines {
        let not_found = match action {
            OrderAction::Sale => {
                match session.apply_sale(account_id, order_id, listing_id, quantity)? {
                    SaleOutcome::Applied {
                        old_quantity,
                        new_quantity,
                        ..
                    } => {
                        info!(
                            "Listing {} sold {}: {} -> {}",
                            listing_id, quantity, old_quantity, new_quantity
                        );
                        report.updated += 1;
                        false
                    }
                    SaleOutcome::AlreadyApplied => {
                        report.skipped += 1;
                        false
                    }
                    SaleOutcome::ListingNotFound => true,
                }
            }
            OrderAction::Restore => match session.restore_sale(account_id, order_id, listing_id)? {
                RestoreOutcome::Restored {
                    old_quantity,
                    new_quantity,
                } => {
                    info!(
                        "Listing {} restored: {} -> {}",
                        listing_id, old_quantity, new_quantity
                    );
                    report.updated += 1;
                    false
                }
                RestoreOutcome::AlreadyRestored | RestoreOutcome::NothingToRestore => {
                    report.skipped += 1;
                    false
                }
                RestoreOutcome::ListingNotFound => true,
            },
            OrderAction::Ignore(_) => false,
        };

        if not_found {
            warn!(
                "Listing {} from order {} not found in local inventory",
                listing_id, order_id
            );
            report.errors.push(SyncError {
                chunk: None,
                item: Some(listing_id.to_string()),
                message: "listing not found in local inventory".to_string(),
            });
        }
    }

    session.commit()?;
    Ok(report)
}
