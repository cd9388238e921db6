use super::constants::{ACCOUNT, BLUEPRINT_SPREAD, DEPENDENCY, WEBHOOK_SECRET};
use inventory_sync::bulk_sync::{BulkSyncEngine, BulkSyncSettings, CatalogResolver, IdentityResolver};
use inventory_sync::catalog_api::CatalogApi;
use inventory_sync::circuit_breaker::{BreakerSettings, CircuitBreaker};
use inventory_sync::clock::Clock;
use inventory_sync::gate::{GateSettings, OutboundGate};
use inventory_sync::inventory::{ItemUpsert, SqliteInventoryStore};
use inventory_sync::ledger::SqliteSyncLedger;
use inventory_sync::rate_limit::{
    AccountRateLimiter, AdaptiveLimitController, AdaptiveSettings, TokenBucket,
    DEFAULT_REFILL_WINDOW,
};
use inventory_sync::shared_state::SharedStateStore;
use inventory_sync::webhook::{SignaturePolicy, WebhookReconciler};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A fresh on-disk inventory database with its ledger.
pub struct TestEnv {
    pub dir: TempDir,
    pub store: SqliteInventoryStore,
    pub ledger: Arc<SqliteSyncLedger>,
}

#[allow(dead_code)]
impl TestEnv {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("inventory.db");
        let store = SqliteInventoryStore::open(&path).expect("Failed to open inventory store");
        let ledger = Arc::new(SqliteSyncLedger::open(&path).expect("Failed to open ledger"));
        Self { dir, store, ledger }
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("inventory.db")
    }

    pub fn bulk_sync(&self, chunk_size: usize, concurrency: usize) -> BulkSyncEngine {
        self.bulk_sync_with(Arc::new(IdentityResolver), chunk_size, concurrency)
    }

    pub fn bulk_sync_with(
        &self,
        resolver: Arc<dyn CatalogResolver>,
        chunk_size: usize,
        concurrency: usize,
    ) -> BulkSyncEngine {
        BulkSyncEngine::new(
            self.store.clone(),
            self.ledger.clone(),
            resolver,
            BulkSyncSettings {
                chunk_size,
                concurrency,
                ..Default::default()
            },
        )
    }

    pub fn webhooks(&self, policy: SignaturePolicy) -> WebhookReconciler {
        WebhookReconciler::new(
            self.store.clone(),
            self.ledger.clone(),
            HashMap::from([(ACCOUNT.to_string(), WEBHOOK_SECRET.to_string())]),
            policy,
        )
    }

    pub fn quantity(&self, account_id: &str, listing_id: &str) -> Option<i64> {
        self.store
            .find_by_listing(account_id, listing_id)
            .unwrap()
            .map(|item| item.quantity)
    }
}

/// Export row for listing `listing` whose blueprint id cycles through
/// [`BLUEPRINT_SPREAD`] values.
pub fn export_row(listing: i64, quantity: i64) -> Value {
    json!({
        "id": listing,
        "blueprint_id": listing % BLUEPRINT_SPREAD,
        "quantity": quantity,
        "price_cents": 100 + listing % 900,
        "properties_hash": {"condition": "Near Mint", "mtg_language": "en"},
        "description": format!("listing {}", listing),
        "graded": listing % 7 == 0
    })
}

pub fn export_rows(listings: std::ops::Range<i64>) -> Vec<Value> {
    listings.map(|listing| export_row(listing, 4)).collect()
}

/// Writes listings directly, as if an earlier sync had created them. Uses
/// the same catalog item mapping as [`export_row`] with the identity
/// resolver.
pub fn seed_items(store: &SqliteInventoryStore, account_id: &str, listings: &[(i64, i64)]) {
    let items: Vec<ItemUpsert> = listings
        .iter()
        .map(|(listing, quantity)| ItemUpsert {
            catalog_item_id: listing % BLUEPRINT_SPREAD,
            external_listing_id: listing.to_string(),
            quantity: *quantity,
            price_cents: 1,
            properties: json!({}),
            description: None,
            user_data_field: None,
            graded: false,
        })
        .collect();
    let session = store.begin_session().unwrap();
    session.insert_items(account_id, &items).unwrap();
    session.commit().unwrap();
}

/// Gate over `api` with its limiter and breaker state in `shared`. Backoff
/// and timeouts are shortened so tests run fast.
pub fn gate_with(
    api: Arc<dyn CatalogApi>,
    shared: Arc<dyn SharedStateStore>,
    clock: Arc<dyn Clock>,
    breaker: BreakerSettings,
) -> OutboundGate {
    let limiter = AccountRateLimiter::new(
        TokenBucket::new(shared.clone(), clock.clone(), DEFAULT_REFILL_WINDOW),
        AdaptiveLimitController::new(shared.clone(), clock.clone(), AdaptiveSettings::default()),
    );
    let breaker = CircuitBreaker::new(DEPENDENCY, shared, clock, breaker);
    let mut settings = GateSettings {
        request_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    settings.backoff.initial_backoff = Duration::from_millis(1);
    settings.backoff.max_backoff = Duration::from_millis(5);
    OutboundGate::new(api, Arc::new(limiter), Arc::new(breaker), settings)
}
