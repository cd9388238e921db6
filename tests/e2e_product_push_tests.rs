//! End-to-end tests for pushing local listing edits through the gate.

mod common;

use common::{gate_with, seed_items, ScriptedCatalogApi, TestEnv, ACCOUNT};
use inventory_sync::catalog_api::{ApiError, CatalogOperation};
use inventory_sync::circuit_breaker::BreakerSettings;
use inventory_sync::clock::SystemClock;
use inventory_sync::gate::GateError;
use inventory_sync::product_push::{ProductPusher, PushError, PushOutcome};
use inventory_sync::shared_state::InMemorySharedStateStore;
use serde_json::json;
use std::sync::Arc;

fn pusher(env: &TestEnv, api: Arc<ScriptedCatalogApi>) -> ProductPusher {
    let gate = gate_with(
        api,
        Arc::new(InMemorySharedStateStore::new()),
        Arc::new(SystemClock),
        BreakerSettings::default(),
    );
    ProductPusher::new(env.store.clone(), Arc::new(gate))
}

#[tokio::test]
async fn test_update_sends_local_fields_and_returns_job() {
    let env = TestEnv::new();
    seed_items(&env.store, ACCOUNT, &[(501, 6)]);
    let api = Arc::new(ScriptedCatalogApi::always(Ok(json!({"job": "job-1"}))));

    let outcome = pusher(&env, api.clone())
        .push_update(ACCOUNT, "501")
        .await
        .unwrap();

    assert_eq!(
        outcome,
        PushOutcome::Queued {
            job_id: "job-1".to_string()
        }
    );
    let received = api.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].account_id, ACCOUNT);
    assert_eq!(received[0].operation, CatalogOperation::BulkUpdateProducts);
    let product = &received[0].payload["products"][0];
    assert_eq!(product["id"], json!(501));
    assert_eq!(product["quantity"], json!(6));
    assert_eq!(product["price"], json!(0.01));
}

#[tokio::test]
async fn test_quantity_delta_is_applied_locally_then_pushed() {
    let env = TestEnv::new();
    seed_items(&env.store, ACCOUNT, &[(501, 6)]);
    let api = Arc::new(ScriptedCatalogApi::new(
        vec![Ok(json!({"job": "job-2"}))],
        Ok(json!({"state": "completed", "stats": {"ok": 1}})),
    ));
    let pusher = pusher(&env, api.clone());

    let outcome = pusher.adjust_quantity(ACCOUNT, "501", -2).await.unwrap();
    assert!(matches!(outcome, PushOutcome::Queued { .. }));
    assert_eq!(env.quantity(ACCOUNT, "501"), Some(4));
    assert_eq!(
        api.received()[0].payload,
        json!({"products": [{"id": 501, "quantity": 4}]})
    );

    let status = pusher.job_status(ACCOUNT, "job-2").await.unwrap();
    assert_eq!(status["state"], "completed");
    assert_eq!(
        api.operations()[1],
        CatalogOperation::JobStatus {
            job_id: "job-2".to_string()
        }
    );
}

#[tokio::test]
async fn test_delete_of_listing_already_gone_remotely_still_removes_it_locally() {
    let env = TestEnv::new();
    seed_items(&env.store, ACCOUNT, &[(501, 6), (502, 1)]);
    let api = Arc::new(ScriptedCatalogApi::always(Ok(json!({"status": "already_deleted"}))));

    let outcome = pusher(&env, api.clone())
        .push_delete(ACCOUNT, "501")
        .await
        .unwrap();

    assert_eq!(
        outcome,
        PushOutcome::Deleted {
            already_deleted: true,
            local_rows_removed: 1
        }
    );
    assert_eq!(
        api.operations(),
        vec![CatalogOperation::DeleteProduct {
            product_id: "501".to_string()
        }]
    );
    assert_eq!(env.quantity(ACCOUNT, "501"), None);
    assert_eq!(env.quantity(ACCOUNT, "502"), Some(1));
}

#[tokio::test]
async fn test_unknown_listing_sends_nothing() {
    let env = TestEnv::new();
    let api = Arc::new(ScriptedCatalogApi::always(Ok(json!({"job": "unused"}))));
    let pusher = pusher(&env, api.clone());

    assert_eq!(
        pusher.push_update(ACCOUNT, "404").await.unwrap(),
        PushOutcome::ListingNotFound
    );
    assert_eq!(
        pusher.adjust_quantity(ACCOUNT, "404", 1).await.unwrap(),
        PushOutcome::ListingNotFound
    );
    assert_eq!(api.calls(), 0);
}

#[tokio::test]
async fn test_rejected_push_keeps_local_change() {
    let env = TestEnv::new();
    seed_items(&env.store, ACCOUNT, &[(501, 6)]);
    let api = Arc::new(ScriptedCatalogApi::always(Err(ApiError::Validation(
        "quantity out of range".to_string(),
    ))));

    let result = pusher(&env, api.clone())
        .adjust_quantity(ACCOUNT, "501", 3)
        .await;

    assert!(matches!(result, Err(PushError::Gate(GateError::Validation(_)))));
    assert_eq!(env.quantity(ACCOUNT, "501"), Some(9));
    assert_eq!(api.calls(), 1);
}
