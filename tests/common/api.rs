use async_trait::async_trait;
use inventory_sync::catalog_api::{ApiError, CatalogApi, CatalogOperation, OutboundCall};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Catalog API double that replays queued responses in order, then keeps
/// answering with the fallback.
pub struct ScriptedCatalogApi {
    script: Mutex<VecDeque<Result<Value, ApiError>>>,
    fallback: Result<Value, ApiError>,
    calls: AtomicUsize,
    received: Mutex<Vec<OutboundCall>>,
}

#[allow(dead_code)]
impl ScriptedCatalogApi {
    pub fn new(script: Vec<Result<Value, ApiError>>, fallback: Result<Value, ApiError>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
            received: Mutex::new(vec![]),
        }
    }

    pub fn always(response: Result<Value, ApiError>) -> Self {
        Self::new(vec![], response)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn operations(&self) -> Vec<CatalogOperation> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|call| call.operation.clone())
            .collect()
    }

    /// Every call received, payload included, in arrival order.
    pub fn received(&self) -> Vec<OutboundCall> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl CatalogApi for ScriptedCatalogApi {
    async fn execute(&self, call: &OutboundCall) -> Result<Value, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.received.lock().unwrap().push(call.clone());
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}
