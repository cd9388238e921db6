//! Outbound call envelope and the raw client for the external catalog.
//!
//! Nothing outside the call gate should hold a [`CatalogApi`] and call it
//! directly: the gate is what keeps calls inside the rate budget and behind
//! the breaker.

mod http;

pub use http::HttpCatalogClient;

use crate::circuit_breaker::{ClassifyFailure, FailureKind};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Response status of a delete for a listing the catalog no longer has.
pub const ALREADY_DELETED: &str = "already_deleted";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogOperation {
    /// Full inventory export for one account.
    ExportProducts,
    /// Updates listings; the catalog answers with an asynchronous job id.
    BulkUpdateProducts,
    /// Removes one listing. A listing already gone answers
    /// `{"status": "already_deleted"}`.
    DeleteProduct { product_id: String },
    /// Account info, also used as a cheap connectivity probe.
    Info,
    /// Status of an asynchronous bulk job.
    JobStatus { job_id: String },
}

impl CatalogOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogOperation::ExportProducts => "products.export",
            CatalogOperation::BulkUpdateProducts => "products.bulk_update",
            CatalogOperation::DeleteProduct { .. } => "products.delete",
            CatalogOperation::Info => "info",
            CatalogOperation::JobStatus { .. } => "jobs.status",
        }
    }
}

/// One call to the external catalog on behalf of an account.
#[derive(Debug, Clone)]
pub struct OutboundCall {
    pub account_id: String,
    pub operation: CatalogOperation,
    pub payload: Value,
}

impl OutboundCall {
    pub fn new(account_id: &str, operation: CatalogOperation) -> Self {
        Self {
            account_id: account_id.to_string(),
            operation,
            payload: Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    /// 429 from the catalog.
    #[error("throttled by external catalog (retry after {retry_after:?})")]
    Throttled { retry_after: Option<Duration> },
    /// Timeouts, connection failures and 5xx responses.
    #[error("external catalog unavailable: {0}")]
    DependencyDown(String),
    /// The catalog rejected the request itself. Retrying will not help.
    #[error("request rejected by external catalog: {0}")]
    Validation(String),
}

impl ClassifyFailure for ApiError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            ApiError::Throttled { .. } | ApiError::DependencyDown(_) => FailureKind::Dependency,
            ApiError::Validation(_) => FailureKind::Neutral,
        }
    }
}

#[async_trait]
pub trait CatalogApi: Send + Sync {
    async fn execute(&self, call: &OutboundCall) -> Result<Value, ApiError>;
}
