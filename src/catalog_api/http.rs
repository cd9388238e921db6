//! HTTP client for the external catalog's REST API.

use super::{ApiError, CatalogApi, CatalogOperation, OutboundCall, ALREADY_DELETED};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Fallback when a 429 carries no usable `Retry-After` header.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(10);

pub struct HttpCatalogClient {
    client: reqwest::Client,
    base_url: String,
    /// Bearer token per account id.
    tokens: HashMap<String, String>,
}

impl HttpCatalogClient {
    /// Create a new catalog client.
    ///
    /// # Arguments
    /// * `base_url` - Base URL of the catalog API (e.g., "https://api.example.com/api/v2")
    /// * `timeout` - Per-request ceiling; bulk exports can take minutes
    /// * `tokens` - API token per account id
    pub fn new(base_url: &str, timeout: Duration, tokens: HashMap<String, String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    fn route(&self, operation: &CatalogOperation) -> (Method, String) {
        let path = match operation {
            CatalogOperation::ExportProducts => "/products/export".to_string(),
            CatalogOperation::BulkUpdateProducts => "/products/bulk_update".to_string(),
            CatalogOperation::DeleteProduct { product_id } => {
                format!("/products/{}", urlencoding::encode(product_id))
            }
            CatalogOperation::Info => "/info".to_string(),
            CatalogOperation::JobStatus { job_id } => {
                format!("/jobs/{}", urlencoding::encode(job_id))
            }
        };
        let method = match operation {
            CatalogOperation::BulkUpdateProducts => Method::POST,
            CatalogOperation::DeleteProduct { .. } => Method::DELETE,
            _ => Method::GET,
        };
        (method, format!("{}{}", self.base_url, path))
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Duration {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

/// Maps an HTTP status to the error taxonomy. `None` means success.
pub(crate) fn classify_status(
    status: StatusCode,
    headers: &reqwest::header::HeaderMap,
    body: &str,
) -> Option<ApiError> {
    if status.is_success() {
        return None;
    }
    let detail = format!("status {}: {}", status.as_u16(), body.chars().take(200).collect::<String>());
    Some(if status == StatusCode::TOO_MANY_REQUESTS {
        ApiError::Throttled {
            retry_after: Some(retry_after(headers)),
        }
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiError::DependencyDown(detail)
    } else {
        ApiError::Validation(detail)
    })
}

#[async_trait]
impl CatalogApi for HttpCatalogClient {
    async fn execute(&self, call: &OutboundCall) -> Result<Value, ApiError> {
        let token = self.tokens.get(&call.account_id).ok_or_else(|| {
            ApiError::Validation(format!("no API token for account {}", call.account_id))
        })?;

        let (method, url) = self.route(&call.operation);
        debug!("{} {} for account {}", method, url, call.account_id);

        let mut request = self
            .client
            .request(method.clone(), &url)
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/json");
        if method == Method::POST {
            request = request.json(&call.payload);
        } else if let Value::Object(params) = &call.payload {
            let query: Vec<(String, String)> = params
                .iter()
                .map(|(k, v)| match v {
                    Value::String(s) => (k.clone(), s.clone()),
                    other => (k.clone(), other.to_string()),
                })
                .collect();
            request = request.query(&query);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::DependencyDown(format!("request to {} timed out", url))
            } else {
                ApiError::DependencyDown(format!("request to {} failed: {}", url, e))
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::DependencyDown(format!("failed to read response: {}", e)))?;

        if status == StatusCode::NOT_FOUND
            && matches!(call.operation, CatalogOperation::DeleteProduct { .. })
        {
            debug!("{} was already gone", url);
            return Ok(json!({"status": ALREADY_DELETED}));
        }
        if let Some(err) = classify_status(status, &headers, &body) {
            return Err(err);
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| ApiError::DependencyDown(format!("malformed response body: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

    #[test]
    fn test_classify_status() {
        let empty = HeaderMap::new();
        assert_eq!(classify_status(StatusCode::OK, &empty, ""), None);
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, &empty, "down"),
            Some(ApiError::DependencyDown(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, &empty, "bad"),
            Some(ApiError::Validation(_))
        ));
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, &empty, ""),
            Some(ApiError::Throttled {
                retry_after: Some(DEFAULT_RETRY_AFTER)
            })
        );
    }

    #[test]
    fn test_retry_after_header_is_honoured() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2.5"));
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, &headers, ""),
            Some(ApiError::Throttled {
                retry_after: Some(Duration::from_millis(2500))
            })
        );
    }

    #[test]
    fn test_routes() {
        let client =
            HttpCatalogClient::new("https://catalog.test/api/", Duration::from_secs(5), HashMap::new())
                .unwrap();
        assert_eq!(
            client.route(&CatalogOperation::ExportProducts),
            (Method::GET, "https://catalog.test/api/products/export".to_string())
        );
        assert_eq!(
            client.route(&CatalogOperation::BulkUpdateProducts),
            (Method::POST, "https://catalog.test/api/products/bulk_update".to_string())
        );
        assert_eq!(
            client.route(&CatalogOperation::DeleteProduct {
                product_id: "981".into()
            }),
            (Method::DELETE, "https://catalog.test/api/products/981".to_string())
        );
        assert_eq!(
            client.route(&CatalogOperation::JobStatus {
                job_id: "a/b".into()
            }),
            (Method::GET, "https://catalog.test/api/jobs/a%2Fb".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_token_is_validation_error() {
        let client =
            HttpCatalogClient::new("http://127.0.0.1:9", Duration::from_secs(1), HashMap::new())
                .unwrap();
        let err = client
            .execute(&OutboundCall::new("nobody", CatalogOperation::Info))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }
}
