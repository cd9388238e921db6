use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub api_base_url: Option<String>,
    pub breaker_dependency: Option<String>,
    pub blueprint_map: Option<String>,

    // Engine tunables
    pub sync: Option<SyncEngineConfig>,

    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// `[sync]` table. Every field falls back to the engine default.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SyncEngineConfig {
    pub bucket_capacity: Option<u64>,
    pub refill_window_secs: Option<u64>,
    pub adaptive_floor: Option<f64>,
    pub adaptive_ceiling: Option<f64>,
    pub adaptive_shrink: Option<f64>,
    pub adaptive_grow: Option<f64>,
    pub adaptive_ttl_secs: Option<u64>,
    pub breaker_failure_threshold: Option<u32>,
    pub breaker_success_threshold: Option<u32>,
    pub breaker_timeout_secs: Option<u64>,
    pub breaker_half_open_max_trials: Option<u32>,
    pub request_timeout_secs: Option<u64>,
    pub gate_max_attempts: Option<u32>,
    pub gate_max_throttle_waits: Option<u32>,
    pub chunk_size: Option<usize>,
    pub chunk_concurrency: Option<usize>,
    pub chunk_max_retries: Option<u32>,
    pub chunk_initial_backoff_ms: Option<u64>,
    pub chunk_backoff_multiplier: Option<f64>,
    pub chunk_max_backoff_ms: Option<u64>,
    pub chunk_timeout_secs: Option<u64>,
    /// "log_and_accept" or "reject"
    pub webhook_signature_policy: Option<String>,
}

/// One `[[accounts]]` entry.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AccountConfig {
    pub id: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
