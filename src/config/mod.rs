mod file_config;

pub use file_config::{AccountConfig, FileConfig, SyncEngineConfig};

use crate::bulk_sync::BulkSyncSettings;
use crate::circuit_breaker::BreakerSettings;
use crate::gate::GateSettings;
use crate::rate_limit::AdaptiveSettings;
use crate::retry::RetryPolicy;
use crate::webhook::SignaturePolicy;
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "https://api.cardtrader.com/api/v2";
pub const DEFAULT_BREAKER_DEPENDENCY: &str = "catalog_api";

/// CLI arguments that can be used for config resolution.
/// TOML values override these where present.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub api_base_url: Option<String>,
    pub blueprint_map: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub api_base_url: String,
    /// Key under which the breaker state is shared by every worker.
    pub breaker_dependency: String,
    pub blueprint_map: Option<PathBuf>,
    pub accounts: Vec<AccountConfig>,
    pub sync: SyncEngineSettings,
}

/// Every engine tunable. Ranges are checked by [`SyncEngineSettings::validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct SyncEngineSettings {
    pub bucket_capacity: u64,
    pub refill_window_secs: u64,
    pub adaptive_floor: f64,
    pub adaptive_ceiling: f64,
    pub adaptive_shrink: f64,
    pub adaptive_grow: f64,
    pub adaptive_ttl_secs: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_success_threshold: u32,
    pub breaker_timeout_secs: u64,
    pub breaker_half_open_max_trials: u32,
    pub request_timeout_secs: u64,
    pub gate_max_attempts: u32,
    pub gate_max_throttle_waits: u32,
    pub chunk_size: usize,
    pub chunk_concurrency: usize,
    pub chunk_max_retries: u32,
    pub chunk_initial_backoff_ms: u64,
    pub chunk_backoff_multiplier: f64,
    pub chunk_max_backoff_ms: u64,
    pub chunk_timeout_secs: u64,
    pub webhook_signature_policy: SignaturePolicy,
}

impl Default for SyncEngineSettings {
    fn default() -> Self {
        Self {
            bucket_capacity: 200,
            refill_window_secs: 10,
            adaptive_floor: 0.5,
            adaptive_ceiling: 1.5,
            adaptive_shrink: 0.9,
            adaptive_grow: 1.01,
            adaptive_ttl_secs: 3600,
            breaker_failure_threshold: 5,
            breaker_success_threshold: 2,
            breaker_timeout_secs: 60,
            breaker_half_open_max_trials: 2,
            request_timeout_secs: 180,
            gate_max_attempts: 3,
            gate_max_throttle_waits: 3,
            chunk_size: 5000,
            chunk_concurrency: 3,
            chunk_max_retries: 3,
            chunk_initial_backoff_ms: 200,
            chunk_backoff_multiplier: 2.0,
            chunk_max_backoff_ms: 5000,
            chunk_timeout_secs: 300,
            webhook_signature_policy: SignaturePolicy::LogAndAccept,
        }
    }
}

fn check_range<T: PartialOrd + std::fmt::Display>(name: &str, value: T, min: T, max: T) -> Result<()> {
    if value < min || value > max {
        bail!("{} must be between {} and {}, got {}", name, min, max, value);
    }
    Ok(())
}

fn check_at_least<T: PartialOrd + std::fmt::Display>(name: &str, value: T, min: T) -> Result<()> {
    if value < min {
        bail!("{} must be at least {}, got {}", name, min, value);
    }
    Ok(())
}

impl SyncEngineSettings {
    /// Defaults overlaid with whatever the `[sync]` table sets.
    pub fn from_file(file: SyncEngineConfig) -> Result<Self> {
        let d = Self::default();
        let webhook_signature_policy = match file.webhook_signature_policy {
            Some(s) => SignaturePolicy::from_str(&s).ok_or_else(|| {
                anyhow::anyhow!(
                    "webhook_signature_policy must be \"log_and_accept\" or \"reject\", got {:?}",
                    s
                )
            })?,
            None => d.webhook_signature_policy,
        };
        Ok(Self {
            bucket_capacity: file.bucket_capacity.unwrap_or(d.bucket_capacity),
            refill_window_secs: file.refill_window_secs.unwrap_or(d.refill_window_secs),
            adaptive_floor: file.adaptive_floor.unwrap_or(d.adaptive_floor),
            adaptive_ceiling: file.adaptive_ceiling.unwrap_or(d.adaptive_ceiling),
            adaptive_shrink: file.adaptive_shrink.unwrap_or(d.adaptive_shrink),
            adaptive_grow: file.adaptive_grow.unwrap_or(d.adaptive_grow),
            adaptive_ttl_secs: file.adaptive_ttl_secs.unwrap_or(d.adaptive_ttl_secs),
            breaker_failure_threshold: file
                .breaker_failure_threshold
                .unwrap_or(d.breaker_failure_threshold),
            breaker_success_threshold: file
                .breaker_success_threshold
                .unwrap_or(d.breaker_success_threshold),
            breaker_timeout_secs: file.breaker_timeout_secs.unwrap_or(d.breaker_timeout_secs),
            breaker_half_open_max_trials: file
                .breaker_half_open_max_trials
                .unwrap_or(d.breaker_half_open_max_trials),
            request_timeout_secs: file.request_timeout_secs.unwrap_or(d.request_timeout_secs),
            gate_max_attempts: file.gate_max_attempts.unwrap_or(d.gate_max_attempts),
            gate_max_throttle_waits: file
                .gate_max_throttle_waits
                .unwrap_or(d.gate_max_throttle_waits),
            chunk_size: file.chunk_size.unwrap_or(d.chunk_size),
            chunk_concurrency: file.chunk_concurrency.unwrap_or(d.chunk_concurrency),
            chunk_max_retries: file.chunk_max_retries.unwrap_or(d.chunk_max_retries),
            chunk_initial_backoff_ms: file
                .chunk_initial_backoff_ms
                .unwrap_or(d.chunk_initial_backoff_ms),
            chunk_backoff_multiplier: file
                .chunk_backoff_multiplier
                .unwrap_or(d.chunk_backoff_multiplier),
            chunk_max_backoff_ms: file.chunk_max_backoff_ms.unwrap_or(d.chunk_max_backoff_ms),
            chunk_timeout_secs: file.chunk_timeout_secs.unwrap_or(d.chunk_timeout_secs),
            webhook_signature_policy,
        })
    }

    pub fn validate(&self) -> Result<()> {
        check_range("bucket_capacity", self.bucket_capacity, 1, 100_000)?;
        check_range("refill_window_secs", self.refill_window_secs, 1, 3600)?;
        if !(self.adaptive_floor > 0.0
            && self.adaptive_floor <= 1.0
            && self.adaptive_ceiling >= 1.0
            && self.adaptive_ceiling <= 10.0)
        {
            bail!(
                "adaptive bounds must satisfy 0 < floor <= 1 <= ceiling <= 10, got floor {} ceiling {}",
                self.adaptive_floor,
                self.adaptive_ceiling
            );
        }
        if !(self.adaptive_shrink > 0.0 && self.adaptive_shrink < 1.0) {
            bail!(
                "adaptive_shrink must be in (0, 1), got {}",
                self.adaptive_shrink
            );
        }
        if !(self.adaptive_grow > 1.0 && self.adaptive_grow <= 2.0) {
            bail!("adaptive_grow must be in (1, 2], got {}", self.adaptive_grow);
        }
        check_at_least("adaptive_ttl_secs", self.adaptive_ttl_secs, 1)?;
        check_at_least("breaker_failure_threshold", self.breaker_failure_threshold, 1)?;
        check_at_least("breaker_success_threshold", self.breaker_success_threshold, 1)?;
        check_at_least("breaker_timeout_secs", self.breaker_timeout_secs, 1)?;
        check_at_least(
            "breaker_half_open_max_trials",
            self.breaker_half_open_max_trials,
            1,
        )?;
        check_at_least("request_timeout_secs", self.request_timeout_secs, 1)?;
        check_range("gate_max_attempts", self.gate_max_attempts, 1, 10)?;
        check_range("gate_max_throttle_waits", self.gate_max_throttle_waits, 0, 20)?;
        check_range("chunk_size", self.chunk_size, 1, 50_000)?;
        check_range("chunk_concurrency", self.chunk_concurrency, 1, 32)?;
        check_range("chunk_max_retries", self.chunk_max_retries, 0, 10)?;
        check_at_least("chunk_backoff_multiplier", self.chunk_backoff_multiplier, 1.0)?;
        if self.chunk_max_backoff_ms < self.chunk_initial_backoff_ms {
            bail!(
                "chunk_max_backoff_ms ({}) is below chunk_initial_backoff_ms ({})",
                self.chunk_max_backoff_ms,
                self.chunk_initial_backoff_ms
            );
        }
        check_at_least("chunk_timeout_secs", self.chunk_timeout_secs, 1)?;
        Ok(())
    }

    pub fn refill_window(&self) -> Duration {
        Duration::from_secs(self.refill_window_secs)
    }

    pub fn adaptive(&self) -> AdaptiveSettings {
        AdaptiveSettings {
            base_capacity: self.bucket_capacity,
            floor: self.adaptive_floor,
            ceiling: self.adaptive_ceiling,
            shrink: self.adaptive_shrink,
            grow: self.adaptive_grow,
            ttl: Duration::from_secs(self.adaptive_ttl_secs),
        }
    }

    pub fn breaker(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.breaker_failure_threshold,
            success_threshold: self.breaker_success_threshold,
            timeout: Duration::from_secs(self.breaker_timeout_secs),
            half_open_max_trials: self.breaker_half_open_max_trials,
        }
    }

    pub fn gate(&self) -> GateSettings {
        GateSettings {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_attempts: self.gate_max_attempts,
            max_throttle_waits: self.gate_max_throttle_waits,
            backoff: RetryPolicy {
                max_retries: self.gate_max_attempts.saturating_sub(1),
                ..RetryPolicy::default()
            },
        }
    }

    pub fn chunk_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.chunk_max_retries,
            initial_backoff: Duration::from_millis(self.chunk_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.chunk_max_backoff_ms),
            backoff_multiplier: self.chunk_backoff_multiplier,
            ..RetryPolicy::default()
        }
    }

    pub fn bulk_sync(&self) -> BulkSyncSettings {
        BulkSyncSettings {
            chunk_size: self.chunk_size,
            concurrency: self.chunk_concurrency,
            retry: self.chunk_retry(),
            chunk_timeout: Duration::from_secs(self.chunk_timeout_secs),
        }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;
        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let api_base_url = file
            .api_base_url
            .or_else(|| cli.api_base_url.clone())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
        let breaker_dependency = file
            .breaker_dependency
            .unwrap_or_else(|| DEFAULT_BREAKER_DEPENDENCY.to_string());
        let blueprint_map = file
            .blueprint_map
            .map(PathBuf::from)
            .or_else(|| cli.blueprint_map.clone());

        let mut seen = std::collections::HashSet::new();
        for account in &file.accounts {
            if account.id.trim().is_empty() {
                bail!("[[accounts]] entry with an empty id");
            }
            if !seen.insert(account.id.as_str()) {
                bail!("Account {:?} is configured twice", account.id);
            }
        }

        let sync = SyncEngineSettings::from_file(file.sync.unwrap_or_default())?;
        sync.validate()?;

        Ok(Self {
            db_dir,
            api_base_url,
            breaker_dependency,
            blueprint_map,
            accounts: file.accounts,
            sync,
        })
    }

    pub fn inventory_db_path(&self) -> PathBuf {
        self.db_dir.join("inventory.db")
    }

    pub fn shared_state_db_path(&self) -> PathBuf {
        self.db_dir.join("shared_state.db")
    }

    pub fn api_tokens(&self) -> HashMap<String, String> {
        self.accounts
            .iter()
            .filter_map(|a| a.api_token.clone().map(|t| (a.id.clone(), t)))
            .collect()
    }

    pub fn webhook_secrets(&self) -> HashMap<String, String> {
        self.accounts
            .iter()
            .filter_map(|a| a.webhook_secret.clone().map(|s| (a.id.clone(), s)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cli_with_dir(dir: &TempDir) -> CliConfig {
        CliConfig {
            db_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = SyncEngineSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.bulk_sync().chunk_size, 5000);
        assert_eq!(settings.bulk_sync().concurrency, 3);
        assert_eq!(settings.chunk_retry().max_retries, 3);
        assert_eq!(settings.breaker().failure_threshold, 5);
        assert_eq!(settings.gate().backoff.max_retries, 2);
        assert_eq!(settings.adaptive().base_capacity, 200);
    }

    #[test]
    fn test_resolve_cli_only() {
        let dir = TempDir::new().unwrap();
        let cli = CliConfig {
            db_dir: Some(dir.path().to_path_buf()),
            api_base_url: Some("http://localhost:9000".to_string()),
            blueprint_map: Some(PathBuf::from("/maps/blueprints.json")),
        };

        let config = AppConfig::resolve(&cli, None).unwrap();
        assert_eq!(config.db_dir, dir.path());
        assert_eq!(config.api_base_url, "http://localhost:9000");
        assert_eq!(config.breaker_dependency, DEFAULT_BREAKER_DEPENDENCY);
        assert_eq!(config.sync, SyncEngineSettings::default());
        assert_eq!(config.inventory_db_path(), dir.path().join("inventory.db"));
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let dir = TempDir::new().unwrap();
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/should/be/overridden")),
            api_base_url: Some("http://cli".to_string()),
            ..Default::default()
        };
        let file = FileConfig {
            db_dir: Some(dir.path().to_string_lossy().to_string()),
            api_base_url: Some("http://toml".to_string()),
            sync: Some(SyncEngineConfig {
                chunk_size: Some(1000),
                webhook_signature_policy: Some("reject".to_string()),
                ..Default::default()
            }),
            accounts: vec![AccountConfig {
                id: "42".to_string(),
                api_token: Some("tok".to_string()),
                webhook_secret: None,
            }],
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, Some(file)).unwrap();
        assert_eq!(config.db_dir, dir.path());
        assert_eq!(config.api_base_url, "http://toml");
        assert_eq!(config.sync.chunk_size, 1000);
        assert_eq!(config.sync.chunk_concurrency, 3);
        assert_eq!(config.sync.webhook_signature_policy, SignaturePolicy::Reject);
        assert_eq!(config.api_tokens().get("42").map(String::as_str), Some("tok"));
        assert!(config.webhook_secrets().is_empty());
    }

    #[test]
    fn test_resolve_missing_db_dir_error() {
        let result = AppConfig::resolve(&CliConfig::default(), None);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("db_dir must be specified"));
    }

    #[test]
    fn test_resolve_nonexistent_db_dir_error() {
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/nonexistent/path/that/should/not/exist")),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_out_of_range_settings_are_rejected() {
        let dir = TempDir::new().unwrap();
        let cases = [
            SyncEngineConfig {
                chunk_size: Some(0),
                ..Default::default()
            },
            SyncEngineConfig {
                chunk_concurrency: Some(64),
                ..Default::default()
            },
            SyncEngineConfig {
                adaptive_floor: Some(1.2),
                ..Default::default()
            },
            SyncEngineConfig {
                adaptive_shrink: Some(1.0),
                ..Default::default()
            },
            SyncEngineConfig {
                adaptive_grow: Some(0.99),
                ..Default::default()
            },
            SyncEngineConfig {
                gate_max_attempts: Some(0),
                ..Default::default()
            },
            SyncEngineConfig {
                webhook_signature_policy: Some("maybe".to_string()),
                ..Default::default()
            },
        ];
        for sync in cases {
            let file = FileConfig {
                sync: Some(sync.clone()),
                ..Default::default()
            };
            assert!(
                AppConfig::resolve(&cli_with_dir(&dir), Some(file)).is_err(),
                "accepted {:?}",
                sync
            );
        }
    }

    #[test]
    fn test_duplicate_accounts_are_rejected() {
        let dir = TempDir::new().unwrap();
        let account = AccountConfig {
            id: "42".to_string(),
            api_token: None,
            webhook_secret: None,
        };
        let file = FileConfig {
            accounts: vec![account.clone(), account],
            ..Default::default()
        };
        let err = AppConfig::resolve(&cli_with_dir(&dir), Some(file)).unwrap_err();
        assert!(err.to_string().contains("configured twice"));
    }
}
