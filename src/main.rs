use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use inventory_sync::bulk_sync::{
    BulkSyncEngine, CatalogResolver, IdentityResolver, StaticResolver, SyncOutcome,
};
use inventory_sync::catalog_api::HttpCatalogClient;
use inventory_sync::circuit_breaker::CircuitBreaker;
use inventory_sync::clock::{Clock, SystemClock};
use inventory_sync::config::{AppConfig, CliConfig, FileConfig};
use inventory_sync::gate::OutboundGate;
use inventory_sync::inventory::SqliteInventoryStore;
use inventory_sync::ledger::{OperationKind, SqliteSyncLedger, SyncLedger};
use inventory_sync::metrics;
use inventory_sync::product_push::ProductPusher;
use inventory_sync::rate_limit::{AccountRateLimiter, AdaptiveLimitController, TokenBucket};
use inventory_sync::shared_state::{SharedStateStore, SqliteSharedStateStore};
use inventory_sync::webhook::{WebhookOutcome, WebhookReconciler};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(name = "inventory-sync", version)]
struct CliArgs {
    /// Directory holding inventory.db and shared_state.db.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// TOML config file. Its values override the command line.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Base URL of the external catalog API.
    #[clap(long)]
    pub api_base_url: Option<String>,

    /// JSON object mapping blueprint ids to local catalog item ids.
    /// Without it, blueprint ids are used as catalog item ids.
    #[clap(long, value_parser = parse_path)]
    pub blueprint_map: Option<PathBuf>,

    /// Print the Prometheus metrics text after the command.
    #[clap(long)]
    pub print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SyncKind {
    Bulk,
    Resync,
}

impl From<SyncKind> for OperationKind {
    fn from(kind: SyncKind) -> Self {
        match kind {
            SyncKind::Bulk => OperationKind::BulkImport,
            SyncKind::Resync => OperationKind::PeriodicResync,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Imports a JSON export file for an account.
    Import {
        #[clap(long)]
        account: String,
        #[clap(long, value_parser = parse_path)]
        file: PathBuf,
        /// Idempotency key. Re-running with the same id is a no-op.
        #[clap(long)]
        operation_id: Option<String>,
    },

    /// Fetches the account's export from the catalog API and imports it.
    Sync {
        #[clap(long)]
        account: String,
        #[clap(long, value_enum, default_value = "bulk")]
        kind: SyncKind,
        #[clap(long)]
        operation_id: Option<String>,
    },

    /// Applies one webhook delivery read from a file.
    Webhook {
        #[clap(long, value_parser = parse_path)]
        file: PathBuf,
        /// Account the webhook belongs to; defaults to data.seller.id.
        #[clap(long)]
        account: Option<String>,
        /// Value of the Signature header.
        #[clap(long)]
        signature: Option<String>,
    },

    /// Shows the progress of an operation, or the latest one of an account.
    Progress {
        #[clap(long, conflicts_with = "account", required_unless_present = "account")]
        operation_id: Option<String>,
        #[clap(long)]
        account: Option<String>,
    },

    /// Pushes a local listing edit to the catalog: all fields by default,
    /// a quantity change with --delta, or a removal with --delete.
    Push {
        #[clap(long)]
        account: String,
        #[clap(long)]
        listing: String,
        /// Moves the local quantity by this amount before pushing it.
        #[clap(long, allow_hyphen_values = true, conflicts_with = "delete")]
        delta: Option<i64>,
        #[clap(long)]
        delete: bool,
    },

    /// Shows the status of an asynchronous catalog job.
    Job {
        #[clap(long)]
        account: String,
        #[clap(long)]
        job_id: String,
    },

    /// Shows an account's shared rate limit: bucket and adaptive multiplier.
    Limits {
        #[clap(long)]
        account: String,
    },

    /// Shows, or resets, the shared circuit breaker state.
    Breaker {
        #[clap(long)]
        reset: bool,
    },
}

struct Engine {
    config: AppConfig,
    store: SqliteInventoryStore,
    ledger: Arc<SqliteSyncLedger>,
    shared_state: Arc<dyn SharedStateStore>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    fn open(config: AppConfig) -> Result<Self> {
        info!("Opening inventory database at {:?}...", config.inventory_db_path());
        let store = SqliteInventoryStore::open(config.inventory_db_path())?;
        let ledger = Arc::new(SqliteSyncLedger::open(config.inventory_db_path())?);
        info!("Opening shared state at {:?}...", config.shared_state_db_path());
        let shared_state: Arc<dyn SharedStateStore> =
            Arc::new(SqliteSharedStateStore::open(config.shared_state_db_path())?);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        match shared_state.purge_expired(clock.now_ms()) {
            Ok(0) => {}
            Ok(purged) => info!("Purged {} expired shared state records", purged),
            Err(err) => warn!("Failed to purge expired shared state: {:#}", err),
        }
        Ok(Self {
            config,
            store,
            ledger,
            shared_state,
            clock,
        })
    }

    fn breaker(&self) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            &self.config.breaker_dependency,
            self.shared_state.clone(),
            self.clock.clone(),
            self.config.sync.breaker(),
        ))
    }

    fn limiter(&self) -> AccountRateLimiter {
        let sync = &self.config.sync;
        AccountRateLimiter::new(
            TokenBucket::new(
                self.shared_state.clone(),
                self.clock.clone(),
                sync.refill_window(),
            ),
            AdaptiveLimitController::new(
                self.shared_state.clone(),
                self.clock.clone(),
                sync.adaptive(),
            ),
        )
    }

    fn gate(&self) -> Result<Arc<OutboundGate>> {
        let sync = &self.config.sync;
        let api = HttpCatalogClient::new(
            &self.config.api_base_url,
            Duration::from_secs(sync.request_timeout_secs),
            self.config.api_tokens(),
        )?;
        Ok(Arc::new(OutboundGate::new(
            Arc::new(api),
            Arc::new(self.limiter()),
            self.breaker(),
            sync.gate(),
        )))
    }

    fn resolver(&self) -> Result<Arc<dyn CatalogResolver>> {
        Ok(match &self.config.blueprint_map {
            Some(path) => Arc::new(StaticResolver::load(path)?),
            None => Arc::new(IdentityResolver),
        })
    }

    fn bulk_sync(&self) -> Result<BulkSyncEngine> {
        let engine = BulkSyncEngine::new(
            self.store.clone(),
            self.ledger.clone(),
            self.resolver()?,
            self.config.sync.bulk_sync(),
        );
        let token = engine.shutdown_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, no new chunks will start");
                token.cancel();
            }
        });
        Ok(engine)
    }

    fn pusher(&self) -> Result<ProductPusher> {
        Ok(ProductPusher::new(self.store.clone(), self.gate()?))
    }

    fn webhooks(&self) -> WebhookReconciler {
        WebhookReconciler::new(
            self.store.clone(),
            self.ledger.clone(),
            self.config.webhook_secrets(),
            self.config.sync.webhook_signature_policy,
        )
        .with_retry(self.config.sync.chunk_retry())
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_sync_outcome(outcome: &SyncOutcome) -> Result<()> {
    match outcome {
        SyncOutcome::Finished(_) => {}
        SyncOutcome::Replayed(op) => info!(
            "Operation {} already {}, nothing done",
            op.operation_id,
            op.status.as_str()
        ),
        SyncOutcome::AlreadyRunning(op) => {
            info!("Operation {} is still running elsewhere", op.operation_id)
        }
    }
    print_json(&outcome.operation().progress())
}

fn new_operation_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

async fn run(command: Command, engine: &Engine) -> Result<()> {
    match command {
        Command::Import {
            account,
            file,
            operation_id,
        } => {
            let export = std::fs::read(&file)
                .with_context(|| format!("Failed to read export file: {:?}", file))?;
            let operation_id = operation_id.unwrap_or_else(|| new_operation_id("import"));
            let outcome = engine
                .bulk_sync()?
                .import_export(&account, &operation_id, OperationKind::BulkImport, &export)
                .await?;
            print_sync_outcome(&outcome)
        }
        Command::Sync {
            account,
            kind,
            operation_id,
        } => {
            let operation_id = operation_id.unwrap_or_else(|| new_operation_id("sync"));
            let outcome = engine
                .bulk_sync()?
                .with_gate(engine.gate()?)
                .sync_account(&account, &operation_id, kind.into())
                .await?;
            print_sync_outcome(&outcome)
        }
        Command::Webhook {
            file,
            account,
            signature,
        } => {
            let body = std::fs::read(&file)
                .with_context(|| format!("Failed to read webhook file: {:?}", file))?;
            let outcome = engine
                .webhooks()
                .apply(&body, signature.as_deref(), account.as_deref())
                .await?;
            if let WebhookOutcome::Ignored { reason, .. } = &outcome {
                info!("Webhook ignored: {}", reason);
            }
            print_json(&outcome.operation().progress())
        }
        Command::Progress {
            operation_id,
            account,
        } => {
            let op = match (operation_id, account) {
                (Some(id), _) => engine.ledger.get(&id)?,
                (None, Some(account)) => engine.ledger.latest_for_account(&account)?,
                (None, None) => bail!("Either --operation-id or --account is required"),
            };
            match op {
                Some(op) => print_json(&op),
                None => bail!("No such operation"),
            }
        }
        Command::Push {
            account,
            listing,
            delta,
            delete,
        } => {
            let pusher = engine.pusher()?;
            let outcome = match (delta, delete) {
                (_, true) => pusher.push_delete(&account, &listing).await?,
                (Some(delta), false) => pusher.adjust_quantity(&account, &listing, delta).await?,
                (None, false) => pusher.push_update(&account, &listing).await?,
            };
            print_json(&outcome)
        }
        Command::Job { account, job_id } => {
            print_json(&engine.pusher()?.job_status(&account, &job_id).await?)
        }
        Command::Limits { account } => print_json(&engine.limiter().status(&account)?),
        Command::Breaker { reset } => {
            let breaker = engine.breaker();
            if reset {
                breaker.reset()?;
            }
            print_json(&breaker.snapshot()?)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to install log subscriber")?;

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let cli_config = CliConfig {
        db_dir: cli_args.db_dir.clone(),
        api_base_url: cli_args.api_base_url.clone(),
        blueprint_map: cli_args.blueprint_map.clone(),
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    metrics::init_metrics();
    let engine = Engine::open(config)?;
    let result = run(cli_args.command, &engine).await;

    if cli_args.print_metrics {
        print!("{}", metrics::render()?);
    }
    result
}
