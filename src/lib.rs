//! Inventory synchronization engine.
//!
//! This library exposes the engine's modules for the binary and for tests.

pub mod bulk_sync;
pub mod catalog_api;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod gate;
pub mod inventory;
pub mod ledger;
pub mod metrics;
pub mod product_push;
pub mod rate_limit;
pub mod retry;
pub mod shared_state;
pub mod sqlite_persistence;
pub mod webhook;

// Re-export commonly used types for convenience
pub use bulk_sync::{BulkSyncEngine, BulkSyncSettings, SyncOutcome};
pub use circuit_breaker::CircuitBreaker;
pub use gate::OutboundGate;
pub use inventory::SqliteInventoryStore;
pub use ledger::{SqliteSyncLedger, SyncLedger};
pub use product_push::ProductPusher;
pub use rate_limit::AccountRateLimiter;
pub use webhook::WebhookReconciler;
