//! Common test infrastructure
//!
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{export_rows, TestEnv, ACCOUNT};
//!
//! #[tokio::test]
//! async fn test_import() {
//!     let env = TestEnv::new();
//!     let engine = env.bulk_sync(5000, 3);
//!     engine.import_rows(ACCOUNT, "op-1", OperationKind::BulkImport, export_rows(0..10)).await.unwrap();
//! }
//! ```

mod api;
mod constants;
mod fixtures;

// Public API - this is what tests import
#[allow(unused_imports)]
pub use api::ScriptedCatalogApi;
#[allow(unused_imports)]
pub use constants::*;
#[allow(unused_imports)]
pub use fixtures::{export_row, export_rows, gate_with, seed_items, TestEnv};
