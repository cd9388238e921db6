//! Shared constants for end-to-end tests

/// Seller account used by most tests.
pub const ACCOUNT: &str = "42";

/// A second account, for isolation checks.
pub const OTHER_ACCOUNT: &str = "77";

/// Webhook secret configured for [`ACCOUNT`].
pub const WEBHOOK_SECRET: &str = "whsec-test";

/// Blueprints cycle through this many ids in generated exports.
pub const BLUEPRINT_SPREAD: i64 = 100;

/// Breaker dependency name used by gate tests.
pub const DEPENDENCY: &str = "catalog_api";
