use std::fmt;

/// What a shared-state record holds. Each kind owns a distinct key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Per-account fixed-window token bucket.
    TokenBucket,
    /// Per-account adaptive capacity multiplier.
    AdaptiveMultiplier,
    /// Per-dependency circuit breaker record.
    Circuit,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::TokenBucket => "rate_limit",
            ResourceKind::AdaptiveMultiplier => "rate_limit_factor",
            ResourceKind::Circuit => "circuit_breaker",
        }
    }
}

/// Stable shared-state key derived from a resource kind and the account id
/// or dependency name it belongs to.
///
/// The subject is percent-encoded, so an account id containing `:` can
/// never collide with another kind's key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey(String);

impl StateKey {
    pub fn new(kind: ResourceKind, subject: &str) -> Self {
        StateKey(format!("{}:{}", kind.as_str(), urlencoding::encode(subject)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
