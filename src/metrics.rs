use anyhow::{Context, Result};
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Once;
use std::time::Duration;

/// Metric name prefix for all inventory sync metrics
const PREFIX: &str = "inventory_sync";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Rate limiting
    pub static ref RATE_LIMIT_DENIALS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_rate_limit_denials_total"), "Token bucket acquisitions denied"),
        &["account"]
    ).expect("Failed to create rate_limit_denials_total metric");

    pub static ref THROTTLED_RESPONSES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_throttled_responses_total"), "429 responses from the external catalog"),
        &["account"]
    ).expect("Failed to create throttled_responses_total metric");

    pub static ref RATE_LIMIT_MULTIPLIER: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_rate_limit_multiplier"), "Adaptive capacity multiplier"),
        &["account"]
    ).expect("Failed to create rate_limit_multiplier metric");

    // Circuit breaker
    pub static ref BREAKER_TRANSITIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_breaker_transitions_total"), "Circuit breaker state transitions"),
        &["dependency", "from", "to"]
    ).expect("Failed to create breaker_transitions_total metric");

    pub static ref BREAKER_STATE: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_breaker_state"), "Circuit breaker state (0=closed, 1=half_open, 2=open)"),
        &["dependency"]
    ).expect("Failed to create breaker_state metric");

    pub static ref BREAKER_REJECTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_breaker_rejections_total"), "Calls refused by an open breaker"),
        &["dependency"]
    ).expect("Failed to create breaker_rejections_total metric");

    // Outbound calls
    pub static ref OUTBOUND_CALLS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_outbound_calls_total"), "Calls made through the outbound gate"),
        &["operation", "outcome"]
    ).expect("Failed to create outbound_calls_total metric");

    pub static ref OUTBOUND_CALL_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_outbound_call_duration_seconds"),
            "External catalog call duration in seconds"
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 180.0]),
        &["operation"]
    ).expect("Failed to create outbound_call_duration_seconds metric");

    // Bulk sync
    pub static ref SYNC_CHUNKS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_sync_chunks_total"), "Bulk sync chunks by outcome"),
        &["outcome"]
    ).expect("Failed to create sync_chunks_total metric");

    pub static ref SYNC_CHUNK_RETRIES_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_sync_chunk_retries_total"),
        "Chunk retries after transient storage conflicts"
    ).expect("Failed to create sync_chunk_retries_total metric");

    pub static ref SYNC_ITEMS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_sync_items_total"), "Bulk sync rows by result"),
        &["result"]
    ).expect("Failed to create sync_items_total metric");

    // Webhooks
    pub static ref WEBHOOK_EVENTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_webhook_events_total"), "Inbound webhook events by cause and outcome"),
        &["cause", "outcome"]
    ).expect("Failed to create webhook_events_total metric");

    pub static ref WEBHOOK_SIGNATURE_FAILURES_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_webhook_signature_failures_total"),
        "Webhook payloads with a missing or invalid signature"
    ).expect("Failed to create webhook_signature_failures_total metric");

    pub static ref QUANTITY_CLAMPS_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_quantity_clamps_total"),
        "Quantity decrements clamped at zero"
    ).expect("Failed to create quantity_clamps_total metric");
}

static INIT: Once = Once::new();

/// Register all metrics with the Prometheus registry. Safe to call more
/// than once.
pub fn init_metrics() {
    INIT.call_once(|| {
        let _ = REGISTRY.register(Box::new(RATE_LIMIT_DENIALS_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(THROTTLED_RESPONSES_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(RATE_LIMIT_MULTIPLIER.clone()));
        let _ = REGISTRY.register(Box::new(BREAKER_TRANSITIONS_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(BREAKER_STATE.clone()));
        let _ = REGISTRY.register(Box::new(BREAKER_REJECTIONS_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(OUTBOUND_CALLS_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(OUTBOUND_CALL_DURATION_SECONDS.clone()));
        let _ = REGISTRY.register(Box::new(SYNC_CHUNKS_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(SYNC_CHUNK_RETRIES_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(SYNC_ITEMS_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(WEBHOOK_EVENTS_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(WEBHOOK_SIGNATURE_FAILURES_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(QUANTITY_CLAMPS_TOTAL.clone()));

        tracing::debug!("Metrics registry initialized");
    });
}

pub fn record_rate_limit_denial(account: &str) {
    RATE_LIMIT_DENIALS_TOTAL.with_label_values(&[account]).inc();
}

pub fn record_throttled_response(account: &str) {
    THROTTLED_RESPONSES_TOTAL.with_label_values(&[account]).inc();
}

pub fn set_rate_limit_multiplier(account: &str, multiplier: f64) {
    RATE_LIMIT_MULTIPLIER
        .with_label_values(&[account])
        .set(multiplier);
}

pub fn record_breaker_transition(dependency: &str, from: &str, to: &str, state_value: f64) {
    BREAKER_TRANSITIONS_TOTAL
        .with_label_values(&[dependency, from, to])
        .inc();
    BREAKER_STATE.with_label_values(&[dependency]).set(state_value);
}

pub fn record_breaker_rejection(dependency: &str) {
    BREAKER_REJECTIONS_TOTAL.with_label_values(&[dependency]).inc();
}

pub fn record_outbound_call(operation: &str, outcome: &str, duration: Duration) {
    OUTBOUND_CALLS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
    OUTBOUND_CALL_DURATION_SECONDS
        .with_label_values(&[operation])
        .observe(duration.as_secs_f64());
}

pub fn record_chunk(outcome: &str) {
    SYNC_CHUNKS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_chunk_retry() {
    SYNC_CHUNK_RETRIES_TOTAL.inc();
}

pub fn record_sync_items(created: u64, updated: u64, skipped: u64) {
    SYNC_ITEMS_TOTAL
        .with_label_values(&["created"])
        .inc_by(created as f64);
    SYNC_ITEMS_TOTAL
        .with_label_values(&["updated"])
        .inc_by(updated as f64);
    SYNC_ITEMS_TOTAL
        .with_label_values(&["skipped"])
        .inc_by(skipped as f64);
}

pub fn record_webhook_event(cause: &str, outcome: &str) {
    WEBHOOK_EVENTS_TOTAL
        .with_label_values(&[cause, outcome])
        .inc();
}

pub fn record_webhook_signature_failure() {
    WEBHOOK_SIGNATURE_FAILURES_TOTAL.inc();
}

pub fn record_quantity_clamp() {
    QUANTITY_CLAMPS_TOTAL.inc();
}

/// Current metric values in the Prometheus text format.
pub fn render() -> Result<String> {
    init_metrics();
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    encoder
        .encode(&metric_families, &mut buffer)
        .context("Failed to encode metrics")?;
    String::from_utf8(buffer).context("Metrics output is not UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init_metrics();
        init_metrics();

        record_chunk("completed");
        let metric_families = REGISTRY.gather();
        assert!(!metric_families.is_empty(), "Metrics should be registered");
    }

    #[test]
    fn test_record_breaker_transition() {
        init_metrics();
        record_breaker_transition("test-dependency", "closed", "open", 2.0);

        let metrics = REGISTRY.gather();
        let transitions = metrics
            .iter()
            .find(|m| m.get_name() == "inventory_sync_breaker_transitions_total");
        assert!(transitions.is_some(), "Breaker transition metrics should exist");
    }

    #[test]
    fn test_render_contains_recorded_series() {
        record_webhook_event("order.create", "applied");
        record_sync_items(3, 2, 1);

        let text = render().unwrap();
        assert!(text.contains("inventory_sync_webhook_events_total"));
        assert!(text.contains("inventory_sync_sync_items_total"));
    }
}
