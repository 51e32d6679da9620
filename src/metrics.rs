//! Prometheus metrics for the client.
//!
//! Everything is registered in a custom registry prefixed `kafkaesque_client`
//! so an application's own default registry stays untouched. Render with
//! [`encode_metrics`] and serve it however the application exposes metrics.
//!
//! Registration never panics: a metric that fails to register is still
//! returned and updated, it just does not appear in the output.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder, opts,
};
use tracing::warn;

pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("kafkaesque_client".to_string()), None)
        .unwrap_or_else(|_| Registry::new())
});

macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Connections
// =============================================================================

define_gauge!(
    ACTIVE_CONNECTIONS,
    "active_connections",
    "Open broker connections"
);
define_counter_vec!(
    CONNECTION_ATTEMPTS,
    "connection_attempts_total",
    "Broker connection attempts by outcome",
    ["status"]
);

// =============================================================================
// Requests
// =============================================================================

define_counter_vec!(
    REQUEST_COUNT,
    "requests_total",
    "Requests sent to brokers by API and outcome",
    ["api", "status"]
);
define_histogram_vec!(
    REQUEST_DURATION,
    "request_duration_seconds",
    "Round trip time of broker requests",
    ["api"],
    [0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
);

// =============================================================================
// Producer
// =============================================================================

define_counter_vec!(
    RECORDS_SENT,
    "producer_records_sent_total",
    "Records accepted by send()",
    ["topic"]
);
define_counter_vec!(
    RECORDS_ACKED,
    "producer_records_acked_total",
    "Records acknowledged by the partition leader",
    ["topic"]
);
define_counter_vec!(
    RECORDS_FAILED,
    "producer_records_failed_total",
    "Records whose delivery failed",
    ["topic"]
);
define_counter_vec!(
    BATCH_RETRIES,
    "producer_batch_retries_total",
    "Batches requeued after a retriable failure",
    ["topic"]
);
define_histogram_vec!(
    BATCH_SIZE_BYTES,
    "producer_batch_size_bytes",
    "Encoded size of sealed batches",
    ["topic"],
    [128.0, 512.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0]
);

// =============================================================================
// Consumer and group
// =============================================================================

define_counter_vec!(
    RECORDS_CONSUMED,
    "consumer_records_total",
    "Records returned from poll",
    ["topic"]
);
define_counter_vec!(
    REBALANCES,
    "group_rebalances_total",
    "Completed joins (each one a rebalance) per group",
    ["group"]
);
define_counter_vec!(
    COMMITS,
    "group_commits_total",
    "Offset commits by outcome",
    ["group", "status"]
);

/// Render every registered metric in the Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub fn record_request(api: &str, status: &str, duration_secs: f64) {
    REQUEST_COUNT.with_label_values(&[api, status]).inc();
    REQUEST_DURATION
        .with_label_values(&[api])
        .observe(duration_secs);
}

pub fn record_commit(group: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    COMMITS.with_label_values(&[group, status]).inc();
}

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    if let Err(e) = registry.register(Box::new(gauge.clone())) {
        warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
    }
    gauge
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
    }
    counter
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("histogram opts should be valid");
    if let Err(e) = registry.register(Box::new(histogram.clone())) {
        warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
    }
    histogram
}
