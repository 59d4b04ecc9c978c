/// Metrics Module - Prometheus Instrumentation
///
/// Registers the counters/gauges/histograms implied by the Status/
/// Telemetry component: predicates by status, blocks processed per
/// chain, matches dispatched (apply/rollback), dispatch latency,
/// dispatch failures, pool reorg depth, scan lag.

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use lazy_static::lazy_static;
use std::time::Instant;

/// Standard latency buckets (seconds).
const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ------------------------------------------------------------------
    // Predicate lifecycle
    // ------------------------------------------------------------------

    /// Predicates currently in each PredicateStatus variant.
    /// Labels: status (new, scanning, streaming, unconfirmed_expiration,
    /// confirmed_expiration, interrupted)
    pub static ref PREDICATES_BY_STATUS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("chainhook_predicates_by_status", "Predicates currently in each lifecycle status"),
        &["status"]
    ).unwrap();

    /// Times a predicate has matched a transaction (apply side).
    pub static ref PREDICATE_TRIGGERS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chainhook_predicate_triggers_total", "Total matched transactions dispatched, by predicate"),
        &["predicate_uuid"]
    ).unwrap();

    // ------------------------------------------------------------------
    // Block pool / ingest
    // ------------------------------------------------------------------

    /// Blocks processed by the pool per chain.
    pub static ref BLOCKS_PROCESSED: IntCounterVec = IntCounterVec::new(
        Opts::new("chainhook_blocks_processed_total", "Total blocks processed by the pool"),
        &["chain"]
    ).unwrap();

    /// Current canonical tip height per chain.
    pub static ref CHAIN_TIP_HEIGHT: IntGaugeVec = IntGaugeVec::new(
        Opts::new("chainhook_chain_tip_height", "Canonical tip height by chain"),
        &["chain"]
    ).unwrap();

    /// Reorg events observed by the pool.
    pub static ref REORG_EVENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("chainhook_reorg_events_total", "Total reorganization events by chain"),
        &["chain"]
    ).unwrap();

    /// Depth of the most recent reorg.
    pub static ref POOL_REORG_DEPTH: HistogramVec = HistogramVec::new(
        HistogramOpts::new("chainhook_pool_reorg_depth_blocks", "Depth of reorgs handled by the pool")
            .buckets(vec![1.0, 2.0, 3.0, 5.0, 7.0, 10.0, 20.0]),
        &["chain"]
    ).unwrap();

    /// Pool invariant violations (e.g. rollback exceeds window).
    pub static ref POOL_INVARIANT_VIOLATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("chainhook_pool_invariant_violations_total", "Pool invariant violations by chain"),
        &["chain"]
    ).unwrap();

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Matches dispatched, split apply/rollback.
    pub static ref MATCHES_DISPATCHED: IntCounterVec = IntCounterVec::new(
        Opts::new("chainhook_matches_dispatched_total", "Matched transactions dispatched"),
        &["direction"]
    ).unwrap();

    /// Dispatch latency (sink round-trip).
    pub static ref DISPATCH_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("chainhook_dispatch_latency_seconds", "Dispatch sink latency")
            .buckets(LATENCY_BUCKETS.to_vec()),
        &["sink"]
    ).unwrap();

    /// Dispatch failures by sink and reason.
    pub static ref DISPATCH_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("chainhook_dispatch_failures_total", "Dispatch failures by sink and reason"),
        &["sink", "reason"]
    ).unwrap();

    /// Per-predicate dispatch queue depth (gauge, sampled on enqueue/dequeue).
    pub static ref DISPATCH_QUEUE_DEPTH: IntGaugeVec = IntGaugeVec::new(
        Opts::new("chainhook_dispatch_queue_depth", "Current per-predicate dispatch queue depth"),
        &["predicate_uuid"]
    ).unwrap();

    // ------------------------------------------------------------------
    // Scan coordinator
    // ------------------------------------------------------------------

    /// Blocks behind tip for a scanning predicate (scan lag).
    pub static ref SCAN_LAG_BLOCKS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("chainhook_scan_lag_blocks", "Blocks remaining for a predicate's historical scan"),
        &["predicate_uuid"]
    ).unwrap();

    pub static ref SCAN_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("chainhook_scan_failures_total", "Scan coordinator failures by chain"),
        &["chain"]
    ).unwrap();

    // ------------------------------------------------------------------
    // HTTP / process
    // ------------------------------------------------------------------

    pub static ref HTTP_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("chainhook_http_requests_total", "Total HTTP requests to the management surface"),
        &["endpoint", "method", "status"]
    ).unwrap();

    pub static ref WEBSOCKET_CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "chainhook_websocket_connections_active",
        "Number of active status-stream websocket connections"
    ).unwrap();

    pub static ref SERVICE_START_TIMESTAMP: IntGauge = IntGauge::new(
        "chainhook_service_start_timestamp_seconds",
        "Unix timestamp when the service started"
    ).unwrap();

    pub static ref UPTIME_SECONDS: IntGauge = IntGauge::new(
        "chainhook_uptime_seconds",
        "Service uptime in seconds"
    ).unwrap();

    pub static ref ADAPTER_CONNECTED: IntGaugeVec = IntGaugeVec::new(
        Opts::new("chainhook_adapter_connected", "Block source adapter connection status (0/1)"),
        &["chain"]
    ).unwrap();
}

/// Registers a collector, tolerating "already registered" so repeated
/// calls to `init_metrics` (tests, hot-reload) are harmless.
fn register_ignoring_duplicates<C: prometheus::core::Collector + 'static>(c: C) {
    if let Err(e) = REGISTRY.register(Box::new(c)) {
        if !matches!(e, prometheus::Error::AlreadyReg) {
            panic!("metrics registration failed: {}", e);
        }
    }
}

/// Registers every metric with the global registry. Call once at startup;
/// safe to call again (e.g. from multiple test functions in one process).
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    register_ignoring_duplicates(PREDICATES_BY_STATUS.clone());
    register_ignoring_duplicates(PREDICATE_TRIGGERS_TOTAL.clone());

    register_ignoring_duplicates(BLOCKS_PROCESSED.clone());
    register_ignoring_duplicates(CHAIN_TIP_HEIGHT.clone());
    register_ignoring_duplicates(REORG_EVENTS.clone());
    register_ignoring_duplicates(POOL_REORG_DEPTH.clone());
    register_ignoring_duplicates(POOL_INVARIANT_VIOLATIONS.clone());

    register_ignoring_duplicates(MATCHES_DISPATCHED.clone());
    register_ignoring_duplicates(DISPATCH_LATENCY.clone());
    register_ignoring_duplicates(DISPATCH_FAILURES.clone());
    register_ignoring_duplicates(DISPATCH_QUEUE_DEPTH.clone());

    register_ignoring_duplicates(SCAN_LAG_BLOCKS.clone());
    register_ignoring_duplicates(SCAN_FAILURES.clone());

    register_ignoring_duplicates(HTTP_REQUESTS.clone());
    register_ignoring_duplicates(WEBSOCKET_CONNECTIONS_ACTIVE.clone());
    register_ignoring_duplicates(SERVICE_START_TIMESTAMP.clone());
    register_ignoring_duplicates(UPTIME_SECONDS.clone());
    register_ignoring_duplicates(ADAPTER_CONNECTED.clone());

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_secs();
    SERVICE_START_TIMESTAMP.set(now as i64);

    Ok(())
}

/// Gather metrics in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Timer for measuring durations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

pub fn set_predicate_status_count(status: &str, count: i64) {
    PREDICATES_BY_STATUS.with_label_values(&[status]).set(count);
}

pub fn increment_predicate_triggers(predicate_uuid: &str, count: u64) {
    PREDICATE_TRIGGERS_TOTAL.with_label_values(&[predicate_uuid]).inc_by(count);
}

pub fn increment_blocks_processed(chain: &str) {
    BLOCKS_PROCESSED.with_label_values(&[chain]).inc();
}

pub fn set_chain_tip_height(chain: &str, height: i64) {
    CHAIN_TIP_HEIGHT.with_label_values(&[chain]).set(height);
}

pub fn increment_reorg_events(chain: &str) {
    REORG_EVENTS.with_label_values(&[chain]).inc();
}

pub fn record_reorg_depth(chain: &str, depth: u64) {
    POOL_REORG_DEPTH.with_label_values(&[chain]).observe(depth as f64);
}

pub fn increment_pool_invariant_violations(chain: &str) {
    POOL_INVARIANT_VIOLATIONS.with_label_values(&[chain]).inc();
}

pub fn increment_matches_dispatched(direction: &str, count: u64) {
    MATCHES_DISPATCHED.with_label_values(&[direction]).inc_by(count);
}

pub fn record_dispatch_latency(sink: &str, duration_secs: f64) {
    DISPATCH_LATENCY.with_label_values(&[sink]).observe(duration_secs);
}

pub fn increment_dispatch_failures(sink: &str, reason: &str) {
    DISPATCH_FAILURES.with_label_values(&[sink, reason]).inc();
}

pub fn set_dispatch_queue_depth(predicate_uuid: &str, depth: i64) {
    DISPATCH_QUEUE_DEPTH.with_label_values(&[predicate_uuid]).set(depth);
}

pub fn set_scan_lag_blocks(predicate_uuid: &str, blocks_remaining: i64) {
    SCAN_LAG_BLOCKS.with_label_values(&[predicate_uuid]).set(blocks_remaining);
}

pub fn increment_scan_failures(chain: &str) {
    SCAN_FAILURES.with_label_values(&[chain]).inc();
}

pub fn set_adapter_connected(chain: &str, connected: bool) {
    ADAPTER_CONNECTED.with_label_values(&[chain]).set(if connected { 1 } else { 0 });
}

pub fn update_uptime() {
    let start = SERVICE_START_TIMESTAMP.get();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    UPTIME_SECONDS.set((now - start as u64) as i64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        init_metrics().unwrap();
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().unwrap();
        increment_blocks_processed("bitcoin");
        set_chain_tip_height("bitcoin", 10200);

        let output = gather_metrics();
        assert!(output.contains("chainhook_blocks_processed_total"));
        assert!(output.contains("chainhook_chain_tip_height"));
    }

    #[test]
    fn test_timer() {
        let timer = Timer::new();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(timer.elapsed_secs() >= 0.01);
    }
}
