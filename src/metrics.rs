//! Observability emission points.
//!
//! The engine emits counters, histograms, and gauges through the
//! [`MetricsSink`] trait; the backend (Prometheus, StatsD, ...) is a
//! collaborator outside this crate. Components hold an `Arc<dyn
//! MetricsSink>` injected at construction, so there is no global registry
//! to poison tests with.

use std::collections::HashMap;
use std::sync::Mutex;

/// Metric names emitted by the engine, kept in one place so operators can
/// grep for them.
pub mod names {
    /// Counter: uploads stored
    pub const INGEST_STORED: &str = "ingest.stored";
    /// Counter: uploads skipped as duplicates
    pub const INGEST_DUPLICATE: &str = "ingest.duplicate";
    /// Counter: uploads dead-lettered
    pub const INGEST_DEAD_LETTER: &str = "ingest.dead_letter";
    /// Gauge: uploads discovered but not yet finished
    pub const INGEST_BACKLOG: &str = "ingest.backlog";
    /// Histogram: per-upload processing latency (ms)
    pub const INGEST_LATENCY_MS: &str = "ingest.latency_ms";
    /// Counter: records migrated between tiers
    pub const MIGRATION_MOVED: &str = "aging.moved";
    /// Counter: per-record migration failures
    pub const MIGRATION_FAILED: &str = "aging.failed";
    /// Counter: records failing beyond the attempt cap (operator alert)
    pub const MIGRATION_ALERT: &str = "aging.alert";
    /// Histogram: migration batch latency (ms)
    pub const MIGRATION_LATENCY_MS: &str = "aging.batch_latency_ms";
    /// Histogram: fan-out query latency (ms)
    pub const QUERY_LATENCY_MS: &str = "query.latency_ms";
    /// Counter: shards degraded during fan-out
    pub const QUERY_DEGRADED_SHARDS: &str = "query.degraded_shards";
    /// Gauge prefix: per-tier record counts ("tier.records.hot" etc.)
    pub const TIER_RECORDS_PREFIX: &str = "tier.records";
    /// Gauge prefix: circuit state per dependency (0=closed, 1=half-open, 2=open)
    pub const BREAKER_STATE_PREFIX: &str = "breaker.state";
}

/// Sink for engine metrics. Implementations must be cheap and non-blocking;
/// emission points sit on hot paths.
pub trait MetricsSink: Send + Sync {
    /// Increment a monotonic counter.
    fn incr_counter(&self, name: &str, delta: u64);

    /// Record one observation into a histogram.
    fn observe(&self, name: &str, value: f64);

    /// Set a gauge to an absolute value.
    fn set_gauge(&self, name: &str, value: f64);
}

/// Discards all metrics. The default sink when none is injected.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr_counter(&self, _name: &str, _delta: u64) {}
    fn observe(&self, _name: &str, _value: f64) {}
    fn set_gauge(&self, _name: &str, _value: f64) {}
}

/// In-memory sink that records everything, for assertions in tests and for
/// embedded deployments that scrape state directly.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    counters: Mutex<HashMap<String, u64>>,
    observations: Mutex<HashMap<String, Vec<f64>>>,
    gauges: Mutex<HashMap<String, f64>>,
}

impl RecordingMetrics {
    /// Create an empty recording sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter (0 if never incremented).
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .map(|c| c.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// All observations recorded into a histogram.
    pub fn observations(&self, name: &str) -> Vec<f64> {
        self.observations
            .lock()
            .map(|o| o.get(name).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Current value of a gauge, if ever set.
    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.lock().ok().and_then(|g| g.get(name).copied())
    }
}

impl MetricsSink for RecordingMetrics {
    fn incr_counter(&self, name: &str, delta: u64) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(name.to_string()).or_insert(0) += delta;
        }
    }

    fn observe(&self, name: &str, value: f64) {
        if let Ok(mut observations) = self.observations.lock() {
            observations.entry(name.to_string()).or_default().push(value);
        }
    }

    fn set_gauge(&self, name: &str, value: f64) {
        if let Ok(mut gauges) = self.gauges.lock() {
            gauges.insert(name.to_string(), value);
        }
    }
}
