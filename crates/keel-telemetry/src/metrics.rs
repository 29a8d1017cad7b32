//! Prometheus metrics for the control plane.
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally: a registration failure
//! means duplicate metric names, a fatal configuration error that should
//! crash at startup rather than fail silently. These panics only occur
//! during static initialization, never at runtime.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    register_int_gauge_vec, CounterVec, Gauge, GaugeVec, HistogramVec, IntGaugeVec,
};

/// Events enqueued by the ingestor, by kind.
pub static EVENTS_ENQUEUED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "keel_events_enqueued_total",
        "Confirmed events enqueued for dispatch",
        &["kind"]
    )
    .unwrap()
});

/// Events dropped by the dedup layer.
pub static EVENTS_DEDUPED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "keel_events_deduped_total",
        "Events dropped as already seen",
        &["kind"]
    )
    .unwrap()
});

/// Blocks behind chain head per contract.
pub static INGEST_LAG_BLOCKS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "keel_ingest_lag_blocks",
        "Blocks between chain head and the confirmed checkpoint",
        &["contract"]
    )
    .unwrap()
});

/// Task queue depth per priority.
pub static QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "keel_task_queue_depth",
        "Queued tasks per priority level",
        &["priority"]
    )
    .unwrap()
});

/// Task execution latency.
pub static TASK_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "keel_task_seconds",
        "Task execution time in seconds",
        &["task"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]
    )
    .unwrap()
});

/// Ticket resolutions by terminal status.
pub static TICKETS_RESOLVED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "keel_tickets_resolved_total",
        "Approval tickets reaching a terminal status",
        &["status"]
    )
    .unwrap()
});

/// Rebalance plans by terminal status.
pub static PLANS_FINISHED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "keel_rebalance_plans_total",
        "Rebalance plans reaching a terminal status",
        &["status"]
    )
    .unwrap()
});

/// Current risk level (1=NORMAL .. 4=CRITICAL).
pub static RISK_LEVEL: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("keel_risk_level", "Current risk level, 1..4").unwrap()
});

/// Current composite risk score.
pub static RISK_SCORE: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("keel_risk_score", "Composite risk score, 0..100").unwrap()
});

/// Render all registered metrics in the Prometheus text format.
#[must_use]
pub fn gather() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder
        .encode(&prometheus::default_registry().gather(), &mut buffer)
        .is_err()
    {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_render() {
        EVENTS_ENQUEUED.with_label_values(&["NavUpdated"]).inc();
        RISK_LEVEL.set(2.0);
        let rendered = gather();
        assert!(rendered.contains("keel_events_enqueued_total"));
        assert!(rendered.contains("keel_risk_level"));
    }
}
