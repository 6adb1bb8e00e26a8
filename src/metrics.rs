// src/metrics.rs
//
// Dispatcher metrics emitted through the `metrics` facade. Whatever recorder
// the embedding program installs (Prometheus, statsd, none) picks these up.

use metrics::{counter, gauge, Counter, Gauge};
use once_cell::sync::Lazy;

/// Global metrics registry.
pub static METRICS: Lazy<MetricsRegistry> = Lazy::new(MetricsRegistry::new);

pub struct MetricsRegistry {
    pub requests_total: Counter,
    pub requests_succeeded_total: Counter,
    pub requests_failed_total: Counter,

    pub key_rotations_total: Counter,
    pub key_failures_total: Counter,
    pub circuit_trips_total: Counter,
    pub rate_limit_blocks_total: Counter,

    pub queue_depth: Gauge,
    pub queue_timeouts_total: Counter,
    pub queue_rejections_total: Counter,

    pub storage_errors_total: Counter,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            requests_total: counter!("keymux_requests_total"),
            requests_succeeded_total: counter!("keymux_requests_succeeded_total"),
            requests_failed_total: counter!("keymux_requests_failed_total"),

            key_rotations_total: counter!("keymux_key_rotations_total"),
            key_failures_total: counter!("keymux_key_failures_total"),
            circuit_trips_total: counter!("keymux_circuit_trips_total"),
            rate_limit_blocks_total: counter!("keymux_rate_limit_blocks_total"),

            queue_depth: gauge!("keymux_queue_depth"),
            queue_timeouts_total: counter!("keymux_queue_timeouts_total"),
            queue_rejections_total: counter!("keymux_queue_rejections_total"),

            storage_errors_total: counter!("keymux_storage_errors_total"),
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
