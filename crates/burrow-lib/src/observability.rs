//! Observability infrastructure
//!
//! Provides:
//! - Prometheus metrics (tunnel counts, per-tunnel throughput, scaling
//!   actions, collection errors, driver latency)
//! - Structured JSON logging with tracing for domain events

use prometheus::{
    register_gauge, register_gauge_vec, register_histogram, register_int_counter_vec,
    register_int_gauge, Gauge, GaugeVec, Histogram, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for driver invocation latency (seconds)
const DRIVER_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<TunnelMetricsInner> = OnceLock::new();

/// Inner structure holding the actual Prometheus metrics
struct TunnelMetricsInner {
    tunnels_active: IntGauge,
    instances_active: IntGauge,
    tunnel_throughput_bps: GaugeVec,
    aggregate_utilization: Gauge,
    scale_actions_total: IntCounterVec,
    collection_errors_total: IntCounterVec,
    driver_latency_seconds: Histogram,
}

impl TunnelMetricsInner {
    fn new() -> Self {
        Self {
            tunnels_active: register_int_gauge!(
                "burrow_tunnels_active",
                "Number of tunnels currently active"
            )
            .expect("failed to register burrow_tunnels_active"),

            instances_active: register_int_gauge!(
                "burrow_instances_active",
                "Number of bastion instances in the cluster"
            )
            .expect("failed to register burrow_instances_active"),

            tunnel_throughput_bps: register_gauge_vec!(
                "burrow_tunnel_throughput_bps",
                "Smoothed per-tunnel throughput in bits per second",
                &["tunnel"]
            )
            .expect("failed to register burrow_tunnel_throughput_bps"),

            aggregate_utilization: register_gauge!(
                "burrow_aggregate_utilization",
                "Aggregate throughput over aggregate tunnel capacity"
            )
            .expect("failed to register burrow_aggregate_utilization"),

            scale_actions_total: register_int_counter_vec!(
                "burrow_scale_actions_total",
                "Scaling actions taken, labeled by direction",
                &["direction"]
            )
            .expect("failed to register burrow_scale_actions_total"),

            collection_errors_total: register_int_counter_vec!(
                "burrow_collection_errors_total",
                "Metric collection errors, labeled by kind",
                &["kind"]
            )
            .expect("failed to register burrow_collection_errors_total"),

            driver_latency_seconds: register_histogram!(
                "burrow_driver_latency_seconds",
                "Time spent inside tunnel driver invocations",
                DRIVER_LATENCY_BUCKETS.to_vec()
            )
            .expect("failed to register burrow_driver_latency_seconds"),
        }
    }
}

/// Handle to the global metrics instance. Clones share the underlying
/// registry.
#[derive(Clone)]
pub struct TunnelMetricsExporter {
    _private: (),
}

impl Default for TunnelMetricsExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelMetricsExporter {
    /// Create a metrics handle (initializes the global registry on first
    /// call)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(TunnelMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &TunnelMetricsInner {
        GLOBAL_METRICS.get().expect("metrics not initialized")
    }

    pub fn set_tunnels_active(&self, count: i64) {
        self.inner().tunnels_active.set(count);
    }

    pub fn set_instances_active(&self, count: i64) {
        self.inner().instances_active.set(count);
    }

    pub fn set_tunnel_throughput(&self, tunnel_id: u32, bps: f64) {
        self.inner()
            .tunnel_throughput_bps
            .with_label_values(&[&tunnel_id.to_string()])
            .set(bps);
    }

    pub fn set_aggregate_utilization(&self, utilization: f64) {
        self.inner().aggregate_utilization.set(utilization);
    }

    pub fn inc_scale_action(&self, direction: &str) {
        self.inner()
            .scale_actions_total
            .with_label_values(&[direction])
            .inc();
    }

    pub fn inc_collection_error(&self, kind: &str) {
        self.inner()
            .collection_errors_total
            .with_label_values(&[kind])
            .inc();
    }

    pub fn observe_driver_latency(&self, seconds: f64) {
        self.inner().driver_latency_seconds.observe(seconds);
    }
}

/// Structured logger for significant tunnel and scaling events
#[derive(Clone)]
pub struct StructuredLogger {
    host: String,
}

impl StructuredLogger {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    pub fn log_startup(&self, version: &str, tunnel_count: u32) {
        info!(
            event = "startup",
            host = %self.host,
            version = %version,
            tunnel_count,
            "tunnel client started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "shutdown",
            host = %self.host,
            reason = %reason,
            "tunnel client shutting down"
        );
    }

    pub fn log_tunnel_created(&self, tunnel_id: u32, interface: &str, listen_port: u16) {
        info!(
            event = "tunnel_created",
            host = %self.host,
            tunnel_id,
            interface = %interface,
            listen_port,
            "tunnel created"
        );
    }

    pub fn log_tunnel_removed(&self, tunnel_id: u32, interface: &str) {
        info!(
            event = "tunnel_removed",
            host = %self.host,
            tunnel_id,
            interface = %interface,
            "tunnel removed"
        );
    }

    pub fn log_scale_action(&self, direction: &str, from: u32, to: u32, reason: &str) {
        info!(
            event = "scale_action",
            host = %self.host,
            direction = %direction,
            from,
            to,
            reason = %reason,
            "scaling action executed"
        );
    }

    pub fn log_phase_transition(&self, from: &str, to: &str, utilization: f64) {
        warn!(
            event = "phase_transition",
            host = %self.host,
            from = %from,
            to = %to,
            utilization,
            "scaling phase transition"
        );
    }

    pub fn log_probe_complete(&self, bottleneck: &str, baseline_bps: u64, burst_bps: u64) {
        info!(
            event = "probe_complete",
            host = %self.host,
            bottleneck = %bottleneck,
            baseline_bps,
            burst_bps,
            "network discovery complete"
        );
    }

    pub fn log_driver_error(&self, interface: &str, error: &str) {
        warn!(
            event = "driver_error",
            host = %self.host,
            interface = %interface,
            error = %error,
            "tunnel driver error"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_handle_usable() {
        // The Prometheus registry is global; the handle must be safe to
        // create and drive repeatedly within one process.
        let metrics = TunnelMetricsExporter::new();
        metrics.set_tunnels_active(3);
        metrics.set_instances_active(1);
        metrics.set_tunnel_throughput(0, 1_200_000_000.0);
        metrics.set_aggregate_utilization(0.42);
        metrics.inc_scale_action("up");
        metrics.inc_collection_error("parse");
        metrics.observe_driver_latency(0.02);

        let again = TunnelMetricsExporter::new();
        again.set_tunnels_active(4);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("dtn-01");
        assert_eq!(logger.host, "dtn-01");
    }
}
