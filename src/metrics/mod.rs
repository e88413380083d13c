//! Prometheus metrics for the OB20 proxy
//!
//! Counters for framed traffic, framing failures and diagnosis records.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Proxy metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Connection metrics
    /// Total client connections accepted
    pub connections_total: IntCounter,
    /// Current active client connections
    pub connections_active: IntGauge,

    // Protocol metrics
    /// OB20 packets decoded ("in") and encoded ("out")
    pub ob20_frames_total: IntCounterVec,
    /// Framing errors by kind
    pub ob20_framing_errors_total: IntCounterVec,

    // Diagnosis metrics
    /// Diagnosis infos recorded by trace type
    pub diagnosis_records_total: IntCounterVec,
    /// Diagnosis infos that could not be allocated
    pub diagnosis_alloc_failures_total: IntCounter,
}

impl Metrics {
    /// Create a new metrics collection
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::new(
            "obproxy_connections_total",
            "Total number of client connections accepted",
        )
        .unwrap();

        let connections_active = IntGauge::new(
            "obproxy_connections_active",
            "Current number of active client connections",
        )
        .unwrap();

        let ob20_frames_total = IntCounterVec::new(
            Opts::new("obproxy_ob20_frames_total", "Total number of OB20 packets"),
            &["direction"], // in, out
        )
        .unwrap();

        let ob20_framing_errors_total = IntCounterVec::new(
            Opts::new(
                "obproxy_ob20_framing_errors_total",
                "Total number of OB20 framing errors",
            ),
            &["kind"], // header_checksum, bad_magic, tail_checksum, etc.
        )
        .unwrap();

        let diagnosis_records_total = IntCounterVec::new(
            Opts::new(
                "obproxy_diagnosis_records_total",
                "Total number of connection diagnosis records",
            ),
            &["trace_type"],
        )
        .unwrap();

        let diagnosis_alloc_failures_total = IntCounter::new(
            "obproxy_diagnosis_alloc_failures_total",
            "Total number of diagnosis infos dropped for lack of memory",
        )
        .unwrap();

        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_active.clone()))
            .unwrap();
        registry
            .register(Box::new(ob20_frames_total.clone()))
            .unwrap();
        registry
            .register(Box::new(ob20_framing_errors_total.clone()))
            .unwrap();
        registry
            .register(Box::new(diagnosis_records_total.clone()))
            .unwrap();
        registry
            .register(Box::new(diagnosis_alloc_failures_total.clone()))
            .unwrap();

        Self {
            registry,
            connections_total,
            connections_active,
            ob20_frames_total,
            ob20_framing_errors_total,
            diagnosis_records_total,
            diagnosis_alloc_failures_total,
        }
    }

    /// Record a new connection
    pub fn record_connection_accepted(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    /// Record a connection closed
    pub fn record_connection_closed(&self) {
        self.connections_active.dec();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_registered_metrics() {
        let m = Metrics::new();
        m.ob20_frames_total.with_label_values(&["in"]).inc();
        m.diagnosis_records_total
            .with_label_values(&["SERVER_VC_TRACE"])
            .inc();
        m.record_connection_accepted();

        let text = m.gather();
        assert!(text.contains("obproxy_ob20_frames_total{direction=\"in\"} 1"));
        assert!(text.contains("obproxy_diagnosis_records_total{trace_type=\"SERVER_VC_TRACE\"} 1"));
        assert!(text.contains("obproxy_connections_active 1"));
    }

    #[test]
    fn test_connection_gauge() {
        let m = Metrics::new();
        m.record_connection_accepted();
        m.record_connection_accepted();
        m.record_connection_closed();
        assert_eq!(m.connections_active.get(), 1);
        assert_eq!(m.connections_total.get(), 2);
    }
}
