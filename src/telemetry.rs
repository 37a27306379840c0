//! Metrics sink seam (CA2). Callers bring their own exporter; this crate only
//! defines the trait and ships a no-op default plus a `tracing`-backed one.

use std::fmt;

/// Gauge values published for `circuit_breaker_state`, tagged by service.
pub const GAUGE_CLOSED: i64 = 0;
pub const GAUGE_OPEN: i64 = 1;
pub const GAUGE_HALF_OPEN: i64 = 2;
pub const GAUGE_UNKNOWN: i64 = -1;

pub trait MetricsSink: Send + Sync + fmt::Debug {
    fn set_circuit_state_gauge(&self, service: &str, value: i64);
    fn incr_publish_attempt(&self, service: &str);
    fn incr_publish_retry(&self, service: &str);
    fn incr_dlq_route(&self, queue: &str);
}

/// Discards every metric. Default when no sink is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn set_circuit_state_gauge(&self, _service: &str, _value: i64) {}
    fn incr_publish_attempt(&self, _service: &str) {}
    fn incr_publish_retry(&self, _service: &str) {}
    fn incr_dlq_route(&self, _queue: &str) {}
}

/// Emits every metric as a `tracing` event shaped for a metrics-from-logs pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn set_circuit_state_gauge(&self, service: &str, value: i64) {
        tracing::info!(metric = "circuit_breaker_state", service, value, "gauge");
    }

    fn incr_publish_attempt(&self, service: &str) {
        tracing::debug!(metric = "publish_attempts_total", service, "counter");
    }

    fn incr_publish_retry(&self, service: &str) {
        tracing::debug!(metric = "publish_retries_total", service, "counter");
    }

    fn incr_dlq_route(&self, queue: &str) {
        tracing::warn!(metric = "dlq_routes_total", queue, "counter");
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct MemorySink {
        pub gauges: Mutex<Vec<(String, i64)>>,
        pub dlq_routes: Mutex<Vec<String>>,
    }

    impl MetricsSink for MemorySink {
        fn set_circuit_state_gauge(&self, service: &str, value: i64) {
            self.gauges.lock().unwrap().push((service.to_string(), value));
        }
        fn incr_publish_attempt(&self, _service: &str) {}
        fn incr_publish_retry(&self, _service: &str) {}
        fn incr_dlq_route(&self, queue: &str) {
            self.dlq_routes.lock().unwrap().push(queue.to_string());
        }
    }
}
