//! State listeners (C8): bridge circuit-breaker transitions to the metrics
//! gauge and to the health supervisor.

use crate::circuit_breaker::{CircuitState, CircuitStateListener};
use crate::health::HealthSupervisor;
use crate::telemetry::{MetricsSink, GAUGE_CLOSED, GAUGE_HALF_OPEN, GAUGE_OPEN, GAUGE_UNKNOWN};
use std::sync::Arc;

fn gauge_value(state: CircuitState) -> i64 {
    match state {
        CircuitState::Closed => GAUGE_CLOSED,
        CircuitState::Open => GAUGE_OPEN,
        CircuitState::HalfOpen => GAUGE_HALF_OPEN,
    }
}

/// Publishes the `circuit_breaker_state` gauge on every transition.
pub struct MetricListener {
    sink: Arc<dyn MetricsSink>,
}

impl MetricListener {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }
}

impl CircuitStateListener for MetricListener {
    fn on_state_change(&self, service: &str, _from: CircuitState, to: CircuitState) {
        self.sink.set_circuit_state_gauge(service, gauge_value(to));
    }
}

/// Forwards circuit transitions to the health supervisor so it can start or
/// stop its probing loop.
pub struct SupervisorListener {
    supervisor: Arc<HealthSupervisor>,
}

impl SupervisorListener {
    pub fn new(supervisor: Arc<HealthSupervisor>) -> Self {
        Self { supervisor }
    }
}

impl CircuitStateListener for SupervisorListener {
    fn on_state_change(&self, service: &str, from: CircuitState, to: CircuitState) {
        self.supervisor.on_state_change(service, from, to);
    }
}
