//! Stable error taxonomy for the AMQP adapter (C9).
//!
//! Every boundary returns [`AmqpError`]. Internal-only causes (confirm-channel
//! closures, nacks, confirm timeouts) are retried by the publisher and only
//! surfaced once retries are exhausted; the predicate methods below let
//! callers branch on error identity without downcasting.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AmqpError {
    #[error("no broker connection available")]
    NilConnection,

    #[error("confirm channel closed while awaiting confirmation for {exchange}/{routing_key}")]
    ConfirmChannelClosed { exchange: String, routing_key: String },

    #[error("broker nacked publish to {exchange}/{routing_key}")]
    BrokerNack { exchange: String, routing_key: String },

    #[error("no publisher confirmation within {timeout:?} for {exchange}/{routing_key}")]
    ConfirmTimeout { exchange: String, routing_key: String, timeout: Duration },

    #[error("service {service} is unavailable")]
    ServiceUnavailable { service: String },

    #[error("producer returned an unexpected result for {exchange}/{routing_key}")]
    InternalProducerError { exchange: String, routing_key: String },

    #[error("nil underlying producer")]
    NilUnderlying,
    #[error("nil circuit breaker manager")]
    NilCbManager,
    #[error("nil circuit breaker logger")]
    NilCbLogger,
    #[error("nil health checker")]
    NilHealthChecker,
    #[error("nil metrics factory")]
    NilMetricsFactory,
    #[error("nil circuit breaker manager instance")]
    NilCircuitBreakerManager,
    #[error("nil health checker logger")]
    NilHealthCheckerLogger,

    #[error("rabbitmq reported unhealthy for {service}")]
    RabbitMqUnhealthy { service: String },
    #[error("rabbitmq channel unavailable for {service}")]
    RabbitMqChannelUnavailable { service: String },

    #[error("operation canceled")]
    Canceled,
    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    #[error("tenant id required")]
    TenantIdRequired,

    #[error("tenant directory lookup failed for {tenant_id}: {reason}")]
    TenantDirectoryUnavailable { tenant_id: String, reason: String },

    #[error(transparent)]
    Amqp(#[from] lapin::Error),
}

impl AmqpError {
    pub fn is_nil_connection(&self) -> bool {
        matches!(self, Self::NilConnection)
    }

    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable { .. })
    }

    pub fn is_broker_nack(&self) -> bool {
        matches!(self, Self::BrokerNack { .. })
    }

    pub fn is_confirm_timeout(&self) -> bool {
        matches!(self, Self::ConfirmTimeout { .. })
    }

    pub fn is_confirm_channel_closed(&self) -> bool {
        matches!(self, Self::ConfirmChannelClosed { .. })
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }

    /// Whether a publish attempt failing with this error should be retried.
    /// Cancellation and deadlines are never retried; everything the broker
    /// itself reported as transient is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConfirmChannelClosed { .. }
                | Self::BrokerNack { .. }
                | Self::ConfirmTimeout { .. }
                | Self::Amqp(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_match_their_variant() {
        let err = AmqpError::ServiceUnavailable { service: "rabbitmq-producer".into() };
        assert!(err.is_service_unavailable());
        assert!(!err.is_broker_nack());
        assert!(!err.is_retryable());
    }

    #[test]
    fn internal_causes_are_retryable() {
        assert!(AmqpError::BrokerNack { exchange: "e".into(), routing_key: "k".into() }.is_retryable());
        assert!(AmqpError::ConfirmTimeout {
            exchange: "e".into(),
            routing_key: "k".into(),
            timeout: Duration::from_secs(10)
        }
        .is_retryable());
        assert!(AmqpError::ConfirmChannelClosed { exchange: "e".into(), routing_key: "k".into() }
            .is_retryable());
    }

    #[test]
    fn cancellation_and_deadlines_are_terminal() {
        assert!(!AmqpError::Canceled.is_retryable());
        assert!(!AmqpError::DeadlineExceeded.is_retryable());
        assert!(AmqpError::Canceled.is_canceled());
        assert!(AmqpError::DeadlineExceeded.is_deadline_exceeded());
    }

    #[test]
    fn display_includes_exchange_and_routing_key() {
        let err = AmqpError::BrokerNack { exchange: "ex".into(), routing_key: "rk".into() };
        let msg = err.to_string();
        assert!(msg.contains("ex"));
        assert!(msg.contains("rk"));
    }
}
