//! Circuit-breaker-wrapped publisher (C4).
//!
//! Wraps [`Publisher`] with a [`CircuitBreaker`], clamping every call to a
//! bounded operation timeout so a hung confirm can never pin a breaker open
//! indefinitely.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitCounts, CircuitState};
use crate::config::clamp_operation_timeout;
use crate::error::AmqpError;
use crate::publisher::{OutboundMessage, Publisher};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct CircuitBreakerPublisher {
    inner: Publisher,
    breaker: CircuitBreaker,
    operation_timeout: Duration,
}

impl CircuitBreakerPublisher {
    pub fn new(inner: Publisher, breaker: CircuitBreaker) -> Self {
        Self { inner, breaker, operation_timeout: clamp_operation_timeout(None) }
    }

    pub fn with_operation_timeout(mut self, requested: Option<Duration>) -> Self {
        self.operation_timeout = clamp_operation_timeout(requested);
        self
    }

    pub fn service(&self) -> &str {
        self.breaker.service()
    }

    pub fn is_healthy(&self) -> bool {
        self.breaker.is_healthy()
    }

    /// Current circuit state (the `get_state`/`is_healthy`/`counts` inspection
    /// surface C4 exposes alongside publishing).
    pub fn state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn get_state(&self) -> CircuitState {
        self.state()
    }

    pub fn counts(&self) -> CircuitCounts {
        self.breaker.counts()
    }

    pub async fn publish(&self, msg: OutboundMessage, cancel: &CancellationToken) -> Result<String, AmqpError> {
        let operation_timeout = self.operation_timeout;
        let result = self
            .breaker
            .execute(|| async {
                match tokio::time::timeout(operation_timeout, self.inner.publish(msg, cancel)).await {
                    Ok(inner_result) => inner_result,
                    Err(_elapsed) => Err(AmqpError::DeadlineExceeded),
                }
            })
            .await;

        match result {
            Ok(correlation_id) => Ok(correlation_id),
            Err(CircuitBreakerError::Open { .. }) => {
                Err(AmqpError::ServiceUnavailable { service: self.breaker.service().to_string() })
            }
            Err(CircuitBreakerError::Inner(err)) => Err(err),
        }
    }
}
