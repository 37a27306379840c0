//! Process-wide configuration loaded from environment (CA1).
//!
//! Mirrors [`crate::backoff`]'s pattern: parsed once behind an [`Adaptive`]
//! cell, with a test-only reset entry point so env-var mutation in tests is
//! observable without restarting the process.

use crate::adaptive::Adaptive;
use crate::backoff::{parse_duration, BackoffConfig};
use crate::circuit_breaker::CircuitBreakerConfig;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RabbitConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub backoff: BackoffConfig,
    /// `RABBITMQ_TRANSACTION_ASYNC=false` short-circuits the producer health probe to healthy.
    pub transaction_async: bool,
}

impl Default for RabbitConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            backoff: BackoffConfig::default(),
            transaction_async: true,
        }
    }
}

impl RabbitConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            circuit_breaker: CircuitBreakerConfig {
                consecutive_failures: env_u32("RABBITMQ_CB_CONSECUTIVE_FAILURES")
                    .unwrap_or(defaults.circuit_breaker.consecutive_failures),
                failure_ratio: env_f64("RABBITMQ_CB_FAILURE_RATIO")
                    .unwrap_or(defaults.circuit_breaker.failure_ratio),
                min_requests: env_u32("RABBITMQ_CB_MIN_REQUESTS")
                    .unwrap_or(defaults.circuit_breaker.min_requests),
                max_requests_in_half_open: env_u32("RABBITMQ_CB_MAX_REQUESTS")
                    .unwrap_or(defaults.circuit_breaker.max_requests_in_half_open),
                window_interval: env_duration("RABBITMQ_CB_INTERVAL")
                    .unwrap_or(defaults.circuit_breaker.window_interval),
                open_timeout: env_duration("RABBITMQ_CB_TIMEOUT")
                    .unwrap_or(defaults.circuit_breaker.open_timeout),
            },
            backoff: BackoffConfig::from_env(),
            transaction_async: std::env::var("RABBITMQ_TRANSACTION_ASYNC")
                .map(|v| v != "false")
                .unwrap_or(defaults.transaction_async),
        }
    }
}

/// Clamp a requested per-call operation timeout into `[1s, 60s]`, defaulting to 30s
/// when `None` is supplied. Used by the circuit-breaker publisher (C4).
pub fn clamp_operation_timeout(requested: Option<Duration>) -> Duration {
    const MIN: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(60);
    const DEFAULT: Duration = Duration::from_secs(30);
    requested.unwrap_or(DEFAULT).clamp(MIN, MAX)
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_duration(key: &str) -> Option<Duration> {
    parse_duration(&std::env::var(key).ok()?)
}

fn cell() -> &'static Adaptive<RabbitConfig> {
    static CELL: OnceLock<Adaptive<RabbitConfig>> = OnceLock::new();
    CELL.get_or_init(|| Adaptive::new(RabbitConfig::from_env()))
}

pub fn config() -> Arc<RabbitConfig> {
    cell().get()
}

#[cfg(any(test, feature = "test-util"))]
pub fn reset_config_for_test() {
    cell().set(RabbitConfig::from_env());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_match_spec() {
        let cfg = RabbitConfig::default();
        assert_eq!(cfg.circuit_breaker.consecutive_failures, 3);
        assert_eq!(cfg.circuit_breaker.min_requests, 5);
        assert!(cfg.transaction_async);
    }

    #[test]
    fn operation_timeout_clamps_into_range() {
        assert_eq!(clamp_operation_timeout(None), Duration::from_secs(30));
        assert_eq!(clamp_operation_timeout(Some(Duration::from_millis(1))), Duration::from_secs(1));
        assert_eq!(clamp_operation_timeout(Some(Duration::from_secs(600))), Duration::from_secs(60));
        assert_eq!(clamp_operation_timeout(Some(Duration::from_secs(10))), Duration::from_secs(10));
    }

    #[test]
    #[serial]
    fn from_env_overrides_circuit_breaker_fields() {
        std::env::set_var("RABBITMQ_CB_CONSECUTIVE_FAILURES", "9");
        std::env::set_var("RABBITMQ_CB_FAILURE_RATIO", "0.8");
        std::env::set_var("RABBITMQ_TRANSACTION_ASYNC", "false");

        let cfg = RabbitConfig::from_env();
        assert_eq!(cfg.circuit_breaker.consecutive_failures, 9);
        assert_eq!(cfg.circuit_breaker.failure_ratio, 0.8);
        assert!(!cfg.transaction_async);

        std::env::remove_var("RABBITMQ_CB_CONSECUTIVE_FAILURES");
        std::env::remove_var("RABBITMQ_CB_FAILURE_RATIO");
        std::env::remove_var("RABBITMQ_TRANSACTION_ASYNC");
    }

    #[test]
    #[serial]
    fn reset_for_test_reflects_new_env() {
        std::env::set_var("RABBITMQ_CB_MIN_REQUESTS", "11");
        reset_config_for_test();
        assert_eq!(config().circuit_breaker.min_requests, 11);

        std::env::remove_var("RABBITMQ_CB_MIN_REQUESTS");
        reset_config_for_test();
        assert_eq!(config().circuit_breaker.min_requests, RabbitConfig::default().circuit_breaker.min_requests);
    }
}
