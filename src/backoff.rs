//! Exponential backoff with full jitter (C1), configurable via environment.
//!
//! Schedule parameters load once into a process-wide [`Adaptive`] cell so every
//! retrying component observes the same values without re-parsing the
//! environment on every call. Tests that mutate `std::env` must call
//! [`reset_backoff_config_for_test`] afterwards so later tests see a fresh read.

use crate::adaptive::Adaptive;
use crate::jitter::Jitter;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Exponential backoff schedule: `delay(n) = min(max_backoff, initial_backoff * factor^n)`,
/// then full-jittered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub factor: f64,
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            factor: 2.0,
            max_retries: 5,
        }
    }
}

impl BackoffConfig {
    /// Parse from environment, falling back to defaults for anything absent or malformed.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            initial_backoff: parse_duration_env("RETRY_INITIAL").unwrap_or(defaults.initial_backoff),
            max_backoff: parse_duration_env("RETRY_MAX_BACKOFF").unwrap_or(defaults.max_backoff),
            factor: std::env::var("RETRY_FACTOR")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|f: &f64| *f > 0.0)
                .unwrap_or(defaults.factor),
            max_retries: std::env::var("RETRY_MAX")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
        }
    }

    /// Un-jittered ceiling for the n-th attempt (0-indexed).
    pub fn schedule(&self, attempt: u32) -> Duration {
        let exponent = self.factor.powi(attempt as i32);
        let scaled = self.initial_backoff.as_secs_f64() * exponent;
        Duration::from_secs_f64(scaled.max(0.0)).min(self.max_backoff)
    }

    /// Full-jitter delay for the n-th attempt (0-indexed): `uniform(0, schedule(n))`.
    pub fn delay(&self, attempt: u32) -> Duration {
        Jitter::Full.apply(self.schedule(attempt))
    }
}

fn parse_duration_env(key: &str) -> Option<Duration> {
    let raw = std::env::var(key).ok()?;
    parse_duration(&raw)
}

/// Accepts a bare integer (milliseconds) or a humantime-style suffixed string ("30s", "200ms").
pub(crate) fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(millis) = raw.parse::<u64>() {
        return Some(Duration::from_millis(millis));
    }
    humantime::parse_duration(raw).ok()
}

fn cell() -> &'static Adaptive<BackoffConfig> {
    static CELL: OnceLock<Adaptive<BackoffConfig>> = OnceLock::new();
    CELL.get_or_init(|| Adaptive::new(BackoffConfig::from_env()))
}

/// Process-wide backoff configuration, lazily parsed from the environment on first use.
pub fn backoff_config() -> Arc<BackoffConfig> {
    cell().get()
}

/// Re-reads the environment into the shared cell. Test-only: production code should never
/// need the schedule to change mid-process.
#[cfg(any(test, feature = "test-util"))]
pub fn reset_backoff_config_for_test() {
    cell().set(BackoffConfig::from_env());
}
