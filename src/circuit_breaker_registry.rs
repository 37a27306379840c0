//! Registry of named circuit breakers, keyed by service name.
//!
//! The manager is constructed once at startup and outlives every publisher
//! that references it; publishers hold a cloned `CircuitBreaker` handle, not
//! the registry itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

#[derive(Clone, Default)]
pub struct CircuitBreakerRegistry {
    inner: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the breaker for `service`, creating one with `config` the first time it's seen.
    pub fn get_or_create(&self, service: &str, config: CircuitBreakerConfig) -> CircuitBreaker {
        let mut breakers = self.inner.lock().expect("circuit breaker registry poisoned");
        breakers
            .entry(service.to_string())
            .or_insert_with(|| CircuitBreaker::new(service, config))
            .clone()
    }

    pub fn get(&self, service: &str) -> Option<CircuitBreaker> {
        self.inner.lock().expect("circuit breaker registry poisoned").get(service).cloned()
    }

    /// Reset a registered breaker by service name. Returns `false` if unknown.
    pub fn reset(&self, service: &str) -> bool {
        match self.get(service) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Snapshot of every registered breaker's current state, sorted by service name.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let breakers = self.inner.lock().expect("circuit breaker registry poisoned");
        let mut entries: Vec<(String, CircuitState)> =
            breakers.iter().map(|(name, breaker)| (name.clone(), breaker.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
