//! Health supervisor (C6).
//!
//! Starts a probing loop only while at least one circuit is non-Closed, and
//! stops it the moment every circuit is Closed again. A second periodic task
//! (the recovery monitor) polls `is_healthy()` directly so that a reset which
//! bypasses the normal listener chain — an operator calling
//! [`CircuitBreakerRegistry::reset`] — is still noticed within one tick.

use crate::circuit_breaker::CircuitState;
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> bool;
}

struct EngineHandle {
    probe_task: JoinHandle<()>,
    recovery_task: JoinHandle<()>,
}

pub struct HealthSupervisor {
    registry: CircuitBreakerRegistry,
    probes: Mutex<HashMap<String, Arc<dyn HealthProbe>>>,
    unhealthy: Mutex<HashMap<String, CircuitState>>,
    engine: Mutex<Option<EngineHandle>>,
    tick_interval: Duration,
}

impl HealthSupervisor {
    pub fn new(registry: CircuitBreakerRegistry) -> Arc<Self> {
        Arc::new(Self {
            registry,
            probes: Mutex::new(HashMap::new()),
            unhealthy: Mutex::new(HashMap::new()),
            engine: Mutex::new(None),
            tick_interval: Duration::from_secs(5),
        })
    }

    /// Override the recovery-monitor/probe tick (deterministic tests only need
    /// a few milliseconds instead of 5s).
    pub fn with_tick_interval(registry: CircuitBreakerRegistry, tick_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry,
            probes: Mutex::new(HashMap::new()),
            unhealthy: Mutex::new(HashMap::new()),
            engine: Mutex::new(None),
            tick_interval,
        })
    }

    pub fn register(&self, service: impl Into<String>, probe: Arc<dyn HealthProbe>) {
        self.probes.lock().expect("health supervisor probes poisoned").insert(service.into(), probe);
    }

    /// No-op initialization signal: the engine starts lazily on the first non-Closed transition.
    pub fn start(&self) {}

    pub fn is_running(&self) -> bool {
        self.engine.lock().expect("health supervisor engine poisoned").is_some()
    }

    pub fn unhealthy_services(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.unhealthy.lock().expect("health supervisor unhealthy-map poisoned").keys().cloned().collect();
        names.sort();
        names
    }

    /// Forwarded from [`crate::listeners::SupervisorListener`] on every circuit transition.
    pub fn on_state_change(self: &Arc<Self>, service: &str, _from: CircuitState, to: CircuitState) {
        if to == CircuitState::Closed {
            let became_empty = {
                let mut unhealthy = self.unhealthy.lock().expect("poisoned");
                unhealthy.remove(service);
                unhealthy.is_empty()
            };
            if became_empty {
                self.stop();
            }
        } else {
            {
                let mut unhealthy = self.unhealthy.lock().expect("poisoned");
                unhealthy.insert(service.to_string(), to);
            }
            self.ensure_started();
        }
    }

    fn ensure_started(self: &Arc<Self>) {
        let mut engine = self.engine.lock().expect("health supervisor engine poisoned");
        if engine.is_some() {
            return;
        }
        let probe_task = {
            let this = self.clone();
            tokio::spawn(async move { this.run_probe_loop().await })
        };
        let recovery_task = {
            let this = self.clone();
            tokio::spawn(async move { this.run_recovery_loop().await })
        };
        *engine = Some(EngineHandle { probe_task, recovery_task });
        tracing::info!("health supervisor: probing engine started");
    }

    /// Idempotent. Safe to call from a path racing with [`Self::ensure_started`]:
    /// both hold the same `engine` lock, so one fully wins before the other runs.
    pub fn stop(&self) {
        let mut engine = self.engine.lock().expect("health supervisor engine poisoned");
        if let Some(handle) = engine.take() {
            handle.probe_task.abort();
            handle.recovery_task.abort();
            tracing::info!("health supervisor: probing engine stopped");
        }
    }

    async fn run_probe_loop(self: Arc<Self>) {
        loop {
            let services = self.unhealthy_services();
            for service in services {
                let probe = self.probes.lock().expect("poisoned").get(&service).cloned();
                if let Some(probe) = probe {
                    if probe.check().await {
                        tracing::info!(service = %service, "health probe reports recovery");
                        self.registry.reset(&service);
                    }
                }
            }
            tokio::time::sleep(self.tick_interval).await;
        }
    }

    async fn run_recovery_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.tick_interval).await;
            let services = self.unhealthy_services();
            for service in services {
                if let Some(breaker) = self.registry.get(&service) {
                    if breaker.is_healthy() {
                        tracing::info!(service = %service, "recovery monitor observed external reset");
                        self.on_state_change(&service, CircuitState::Open, CircuitState::Closed);
                    }
                }
            }
        }
    }
}

impl Drop for HealthSupervisor {
    fn drop(&mut self) {
        if let Some(handle) = self.engine.lock().expect("poisoned").take() {
            handle.probe_task.abort();
            handle.recovery_task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;

    #[tokio::test]
    async fn engine_starts_on_first_unhealthy_and_stops_once_all_closed() {
        let registry = CircuitBreakerRegistry::new();
        let supervisor = HealthSupervisor::with_tick_interval(registry, Duration::from_millis(20));

        supervisor.on_state_change("a", CircuitState::Closed, CircuitState::Open);
        assert!(supervisor.is_running());

        supervisor.on_state_change("b", CircuitState::Closed, CircuitState::Open);
        assert!(supervisor.is_running(), "still running with two unhealthy services");

        supervisor.on_state_change("a", CircuitState::Open, CircuitState::Closed);
        assert!(supervisor.is_running(), "b is still unhealthy");

        supervisor.on_state_change("b", CircuitState::Open, CircuitState::Closed);
        assert!(!supervisor.is_running(), "all services closed, engine should stop");
    }

    #[tokio::test]
    async fn recovery_monitor_detects_externally_reset_breaker() {
        let registry = CircuitBreakerRegistry::new();
        let breaker = registry.get_or_create("svc", CircuitBreakerConfig::default());
        let supervisor = HealthSupervisor::with_tick_interval(registry, Duration::from_millis(10));

        supervisor.on_state_change("svc", CircuitState::Closed, CircuitState::Open);
        assert!(supervisor.is_running());

        // Simulate an external reset that bypasses the listener chain.
        breaker.reset();
        assert!(supervisor.is_running(), "supervisor hasn't observed the reset yet");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!supervisor.is_running(), "recovery monitor should have stopped the engine");
        assert!(supervisor.unhealthy_services().is_empty());
    }

    #[tokio::test]
    async fn probe_loop_checks_immediately_instead_of_waiting_a_full_tick() {
        struct AlwaysHealthy;
        #[async_trait]
        impl HealthProbe for AlwaysHealthy {
            async fn check(&self) -> bool {
                true
            }
        }

        let registry = CircuitBreakerRegistry::new();
        registry.get_or_create("svc", CircuitBreakerConfig::default());
        let supervisor = HealthSupervisor::with_tick_interval(registry, Duration::from_secs(3600));
        supervisor.register("svc", Arc::new(AlwaysHealthy));

        supervisor.on_state_change("svc", CircuitState::Closed, CircuitState::Open);
        assert!(supervisor.is_running());

        // The tick interval is an hour; if the probe loop slept first this
        // would still be running when checked immediately after.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!supervisor.is_running(), "probe should have run before the first sleep");
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let registry = CircuitBreakerRegistry::new();
        let supervisor = HealthSupervisor::with_tick_interval(registry, Duration::from_millis(20));
        supervisor.on_state_change("a", CircuitState::Closed, CircuitState::Open);
        supervisor.stop();
        supervisor.stop();
        assert!(!supervisor.is_running());
    }
}
