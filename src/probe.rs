//! Concrete health probes (CA4) registered with the health supervisor.

use crate::config;
use crate::health::HealthProbe;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Checks that the broker connection backing a publisher/consumer is alive.
/// Honors `RABBITMQ_TRANSACTION_ASYNC=false`, which short-circuits to healthy
/// regardless of connection state (used when publish confirmation is
/// deliberately decoupled from the request path).
pub struct RabbitMqHealthProbe {
    connection: Arc<lapin::Connection>,
}

impl RabbitMqHealthProbe {
    pub fn new(connection: Arc<lapin::Connection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl HealthProbe for RabbitMqHealthProbe {
    async fn check(&self) -> bool {
        if !config::config().transaction_async {
            return true;
        }
        self.connection.status().connected()
    }
}

/// Test double with a settable health bit.
pub struct StaticHealthProbe {
    healthy: AtomicBool,
}

impl StaticHealthProbe {
    pub fn new(healthy: bool) -> Self {
        Self { healthy: AtomicBool::new(healthy) }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl HealthProbe for StaticHealthProbe {
    async fn check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}
