//! Multi-tenant router (C7).
//!
//! Resolves a tenant id to a broker connection via a [`TenantDirectory`],
//! caches the connection for reuse, and publishes through it with
//! persistent delivery. `health_check` always reports healthy: tenant
//! connections are established lazily on first publish, so there is no
//! steady-state connection whose liveness this router could usefully poll.

use crate::error::AmqpError;
use crate::publisher::{OutboundMessage, Publisher};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

/// Where a tenant's messages should be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantConnectionHandle {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub user: String,
    pub password: String,
}

impl TenantConnectionHandle {
    pub fn amqp_url(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TenantDirectoryError {
    #[error("tenant {tenant_id} not found")]
    NotFound { tenant_id: String },
    #[error("tenant directory request failed for {tenant_id}: {reason}")]
    RequestFailed { tenant_id: String, reason: String },
}

#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn resolve(&self, tenant_id: &str, service: &str) -> Result<TenantConnectionHandle, TenantDirectoryError>;
}

/// Test double backed by a fixed map, no network calls.
#[derive(Default)]
pub struct StaticTenantDirectory {
    tenants: HashMap<String, TenantConnectionHandle>,
}

impl StaticTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>, handle: TenantConnectionHandle) -> Self {
        self.tenants.insert(tenant_id.into(), handle);
        self
    }
}

#[async_trait]
impl TenantDirectory for StaticTenantDirectory {
    async fn resolve(&self, tenant_id: &str, _service: &str) -> Result<TenantConnectionHandle, TenantDirectoryError> {
        self.tenants
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| TenantDirectoryError::NotFound { tenant_id: tenant_id.to_string() })
    }
}

/// HTTP-backed tenant directory client. Opt in via the `tenant-http` feature;
/// most deployments resolve tenants through a directory service reachable
/// over plain HTTP, the same way the teacher's telemetry sinks stay
/// bring-your-own-backend.
#[cfg(feature = "tenant-http")]
pub struct HttpTenantDirectory {
    client: reqwest::Client,
    base_url: String,
}

#[cfg(feature = "tenant-http")]
impl HttpTenantDirectory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into() }
    }
}

/// Shape of the directory's `GET /tenants/{id}/services/{service}/settings`
/// response. Kept private and separate from [`TenantConnectionHandle`] so the
/// public type doesn't grow wire-format baggage.
#[cfg(feature = "tenant-http")]
#[derive(serde::Deserialize)]
struct TenantSettingsResponse {
    messaging: MessagingSettings,
}

#[cfg(feature = "tenant-http")]
#[derive(serde::Deserialize)]
struct MessagingSettings {
    rabbitmq: RabbitMqSettings,
}

#[cfg(feature = "tenant-http")]
#[derive(serde::Deserialize)]
struct RabbitMqSettings {
    host: String,
    port: u16,
    vhost: String,
    username: String,
    password: String,
}

#[cfg(feature = "tenant-http")]
#[async_trait]
impl TenantDirectory for HttpTenantDirectory {
    async fn resolve(&self, tenant_id: &str, service: &str) -> Result<TenantConnectionHandle, TenantDirectoryError> {
        let url = format!("{}/tenants/{}/services/{}/settings", self.base_url, tenant_id, service);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| TenantDirectoryError::RequestFailed { tenant_id: tenant_id.to_string(), reason: err.to_string() })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(TenantDirectoryError::NotFound { tenant_id: tenant_id.to_string() });
        }

        let body: TenantSettingsResponse = response
            .error_for_status()
            .map_err(|err| TenantDirectoryError::RequestFailed { tenant_id: tenant_id.to_string(), reason: err.to_string() })?
            .json()
            .await
            .map_err(|err| TenantDirectoryError::RequestFailed { tenant_id: tenant_id.to_string(), reason: err.to_string() })?;

        let rabbitmq = body.messaging.rabbitmq;
        Ok(TenantConnectionHandle {
            host: rabbitmq.host,
            port: rabbitmq.port,
            vhost: rabbitmq.vhost,
            user: rabbitmq.username,
            password: rabbitmq.password,
        })
    }
}

/// Snapshot of router-wide cache state for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    pub total_connections: usize,
}

/// Publishes on behalf of a specific tenant, resolving and caching a
/// connection-backed publisher per tenant id the first time it is used.
pub struct TenantRouter {
    directory: Arc<dyn TenantDirectory>,
    service: String,
    connect: Box<dyn Fn(TenantConnectionHandle) -> Arc<Publisher> + Send + Sync>,
    cache: AsyncMutex<HashMap<String, Arc<Publisher>>>,
}

impl TenantRouter {
    pub fn new(
        directory: Arc<dyn TenantDirectory>,
        service: impl Into<String>,
        connect: impl Fn(TenantConnectionHandle) -> Arc<Publisher> + Send + Sync + 'static,
    ) -> Self {
        Self { directory, service: service.into(), connect: Box::new(connect), cache: AsyncMutex::new(HashMap::new()) }
    }

    /// Always healthy: see module docs.
    pub fn health_check(&self) -> bool {
        true
    }

    /// Snapshot of how many distinct tenant connections are currently cached
    /// — one per tenant id that has published at least once, reused across
    /// every subsequent call for that tenant.
    pub async fn stats(&self) -> RouterStats {
        RouterStats { total_connections: self.cache.lock().await.len() }
    }

    pub async fn publish_for_tenant(
        &self,
        tenant_id: Option<&str>,
        msg: OutboundMessage,
        cancel: &CancellationToken,
    ) -> Result<String, AmqpError> {
        let tenant_id = tenant_id.ok_or(AmqpError::TenantIdRequired)?;
        let publisher = self.publisher_for(tenant_id).await?;
        publisher.publish(msg, cancel).await
    }

    async fn publisher_for(&self, tenant_id: &str) -> Result<Arc<Publisher>, AmqpError> {
        {
            let cache = self.cache.lock().await;
            if let Some(publisher) = cache.get(tenant_id) {
                return Ok(publisher.clone());
            }
        }

        let handle = self.directory.resolve(tenant_id, &self.service).await.map_err(|err| {
            AmqpError::TenantDirectoryUnavailable { tenant_id: tenant_id.to_string(), reason: err.to_string() }
        })?;

        let publisher = (self.connect)(handle);

        let mut cache = self.cache.lock().await;
        Ok(cache.entry(tenant_id.to_string()).or_insert(publisher).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> TenantConnectionHandle {
        TenantConnectionHandle {
            host: "rabbitmq.internal".into(),
            port: 5672,
            vhost: "/".into(),
            user: "tenant".into(),
            password: "secret".into(),
        }
    }

    #[tokio::test]
    async fn missing_tenant_id_is_rejected_before_any_resolution() {
        let directory = Arc::new(StaticTenantDirectory::new());
        let router = TenantRouter::new(directory, "rabbitmq-producer", |_handle| Arc::new(Publisher::disconnected()));

        let cancel = CancellationToken::new();
        let err = router
            .publish_for_tenant(None, OutboundMessage::new("ex", "rk", vec![]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::TenantIdRequired));
    }

    #[tokio::test]
    async fn unknown_tenant_surfaces_as_directory_unavailable() {
        let directory = Arc::new(StaticTenantDirectory::new());
        let router = TenantRouter::new(directory, "rabbitmq-producer", |_handle| Arc::new(Publisher::disconnected()));

        let cancel = CancellationToken::new();
        let err = router
            .publish_for_tenant(Some("tenant-a"), OutboundMessage::new("ex", "rk", vec![]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::TenantDirectoryUnavailable { .. }));
    }

    #[tokio::test]
    async fn resolved_tenant_reuses_cached_publisher() {
        let directory = Arc::new(StaticTenantDirectory::new().with_tenant("tenant-a", handle()));
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let router = TenantRouter::new(directory, "rabbitmq-producer", move |_handle| {
            calls_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Arc::new(Publisher::disconnected())
        });

        let cancel = CancellationToken::new();
        let _ = router.publish_for_tenant(Some("tenant-a"), OutboundMessage::new("ex", "rk", vec![]), &cancel).await;
        let _ = router.publish_for_tenant(Some("tenant-a"), OutboundMessage::new("ex", "rk", vec![]), &cancel).await;

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stats_reports_one_connection_per_tenant_after_repeated_calls() {
        let directory = Arc::new(StaticTenantDirectory::new().with_tenant("tenant-a", handle()));
        let router = TenantRouter::new(directory, "rabbitmq-producer", |_handle| Arc::new(Publisher::disconnected()));

        let cancel = CancellationToken::new();
        for _ in 0..3 {
            let _ = router.publish_for_tenant(Some("tenant-a"), OutboundMessage::new("ex", "rk", vec![]), &cancel).await;
        }

        assert_eq!(router.stats().await.total_connections, 1);
    }

    #[tokio::test]
    async fn health_check_is_always_true() {
        let directory = Arc::new(StaticTenantDirectory::new());
        let router = TenantRouter::new(directory, "rabbitmq-producer", |_handle| Arc::new(Publisher::disconnected()));
        assert!(router.health_check());
    }
}
