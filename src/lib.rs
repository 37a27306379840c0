#![forbid(unsafe_code)]

//! # Rabbit Resilience
//!
//! A resilient AMQP adapter for financial-transaction services built on
//! [`lapin`]: a confirming publisher with bounded retry, a circuit breaker
//! guarding every outbound call, a worker-pool consumer with retry/DLQ
//! routing, a health supervisor that probes only while something is
//! unhealthy, and a multi-tenant router for services that publish on behalf
//! of more than one tenant.
//!
//! ## Quick start
//!
//! ```no_run
//! use rabbit_resilience::{
//!     CircuitBreaker, CircuitBreakerConfig, CircuitBreakerPublisher, OutboundMessage, Publisher,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let connection = lapin::Connection::connect(
//!     "amqp://127.0.0.1:5672/%2f",
//!     lapin::ConnectionProperties::default(),
//! )
//! .await?;
//! let channel = Arc::new(connection.create_channel().await?);
//!
//! let breaker = CircuitBreaker::new("payments-producer", CircuitBreakerConfig::default());
//! let publisher = CircuitBreakerPublisher::new(Publisher::new(channel), breaker);
//!
//! let cancel = CancellationToken::new();
//! let msg = OutboundMessage::new("payments", "payment.created", br#"{"id":1}"#.to_vec());
//! publisher.publish(msg, &cancel).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! Every tunable reads from the environment on first use and is cached for
//! the life of the process; see [`config::RabbitConfig`] for the full list
//! and [`config::reset_config_for_test`] for test isolation.

mod adaptive;
mod backoff;
pub mod broker;
mod breaker_publisher;
mod circuit_breaker;
mod circuit_breaker_registry;
mod clock;
pub mod config;
mod consumer;
mod error;
mod health;
mod jitter;
mod listeners;
mod probe;
mod publisher;
mod router;
mod sleeper;
pub mod telemetry;

pub use backoff::{backoff_config, BackoffConfig};
pub use breaker_publisher::CircuitBreakerPublisher;
pub use broker::{Ack, ConsumeChannel, IncomingDelivery, PublishChannel};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitCounts, CircuitState, CircuitStateListener,
};
pub use circuit_breaker_registry::CircuitBreakerRegistry;
pub use clock::{Clock, MonotonicClock};
pub use consumer::{ConsumerPool, MessageHandler, MAX_REDELIVERIES};
pub use error::AmqpError;
pub use health::{HealthProbe, HealthSupervisor};
pub use jitter::Jitter;
pub use listeners::{MetricListener, SupervisorListener};
pub use probe::{RabbitMqHealthProbe, StaticHealthProbe};
pub use publisher::{OutboundMessage, Publisher, PUBLISH_CONFIRM_TIMEOUT};
pub use router::{
    RouterStats, StaticTenantDirectory, TenantConnectionHandle, TenantDirectory, TenantDirectoryError, TenantRouter,
};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};

#[cfg(feature = "tenant-http")]
pub use router::HttpTenantDirectory;

#[cfg(any(test, feature = "test-util"))]
pub use broker::fake::FakeBroker;
