//! Confirming publisher (C2).
//!
//! Publishes with the channel in confirm-select mode, retries up to
//! [`crate::backoff::BackoffConfig::max_retries`] times with full-jitter
//! backoff between attempts, and honors cancellation before any I/O and
//! while waiting on a confirmation.

use crate::backoff::backoff_config;
use crate::broker::{Ack, PublishChannel};
use crate::error::AmqpError;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{MetricsSink, NullSink};
use opentelemetry::propagation::Injector;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How long to wait for a broker ack/nack after `basic_publish` before
/// treating the attempt as failed and retrying.
pub const PUBLISH_CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

const HEADER_CORRELATION_ID: &str = "x-correlation-id";

/// A message queued for delivery. `correlation_id` is generated if absent.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
}

impl OutboundMessage {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>, body: Vec<u8>) -> Self {
        Self { exchange: exchange.into(), routing_key: routing_key.into(), body, correlation_id: None }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Publishes to a single channel with broker confirmation and bounded retry.
pub struct Publisher {
    channel: Option<Arc<dyn PublishChannel>>,
    sleeper: Arc<dyn Sleeper>,
    confirm_timeout: Duration,
    sink: Arc<dyn MetricsSink>,
}

impl Publisher {
    pub fn new(channel: Arc<dyn PublishChannel>) -> Self {
        Self {
            channel: Some(channel),
            sleeper: Arc::new(TokioSleeper),
            confirm_timeout: PUBLISH_CONFIRM_TIMEOUT,
            sink: Arc::new(NullSink),
        }
    }

    /// Build a publisher with no underlying channel. Every publish fails
    /// with [`AmqpError::NilConnection`] without touching the network —
    /// used where a connection is expected but was never established.
    pub fn disconnected() -> Self {
        Self { channel: None, sleeper: Arc::new(TokioSleeper), confirm_timeout: PUBLISH_CONFIRM_TIMEOUT, sink: Arc::new(NullSink) }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Publish `msg`, retrying with jittered backoff until it is confirmed,
    /// the retry budget is exhausted, or `cancel` fires. Returns the
    /// correlation id used (generated if the caller didn't supply one).
    pub async fn publish(&self, msg: OutboundMessage, cancel: &CancellationToken) -> Result<String, AmqpError> {
        let Some(channel) = self.channel.as_ref() else {
            return Err(AmqpError::NilConnection);
        };

        let correlation_id = msg.correlation_id.clone().unwrap_or_else(|| Uuid::now_v7().to_string());
        let span = tracing::info_span!(
            "amqp.publish",
            exchange = %msg.exchange,
            routing_key = %msg.routing_key,
            correlation_id = %correlation_id,
        );
        let _enter = span.enter();

        let backoff = backoff_config();
        let mut last_err = AmqpError::InternalProducerError {
            exchange: msg.exchange.clone(),
            routing_key: msg.routing_key.clone(),
        };

        for attempt in 0..=backoff.max_retries {
            if cancel.is_cancelled() {
                return Err(AmqpError::Canceled);
            }

            self.sink.incr_publish_attempt(&msg.exchange);
            match self.try_publish_once(channel, &msg, &correlation_id, cancel).await {
                Ok(()) => return Ok(correlation_id),
                Err(AmqpError::Canceled) => return Err(AmqpError::Canceled),
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "publish attempt failed");
                    last_err = err;
                    if attempt < backoff.max_retries {
                        self.sink.incr_publish_retry(&msg.exchange);
                        self.sleeper.sleep(backoff.delay(attempt)).await;
                    }
                }
            }
        }

        Err(last_err)
    }

    async fn try_publish_once(
        &self,
        channel: &Arc<dyn PublishChannel>,
        msg: &OutboundMessage,
        correlation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AmqpError> {
        let mut headers = HashMap::new();
        headers.insert(HEADER_CORRELATION_ID.to_string(), correlation_id.to_string());
        inject_trace_context(&mut headers);

        let attempt = channel.publish_and_confirm(&msg.exchange, &msg.routing_key, correlation_id, headers, true, &msg.body);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AmqpError::Canceled),
            outcome = tokio::time::timeout(self.confirm_timeout, attempt) => outcome,
        };

        match outcome {
            Err(_elapsed) => Err(AmqpError::ConfirmTimeout {
                exchange: msg.exchange.clone(),
                routing_key: msg.routing_key.clone(),
                timeout: self.confirm_timeout,
            }),
            Ok(Err(_lapin_err)) => Err(AmqpError::ConfirmChannelClosed {
                exchange: msg.exchange.clone(),
                routing_key: msg.routing_key.clone(),
            }),
            Ok(Ok(ack)) => {
                if ack.is_ack() {
                    Ok(())
                } else {
                    Err(AmqpError::BrokerNack { exchange: msg.exchange.clone(), routing_key: msg.routing_key.clone() })
                }
            }
        }
    }
}

struct MapInjector<'a>(&'a mut HashMap<String, String>);

impl Injector for MapInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

/// Injects the current W3C trace-context (`traceparent`/`tracestate`) into
/// the outbound headers, mirroring the extractor pattern consumers use to
/// recover it on the other end.
fn inject_trace_context(headers: &mut HashMap<String, String>) {
    opentelemetry::global::get_text_map_propagator(|propagator| {
        let cx = opentelemetry::Context::current();
        propagator.inject_context(&cx, &mut MapInjector(headers));
    });
}
