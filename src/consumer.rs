//! Consumer pool (C5).
//!
//! Registers queue handlers before [`ConsumerPool::run`] is called —
//! registration itself is not concurrency-safe, matching the one-time wiring
//! that happens during startup elsewhere in this crate. `run` sets channel
//! QoS to `workers * per_worker_prefetch`, opens one consume stream per
//! queue, and spawns `workers` tasks sharing it.

use crate::broker::{ConsumeChannel, DeliveryStream, IncomingDelivery};
use crate::telemetry::{MetricsSink, NullSink};
use async_trait::async_trait;
use futures::future::FutureExt;
use futures_util::stream::StreamExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

const HEADER_RETRY_COUNT: &str = "x-retry-count";
/// Once a redelivered message's retry count reaches this, route to the DLQ
/// instead of republishing again.
pub const MAX_REDELIVERIES: i64 = 4;
const DEFAULT_WORKERS: u16 = 5;
const DEFAULT_PER_WORKER_PREFETCH: u16 = 10;

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: &IncomingDelivery) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

struct QueueRegistration {
    queue: String,
    workers: u16,
    per_worker_prefetch: u16,
    handler: Arc<dyn MessageHandler>,
}

/// A pool of workers consuming from one or more queues on a shared channel.
pub struct ConsumerPool {
    channel: Arc<dyn ConsumeChannel>,
    registrations: Vec<QueueRegistration>,
    tasks: Vec<JoinHandle<()>>,
    sink: Arc<dyn MetricsSink>,
}

impl ConsumerPool {
    pub fn new(channel: Arc<dyn ConsumeChannel>) -> Self {
        Self { channel, registrations: Vec::new(), tasks: Vec::new(), sink: Arc::new(NullSink) }
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Register a queue handler. Must be called before [`Self::run`]; not
    /// safe to call concurrently with itself or with `run`.
    pub fn register(
        &mut self,
        queue: impl Into<String>,
        workers: u16,
        per_worker_prefetch: u16,
        handler: Arc<dyn MessageHandler>,
    ) {
        self.registrations.push(QueueRegistration {
            queue: queue.into(),
            workers: if workers == 0 { DEFAULT_WORKERS } else { workers },
            per_worker_prefetch: if per_worker_prefetch == 0 {
                DEFAULT_PER_WORKER_PREFETCH
            } else {
                per_worker_prefetch
            },
            handler,
        });
    }

    /// Start consuming every registered queue. Each queue gets its own
    /// prefetch sized to `workers * per_worker_prefetch` and its own pool of
    /// worker tasks sharing one consume stream.
    pub async fn run(&mut self) -> Result<(), lapin::Error> {
        for registration in &self.registrations {
            let prefetch = registration.workers.saturating_mul(registration.per_worker_prefetch);
            self.channel.set_qos(prefetch).await?;

            let stream: DeliveryStream = self.channel.consume(&registration.queue).await?;
            let stream = Arc::new(AsyncMutex::new(stream));

            for worker_id in 0..registration.workers {
                let stream = stream.clone();
                let channel = self.channel.clone();
                let queue = registration.queue.clone();
                let handler = registration.handler.clone();
                let sink = self.sink.clone();

                self.tasks.push(tokio::spawn(async move {
                    worker_loop(worker_id, stream, channel, queue, handler, sink).await;
                }));
            }
        }
        Ok(())
    }

    /// Abort every worker task. Outstanding deliveries are left unacked and
    /// will be redelivered once the channel closes.
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ConsumerPool {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn worker_loop(
    worker_id: u16,
    stream: Arc<AsyncMutex<DeliveryStream>>,
    channel: Arc<dyn ConsumeChannel>,
    queue: String,
    handler: Arc<dyn MessageHandler>,
    sink: Arc<dyn MetricsSink>,
) {
    loop {
        let delivery = {
            let mut stream = stream.lock().await;
            stream.next().await
        };

        let Some(delivery) = delivery else { break };
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(err) => {
                tracing::error!(worker_id, queue = %queue, error = %err, "error receiving delivery");
                continue;
            }
        };

        handle_delivery(channel.as_ref(), &queue, delivery, handler.as_ref(), sink.as_ref()).await;
    }
}

async fn handle_delivery(
    channel: &dyn ConsumeChannel,
    queue: &str,
    delivery: IncomingDelivery,
    handler: &dyn MessageHandler,
    sink: &dyn MetricsSink,
) {
    let delivery_tag = delivery.delivery_tag;

    let outcome = AssertUnwindSafe(handler.handle(&delivery)).catch_unwind().await;

    let result = match outcome {
        Ok(result) => result,
        Err(_panic) => {
            tracing::error!(queue, "handler panicked; treating as failure");
            Err("handler panicked".into())
        }
    };

    match result {
        Ok(()) => {
            if let Err(err) = channel.ack(delivery_tag).await {
                tracing::error!(queue, error = %err, "failed to ack delivery");
            }
        }
        Err(err) => {
            tracing::warn!(queue, error = %err, "handler failed");
            route_failed_delivery(channel, queue, &delivery, sink).await;
        }
    }
}

async fn route_failed_delivery(channel: &dyn ConsumeChannel, queue: &str, delivery: &IncomingDelivery, sink: &dyn MetricsSink) {
    let retry_count = retry_count_header(delivery);

    if retry_count < MAX_REDELIVERIES {
        republish_with_incremented_retry_count(channel, queue, delivery, retry_count).await;
    } else {
        publish_to_dlq(channel, queue, delivery, sink).await;
    }

    if let Err(err) = channel.ack(delivery.delivery_tag).await {
        tracing::error!(queue, error = %err, "failed to ack failed delivery after routing");
    }
}

fn retry_count_header(delivery: &IncomingDelivery) -> i64 {
    delivery.headers.get(HEADER_RETRY_COUNT).and_then(|value| value.parse().ok()).unwrap_or(0)
}

async fn republish_with_incremented_retry_count(
    channel: &dyn ConsumeChannel,
    queue: &str,
    delivery: &IncomingDelivery,
    retry_count: i64,
) {
    let mut headers = delivery.headers.clone();
    headers.insert(HEADER_RETRY_COUNT.to_string(), (retry_count + 1).to_string());

    if let Err(err) = channel.republish(delivery, headers).await {
        tracing::error!(queue, error = %err, "failed to republish for retry");
    }
}

async fn publish_to_dlq(channel: &dyn ConsumeChannel, queue: &str, delivery: &IncomingDelivery, sink: &dyn MetricsSink) {
    let dlq = format!("{queue}.dlq");
    tracing::warn!(queue, dlq = %dlq, "routing to dead-letter queue after exhausting retries");
    sink.incr_dlq_route(queue);

    if let Err(err) = channel.route_to_dlq(&dlq, delivery).await {
        tracing::error!(queue, dlq = %dlq, error = %err, "failed to publish to dead-letter queue");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_threshold_is_four() {
        assert_eq!(MAX_REDELIVERIES, 4);
    }

    #[test]
    fn default_prefetch_sizing() {
        assert_eq!(DEFAULT_WORKERS, 5);
        assert_eq!(DEFAULT_PER_WORKER_PREFETCH, 10);
    }
}
