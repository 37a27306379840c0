//! Broker seam (CA5 test support).
//!
//! [`Publisher`](crate::publisher::Publisher) and
//! [`ConsumerPool`](crate::consumer::ConsumerPool) talk to these two narrow
//! traits instead of `lapin::Channel` directly. Real usage gets the
//! `impl ... for lapin::Channel` below for free via unsized coercion;
//! integration tests substitute [`fake::FakeBroker`], an in-process double
//! with no network I/O, the same way [`crate::clock::Clock`] and
//! [`crate::sleeper::Sleeper`] are swapped out for deterministic tests.

use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;

/// Whether the broker accepted or rejected a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ack,
    Nack,
}

impl Ack {
    pub fn is_ack(self) -> bool {
        matches!(self, Ack::Ack)
    }
}

/// A delivery handed to a [`MessageHandler`](crate::consumer::MessageHandler),
/// decoupled from `lapin::message::Delivery` so consumers never touch `lapin`
/// types directly.
#[derive(Debug, Clone)]
pub struct IncomingDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
}

pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<IncomingDelivery, lapin::Error>> + Send>>;

/// The publish half of the seam: select confirms, publish, and await the
/// confirmation as one call so callers only need a single timeout around it.
#[async_trait]
pub trait PublishChannel: Send + Sync {
    async fn publish_and_confirm(
        &self,
        exchange: &str,
        routing_key: &str,
        correlation_id: &str,
        headers: HashMap<String, String>,
        persistent: bool,
        body: &[u8],
    ) -> Result<Ack, lapin::Error>;
}

/// The consume half of the seam: QoS, the delivery stream, acking, and the
/// retry/DLQ republish paths the consumer pool needs.
#[async_trait]
pub trait ConsumeChannel: Send + Sync {
    async fn set_qos(&self, prefetch: u16) -> Result<(), lapin::Error>;
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, lapin::Error>;
    async fn ack(&self, delivery_tag: u64) -> Result<(), lapin::Error>;
    async fn republish(
        &self,
        original: &IncomingDelivery,
        headers: HashMap<String, String>,
    ) -> Result<(), lapin::Error>;
    async fn route_to_dlq(&self, dlq: &str, original: &IncomingDelivery) -> Result<(), lapin::Error>;
}

fn headers_field_table(headers: &HashMap<String, String>) -> lapin::types::FieldTable {
    let mut table = lapin::types::FieldTable::default();
    for (key, value) in headers {
        table.insert(key.as_str().into(), lapin::types::AMQPValue::LongString(value.clone().into()));
    }
    table
}

fn headers_from_properties(properties: &lapin::BasicProperties) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            let value = match value {
                lapin::types::AMQPValue::LongString(s) => Some(s.to_string()),
                lapin::types::AMQPValue::LongLongInt(n) => Some(n.to_string()),
                lapin::types::AMQPValue::LongInt(n) => Some(n.to_string()),
                lapin::types::AMQPValue::ShortInt(n) => Some(n.to_string()),
                _ => None,
            };
            if let Some(value) = value {
                headers.insert(key.to_string(), value);
            }
        }
    }
    headers
}

#[async_trait]
impl PublishChannel for lapin::Channel {
    async fn publish_and_confirm(
        &self,
        exchange: &str,
        routing_key: &str,
        correlation_id: &str,
        headers: HashMap<String, String>,
        persistent: bool,
        body: &[u8],
    ) -> Result<Ack, lapin::Error> {
        self.confirm_select(lapin::options::ConfirmSelectOptions::default()).await?;

        let mut properties = lapin::BasicProperties::default()
            .with_content_type("application/json".into())
            .with_correlation_id(correlation_id.to_string().into())
            .with_headers(headers_field_table(&headers));
        if persistent {
            properties = properties.with_delivery_mode(2);
        }

        let confirm = self
            .basic_publish(exchange, routing_key, lapin::options::BasicPublishOptions::default(), body, properties)
            .await?;

        let confirmation = confirm.await?;
        Ok(if confirmation.is_ack() { Ack::Ack } else { Ack::Nack })
    }
}

#[async_trait]
impl ConsumeChannel for lapin::Channel {
    async fn set_qos(&self, prefetch: u16) -> Result<(), lapin::Error> {
        self.basic_qos(prefetch, lapin::options::BasicQosOptions::default()).await
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, lapin::Error> {
        let consumer = self
            .basic_consume(
                queue,
                "",
                lapin::options::BasicConsumeOptions { no_ack: false, ..Default::default() },
                lapin::types::FieldTable::default(),
            )
            .await?;

        let stream = consumer.into_stream().map(|item| {
            item.map(|delivery| IncomingDelivery {
                delivery_tag: delivery.delivery_tag,
                exchange: delivery.exchange.to_string(),
                routing_key: delivery.routing_key.to_string(),
                body: delivery.data.clone(),
                headers: headers_from_properties(&delivery.properties),
            })
        });
        Ok(Box::pin(stream))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), lapin::Error> {
        self.basic_ack(delivery_tag, lapin::options::BasicAckOptions::default()).await
    }

    async fn republish(
        &self,
        original: &IncomingDelivery,
        headers: HashMap<String, String>,
    ) -> Result<(), lapin::Error> {
        let properties = lapin::BasicProperties::default()
            .with_delivery_mode(2)
            .with_headers(headers_field_table(&headers));
        self.basic_publish(
            &original.exchange,
            &original.routing_key,
            lapin::options::BasicPublishOptions::default(),
            &original.body,
            properties,
        )
        .await
        .map(|_| ())
    }

    async fn route_to_dlq(&self, dlq: &str, original: &IncomingDelivery) -> Result<(), lapin::Error> {
        let properties = lapin::BasicProperties::default()
            .with_delivery_mode(2)
            .with_headers(headers_field_table(&original.headers));
        self.basic_publish("", dlq, lapin::options::BasicPublishOptions::default(), &original.body, properties)
            .await
            .map(|_| ())
    }
}

/// In-process broker double for integration tests (CA5). Gated the same way
/// [`crate::telemetry::test_support`] gates `MemorySink`.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use futures_util::stream;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    pub struct FakeMessage {
        pub body: Vec<u8>,
        pub headers: HashMap<String, String>,
        pub correlation_id: String,
        pub persistent: bool,
    }

    #[derive(Default)]
    struct Queues {
        queues: HashMap<String, VecDeque<FakeMessage>>,
    }

    /// Publish and consume share the same in-memory queues, keyed by routing
    /// key, so S1/S3-style scenarios can be driven end to end without a
    /// broker connection.
    #[derive(Clone, Default)]
    pub struct FakeBroker {
        state: Arc<Mutex<Queues>>,
    }

    impl FakeBroker {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn queue_depth(&self, queue: &str) -> usize {
            self.state.lock().unwrap().queues.get(queue).map(VecDeque::len).unwrap_or(0)
        }

        pub fn last_message(&self, queue: &str) -> Option<FakeMessage> {
            self.state.lock().unwrap().queues.get(queue).and_then(|q| q.back().cloned())
        }

        fn enqueue(&self, queue: &str, message: FakeMessage) {
            self.state.lock().unwrap().queues.entry(queue.to_string()).or_default().push_back(message);
        }

        fn dequeue(&self, queue: &str) -> Option<FakeMessage> {
            self.state.lock().unwrap().queues.get_mut(queue).and_then(VecDeque::pop_front)
        }
    }

    #[async_trait]
    impl PublishChannel for FakeBroker {
        async fn publish_and_confirm(
            &self,
            _exchange: &str,
            routing_key: &str,
            correlation_id: &str,
            headers: HashMap<String, String>,
            persistent: bool,
            body: &[u8],
        ) -> Result<Ack, lapin::Error> {
            self.enqueue(
                routing_key,
                FakeMessage { body: body.to_vec(), headers, correlation_id: correlation_id.to_string(), persistent },
            );
            Ok(Ack::Ack)
        }
    }

    #[async_trait]
    impl ConsumeChannel for FakeBroker {
        async fn set_qos(&self, _prefetch: u16) -> Result<(), lapin::Error> {
            Ok(())
        }

        async fn consume(&self, queue: &str) -> Result<DeliveryStream, lapin::Error> {
            let broker = self.clone();
            let queue = queue.to_string();
            let stream = stream::unfold((broker, queue, 0u64), |(broker, queue, mut tag)| async move {
                loop {
                    if let Some(message) = broker.dequeue(&queue) {
                        tag += 1;
                        let delivery = IncomingDelivery {
                            delivery_tag: tag,
                            exchange: String::new(),
                            routing_key: queue.clone(),
                            body: message.body,
                            headers: message.headers,
                        };
                        return Some((Ok(delivery), (broker, queue, tag)));
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
            });
            Ok(Box::pin(stream))
        }

        async fn ack(&self, _delivery_tag: u64) -> Result<(), lapin::Error> {
            Ok(())
        }

        async fn republish(
            &self,
            original: &IncomingDelivery,
            headers: HashMap<String, String>,
        ) -> Result<(), lapin::Error> {
            self.enqueue(
                &original.routing_key,
                FakeMessage { body: original.body.clone(), headers, correlation_id: String::new(), persistent: true },
            );
            Ok(())
        }

        async fn route_to_dlq(&self, dlq: &str, original: &IncomingDelivery) -> Result<(), lapin::Error> {
            self.enqueue(
                dlq,
                FakeMessage {
                    body: original.body.clone(),
                    headers: original.headers.clone(),
                    correlation_id: String::new(),
                    persistent: true,
                },
            );
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn publish_then_consume_round_trips_through_the_same_queue() {
            let broker = FakeBroker::new();
            broker
                .publish_and_confirm("e1", "k1", "corr-1", HashMap::new(), true, b"{\"x\":1}")
                .await
                .unwrap();
            assert_eq!(broker.queue_depth("k1"), 1);

            let mut stream = broker.consume("k1").await.unwrap();
            let delivery = stream.next().await.unwrap().unwrap();
            assert_eq!(delivery.body, b"{\"x\":1}");
            assert_eq!(broker.queue_depth("k1"), 0);
        }
    }
}
