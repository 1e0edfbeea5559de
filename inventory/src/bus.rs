//! Kafka-compatible event bus.
//!
//! Works against Kafka, Redpanda, or any broker speaking the Kafka protocol.
//! Delivery is at-least-once with manual offset commits: an offset is
//! committed only after the event reached the subscriber's channel, so a
//! crash in between redelivers rather than drops. Events are JSON on the
//! wire, keyed by aggregate id so per-aggregate ordering survives
//! partitioning.

use futures::StreamExt;
use rdkafka::Message;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use souk_core::event::SerializedEvent;
use souk_core::event_bus::{EventBus, EventBusError, EventStream};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Kafka-backed [`EventBus`].
pub struct KafkaEventBus {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    consumer_group: Option<String>,
    buffer_size: usize,
    auto_offset_reset: String,
}

impl KafkaEventBus {
    /// Create a bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be
    /// created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a builder for custom configuration.
    #[must_use]
    pub fn builder() -> KafkaEventBusBuilder {
        KafkaEventBusBuilder::default()
    }

    fn message_key(event: &SerializedEvent) -> String {
        event
            .metadata
            .as_ref()
            .and_then(|m| m.get("aggregate_id"))
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| event.event_type.clone(), str::to_owned)
    }
}

/// Builder for a [`KafkaEventBus`].
#[derive(Default)]
pub struct KafkaEventBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl KafkaEventBusBuilder {
    /// Comma-separated broker addresses.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgment mode: `"0"`, `"1"`, or `"all"`. Default `"all"`.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Producer send timeout. Default 5s.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Explicit consumer group. Defaults to a name derived from the
    /// subscribed topics.
    #[must_use]
    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }

    /// Subscriber channel capacity. Default 1000.
    #[must_use]
    pub const fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Where a new consumer group starts reading (`"earliest"` / `"latest"`).
    /// Default `"latest"`.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the bus.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if brokers are unset or
    /// the producer cannot be created.
    pub fn build(self) -> Result<KafkaEventBus, EventBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| EventBusError::ConnectionFailed("brokers not configured".to_string()))?;

        let acks = self.producer_acks.unwrap_or_else(|| "all".to_string());
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", &acks)
            .create()
            .map_err(|e| {
                EventBusError::ConnectionFailed(format!("failed to create producer: {e}"))
            })?;

        info!(brokers = %brokers, acks = %acks, "Kafka event bus created");
        Ok(KafkaEventBus {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            consumer_group: self.consumer_group,
            buffer_size: self.buffer_size.unwrap_or(1000),
            auto_offset_reset: self.auto_offset_reset.unwrap_or_else(|| "latest".to_string()),
        })
    }
}

impl EventBus for KafkaEventBus {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let event = event.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let payload =
                serde_json::to_vec(&event).map_err(|e| EventBusError::PublishFailed {
                    topic: topic.clone(),
                    reason: format!("failed to encode event: {e}"),
                })?;
            let key = Self::message_key(&event);
            let record = FutureRecord::to(&topic).payload(&payload).key(&key);

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    debug!(
                        topic = %topic,
                        partition,
                        offset,
                        event_type = %event.event_type,
                        "Event published"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => Err(EventBusError::PublishFailed {
                    topic,
                    reason: kafka_error.to_string(),
                }),
            }
        })
    }

    fn subscribe(
        &self,
        topics: &[String],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let topics = topics.to_vec();
        let brokers = self.brokers.clone();
        let consumer_group = self.consumer_group.clone();
        let buffer_size = self.buffer_size;
        let auto_offset_reset = self.auto_offset_reset.clone();

        Box::pin(async move {
            let group_id = consumer_group.unwrap_or_else(|| {
                let mut sorted = topics.clone();
                sorted.sort();
                format!("souk-inventory-{}", sorted.join("-"))
            });

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("failed to subscribe: {e}"),
                })?;

            info!(topics = ?topics, consumer_group = %group_id, "Subscribed to topics");

            let (tx, rx) = tokio::sync::mpsc::channel(buffer_size);

            // The spawned task owns the consumer; offsets are committed only
            // after the event was handed to the channel.
            tokio::spawn(async move {
                let mut stream = consumer.stream();
                while let Some(message_result) = stream.next().await {
                    match message_result {
                        Ok(message) => {
                            let decoded = message.payload().map_or_else(
                                || {
                                    Err(EventBusError::DeserializationFailed(
                                        "message has no payload".to_string(),
                                    ))
                                },
                                |payload| {
                                    serde_json::from_slice::<SerializedEvent>(payload).map_err(
                                        |e| {
                                            EventBusError::DeserializationFailed(format!(
                                                "failed to decode event: {e}"
                                            ))
                                        },
                                    )
                                },
                            );
                            if let Ok(event) = &decoded {
                                trace!(
                                    topic = message.topic(),
                                    offset = message.offset(),
                                    event_type = %event.event_type,
                                    "Received event"
                                );
                            }
                            if tx.send(decoded).await.is_err() {
                                // Receiver dropped; exit without committing.
                                break;
                            }
                            if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                                warn!(
                                    topic = message.topic(),
                                    offset = message.offset(),
                                    error = %e,
                                    "Offset commit failed, message may be redelivered"
                                );
                            }
                        }
                        Err(e) => {
                            let err = EventBusError::ConnectionFailed(format!(
                                "failed to receive message: {e}"
                            ));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                debug!("Consumer task exiting");
            });

            let stream = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            Ok(Box::pin(stream) as EventStream)
        })
    }
}
