//! Event bus abstraction.
//!
//! The engine treats the bus as a black-box publish/subscribe primitive:
//! events are durably staged in the outbox first, then relayed here with
//! at-least-once semantics. Subscribers must be idempotent — the `event_id`
//! in event metadata is the deduplication key.
//!
//! # Topic naming
//!
//! Topics follow the pattern `{aggregate-type}-events`:
//! - `stock-events` — published by this engine
//! - `order-events`, `product-events` — consumed from upstream services
//!
//! # Implementations
//!
//! - `KafkaEventBus` (souk-inventory) — production, Kafka-compatible
//! - `InMemoryEventBus` (souk-testing) — fast, synchronous, capturing

use crate::event::SerializedEvent;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the event bus.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an event to a topic.
    #[error("publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed.
        topic: String,
        /// The reason for failure.
        reason: String,
    },

    /// Failed to subscribe to topics.
    #[error("subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe.
        topics: Vec<String>,
        /// The reason for failure.
        reason: String,
    },

    /// Failed to decode an event from the wire.
    #[error("deserialization failed: {0}")]
    DeserializationFailed(String),
}

/// Stream of events delivered to a subscriber.
///
/// Yields `Err` for events that arrived but could not be decoded; the stream
/// itself stays alive so one poison message cannot stall a consumer.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<SerializedEvent, EventBusError>> + Send>>;

/// Publish/subscribe capability for cross-service events.
///
/// Delivery is at-least-once: an event may reach a subscriber more than once,
/// and no global ordering is guaranteed across topics or retries.
pub trait EventBus: Send + Sync {
    /// Publish an event to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the publish operation
    /// fails; the caller (the outbox relay) schedules a retry.
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Subscribe to one or more topics and receive a stream of events.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails;
    /// consumers retry with a delay.
    fn subscribe(
        &self,
        topics: &[String],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>>;
}
