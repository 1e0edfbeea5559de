//! Inbound event consumption: upstream order and product lifecycle events.
//!
//! `EventConsumer` owns the subscribe-process-reconnect loop; handlers own
//! the domain reaction. Upstream delivery is at-least-once, so every handler
//! here is idempotent — a redelivered `order.cancelled` hits the release
//! path's double-release no-op, and a redelivered product lifecycle event
//! overwrites the mirror with the same value.

use crate::mirror::{ProductActivityMirror, ProductLifecycle};
use crate::service::InventoryService;
use async_trait::async_trait;
use futures::StreamExt;
use souk_core::InventoryError;
use souk_core::event::SerializedEvent;
use souk_core::event_bus::EventBus;
use souk_core::model::{ProductId, ReservationId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A domain reaction to one inbound event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle a single event. Unknown event types must be ignored, not
    /// rejected: topics carry more types than any one handler cares about.
    async fn handle(&self, event: &SerializedEvent) -> Result<(), InventoryError>;
}

/// Generic consumer: subscribes to topics, feeds events to a handler, and
/// reconnects with a fixed delay when the stream or subscription fails.
/// Handler errors are logged and the stream continues.
pub struct EventConsumer {
    name: String,
    topics: Vec<String>,
    bus: Arc<dyn EventBus>,
    handler: Arc<dyn EventHandler>,
    retry_delay: Duration,
}

impl EventConsumer {
    /// Create a consumer with the default 5s reconnect delay.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        topics: Vec<String>,
        bus: Arc<dyn EventBus>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            topics,
            bus,
            handler,
            retry_delay: Duration::from_secs(5),
        }
    }

    /// Override the reconnect delay.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Spawn the consume loop as a background task.
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(consumer = %self.name, topics = ?self.topics, "Event consumer started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(consumer = %self.name, "Event consumer stopping");
                    break;
                }
                subscribed = self.bus.subscribe(&self.topics) => {
                    match subscribed {
                        Ok(stream) => {
                            info!(consumer = %self.name, "Subscribed");
                            self.process_stream(stream, &mut shutdown).await;
                            warn!(
                                consumer = %self.name,
                                "Event stream ended, reconnecting in {:?}",
                                self.retry_delay
                            );
                        }
                        Err(e) => {
                            error!(
                                consumer = %self.name,
                                error = %e,
                                "Subscription failed, retrying in {:?}",
                                self.retry_delay
                            );
                        }
                    }
                    tokio::select! {
                        _ = shutdown.recv() => {
                            info!(consumer = %self.name, "Event consumer stopping");
                            break;
                        }
                        () = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
            }
        }
    }

    async fn process_stream(
        &self,
        mut stream: souk_core::event_bus::EventStream,
        shutdown: &mut broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                next = stream.next() => {
                    match next {
                        Some(Ok(event)) => {
                            metrics::counter!("inventory.consumer.received").increment(1);
                            if let Err(e) = self.handler.handle(&event).await {
                                error!(
                                    consumer = %self.name,
                                    event_type = %event.event_type,
                                    error = %e,
                                    "Handler failed, continuing"
                                );
                            }
                        }
                        Some(Err(e)) => {
                            error!(consumer = %self.name, error = %e, "Stream error, continuing");
                        }
                        None => return,
                    }
                }
            }
        }
    }
}

/// Reacts to upstream order lifecycle: a cancelled order releases its
/// reservation's stock.
pub struct OrderEventHandler {
    service: Arc<InventoryService>,
}

impl OrderEventHandler {
    /// Create a handler over the service.
    #[must_use]
    pub const fn new(service: Arc<InventoryService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventHandler for OrderEventHandler {
    async fn handle(&self, event: &SerializedEvent) -> Result<(), InventoryError> {
        if event.event_type != "order.cancelled" {
            return Ok(());
        }
        let reservation_id = event
            .require_str("reservation_id")
            .map_err(|e| InventoryError::Serialization(e.to_string()))?;
        debug!(%reservation_id, "Order cancelled, releasing reservation");
        self.service
            .release(&ReservationId(reservation_id))
            .await
            .map(|_| ())
    }
}

/// Keeps the product activity mirror in step with catalog lifecycle events.
pub struct ProductEventHandler {
    mirror: Arc<ProductActivityMirror>,
}

impl ProductEventHandler {
    /// Create a handler over the mirror.
    #[must_use]
    pub const fn new(mirror: Arc<ProductActivityMirror>) -> Self {
        Self { mirror }
    }
}

#[async_trait]
impl EventHandler for ProductEventHandler {
    async fn handle(&self, event: &SerializedEvent) -> Result<(), InventoryError> {
        let Some(lifecycle) = ProductLifecycle::from_event_type(&event.event_type) else {
            return Ok(());
        };
        let product_id = event
            .require_str("product_id")
            .map_err(|e| InventoryError::Serialization(e.to_string()))?;
        self.mirror.apply(ProductId(product_id), lifecycle);
        Ok(())
    }
}
