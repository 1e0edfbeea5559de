//! Domain events published by the inventory engine.
//!
//! Events are facts about stock movement, staged durably in the outbox and
//! relayed to the bus with at-least-once semantics. Consumers deduplicate on
//! the `event_id` carried in metadata.
//!
//! # Wire format
//!
//! Payloads are flat JSON objects (stored as JSONB in the outbox, published
//! verbatim) so operators can inspect stuck rows without tooling:
//!
//! ```json
//! { "reservation_id": "rsv-…", "product_id": "p1", "user_id": "u1", "quantity": 3 }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{NewOutboxEvent, OrderId, ProductId, ReservationId, UserId};

/// Topic carrying the engine's outbound `stock.*` events.
pub const TOPIC_STOCK_EVENTS: &str = "stock-events";

/// Topic carrying upstream order lifecycle events (consumed).
pub const TOPIC_ORDER_EVENTS: &str = "order-events";

/// Topic carrying upstream product lifecycle events (consumed).
pub const TOPIC_PRODUCT_EVENTS: &str = "product-events";

/// Error raised when an event cannot be encoded or decoded.
#[derive(Error, Debug)]
pub enum EventError {
    /// The payload was structurally valid JSON but missing expected fields.
    #[error("malformed {event_type} payload: {reason}")]
    MalformedPayload {
        /// The event type being decoded.
        event_type: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The event type is not part of a known contract.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
}

/// A fact about stock movement, as recorded in the outbox and published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockEvent {
    /// Stock was atomically decremented and a reservation created.
    Reserved {
        /// The new reservation.
        reservation_id: ReservationId,
        /// Product the stock was taken from.
        product_id: ProductId,
        /// Buyer holding the reservation.
        user_id: UserId,
        /// Units held.
        quantity: u32,
    },
    /// A reservation gave its stock back (explicit release or expiry).
    Released {
        /// The released reservation.
        reservation_id: ReservationId,
        /// Product the stock returned to.
        product_id: ProductId,
        /// Units returned.
        quantity: u32,
    },
    /// An order was created against a reservation.
    Consumed {
        /// The consumed reservation.
        reservation_id: ReservationId,
        /// Product the reservation held.
        product_id: ProductId,
        /// The order that consumed it.
        order_id: OrderId,
    },
    /// A reserve operation drove available stock to zero.
    Depleted {
        /// The depleted product.
        product_id: ProductId,
    },
    /// Available stock dropped below the configured threshold.
    Low {
        /// The product running low.
        product_id: ProductId,
        /// Quantity remaining.
        quantity: u32,
        /// The configured threshold.
        threshold: u32,
    },
}

impl StockEvent {
    /// Wire event type, stable across versions of the engine.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Reserved { .. } => "stock.reserved",
            Self::Released { .. } => "stock.released",
            Self::Consumed { .. } => "stock.consumed",
            Self::Depleted { .. } => "stock.depleted",
            Self::Low { .. } => "stock.low",
        }
    }

    /// Kind of aggregate the event describes.
    #[must_use]
    pub const fn aggregate_type(&self) -> &'static str {
        match self {
            Self::Reserved { .. } | Self::Released { .. } | Self::Consumed { .. } => "reservation",
            Self::Depleted { .. } | Self::Low { .. } => "stock",
        }
    }

    /// Business id of the aggregate the event describes.
    #[must_use]
    pub fn aggregate_id(&self) -> String {
        match self {
            Self::Reserved { reservation_id, .. }
            | Self::Released { reservation_id, .. }
            | Self::Consumed { reservation_id, .. } => reservation_id.0.clone(),
            Self::Depleted { product_id } | Self::Low { product_id, .. } => product_id.0.clone(),
        }
    }

    /// Flat JSON payload as published on the wire.
    #[must_use]
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::Reserved {
                reservation_id,
                product_id,
                user_id,
                quantity,
            } => json!({
                "reservation_id": reservation_id,
                "product_id": product_id,
                "user_id": user_id,
                "quantity": quantity,
            }),
            Self::Released {
                reservation_id,
                product_id,
                quantity,
            } => json!({
                "reservation_id": reservation_id,
                "product_id": product_id,
                "quantity": quantity,
            }),
            Self::Consumed {
                reservation_id,
                product_id,
                order_id,
            } => json!({
                "reservation_id": reservation_id,
                "product_id": product_id,
                "order_id": order_id,
            }),
            Self::Depleted { product_id } => json!({ "product_id": product_id }),
            Self::Low {
                product_id,
                quantity,
                threshold,
            } => json!({
                "product_id": product_id,
                "quantity": quantity,
                "threshold": threshold,
            }),
        }
    }

    /// Stage this event as an outbox row with a fresh idempotency key.
    #[must_use]
    pub fn into_outbox(self) -> NewOutboxEvent {
        NewOutboxEvent {
            aggregate_type: self.aggregate_type().to_string(),
            aggregate_id: self.aggregate_id(),
            event_type: self.event_type().to_string(),
            event_id: Uuid::new_v4(),
            payload: self.payload(),
        }
    }
}

/// An event as it travels over the bus: a wire type, a JSON payload, and
/// optional metadata (notably the `event_id` consumers deduplicate on).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedEvent {
    /// Wire event type, e.g. `stock.reserved` or `order.cancelled`.
    pub event_type: String,
    /// Flat JSON payload.
    pub payload: serde_json::Value,
    /// Optional metadata (`event_id`, `published_at`, …).
    pub metadata: Option<serde_json::Value>,
}

impl SerializedEvent {
    /// Create a new serialized event.
    #[must_use]
    pub const fn new(
        event_type: String,
        payload: serde_json::Value,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_type,
            payload,
            metadata,
        }
    }

    /// Extract a required string field from the payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::MalformedPayload`] if the field is absent or not
    /// a string.
    pub fn require_str(&self, field: &str) -> Result<String, EventError> {
        self.payload
            .get(field)
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| EventError::MalformedPayload {
                event_type: self.event_type.clone(),
                reason: format!("missing string field `{field}`"),
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn wire_types_match_contract() {
        let event = StockEvent::Reserved {
            reservation_id: ReservationId("rsv-1".into()),
            product_id: ProductId("p1".into()),
            user_id: UserId("u1".into()),
            quantity: 3,
        };
        assert_eq!(event.event_type(), "stock.reserved");
        assert_eq!(event.aggregate_type(), "reservation");
        assert_eq!(event.aggregate_id(), "rsv-1");

        let payload = event.payload();
        assert_eq!(payload["product_id"], "p1");
        assert_eq!(payload["quantity"], 3);
    }

    #[test]
    fn depleted_is_keyed_by_product() {
        let event = StockEvent::Depleted {
            product_id: ProductId("p9".into()),
        };
        assert_eq!(event.aggregate_type(), "stock");
        assert_eq!(event.aggregate_id(), "p9");
    }

    #[test]
    fn outbox_staging_assigns_event_id() {
        let a = StockEvent::Depleted {
            product_id: ProductId("p1".into()),
        }
        .into_outbox();
        let b = StockEvent::Depleted {
            product_id: ProductId("p1".into()),
        }
        .into_outbox();
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(a.event_type, "stock.depleted");
    }

    #[test]
    fn require_str_rejects_missing_fields() {
        let event = SerializedEvent::new(
            "order.cancelled".to_string(),
            json!({ "reservation_id": "rsv-1" }),
            None,
        );
        assert_eq!(event.require_str("reservation_id").unwrap(), "rsv-1");
        assert!(event.require_str("order_id").is_err());
    }
}
