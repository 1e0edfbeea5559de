//! Domain model for stock, reservations, and the outbox.
//!
//! These types are shared by every component of the engine. The invariants
//! they document are enforced by the reservation coordinator (atomic
//! check-and-decrement), the reservation aggregate (state machine), and the
//! outbox relay (monotone status transitions).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::InventoryError;

/// Fixed reservation time-to-live. A reservation created at `t` expires at
/// `t + 15min` and becomes eligible for the safety-net scanner.
pub const RESERVATION_TTL_SECONDS: i64 = 15 * 60;

/// Minimum quantity a single reservation may hold.
pub const MIN_RESERVE_QUANTITY: u32 = 1;

/// Maximum quantity a single reservation may hold.
pub const MAX_RESERVE_QUANTITY: u32 = 10;

/// The fixed reservation TTL as a [`Duration`].
#[must_use]
pub fn reservation_ttl() -> Duration {
    Duration::seconds(RESERVATION_TTL_SECONDS)
}

/// Identifier of a product in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub String);

/// Identifier of a buyer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

/// Business identifier of a reservation. Stable across the fast store, the
/// durable store, and every published event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(pub String);

/// Identifier of an order, attached when a reservation is consumed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub String);

impl ProductId {
    /// Borrow the underlying string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ReservationId {
    /// Generate a fresh reservation id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("rsv-{}", Uuid::new_v4()))
    }

    /// Borrow the underlying string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProductId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A product's stock as held by the fast store.
///
/// The fast store owns this record; the durable store keeps no live ledger.
/// `quantity` never goes negative and is only decremented through the
/// coordinator's atomic reserve operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stock {
    /// Product this stock belongs to.
    pub product_id: ProductId,
    /// Currently available quantity.
    pub quantity: u32,
    /// Quantity the product was last stocked at (recovery base).
    pub initial_quantity: u32,
    /// Threshold below which a `stock.low` event is emitted.
    pub low_stock_threshold: u32,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// Durable snapshot of a product's stocking parameters.
///
/// Written on `SetStock` so the recovery manager has a durable base to derive
/// live quantity from: `initial_quantity − Σ active reserved quantities`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockSnapshot {
    /// Product this snapshot belongs to.
    pub product_id: ProductId,
    /// Quantity the product was stocked at.
    pub initial_quantity: u32,
    /// Threshold below which a `stock.low` event is emitted.
    pub low_stock_threshold: u32,
    /// When the snapshot was written.
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle state of a reservation.
///
/// `Reserved` is the only non-terminal state. No transition leaves a terminal
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// Stock is held; the holder may consume or release.
    Reserved,
    /// An order was created against the reservation. Terminal.
    Consumed,
    /// The holder (or a compensation path) gave the stock back. Terminal.
    Released,
    /// The scanner reclaimed a reservation whose holder never acted. Terminal.
    Expired,
}

impl ReservationStatus {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Consumed => "consumed",
            Self::Released => "released",
            Self::Expired => "expired",
        }
    }

    /// Parse the database string representation.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Serialization`] if the string doesn't match a
    /// known status.
    pub fn parse(s: &str) -> Result<Self, InventoryError> {
        match s {
            "reserved" => Ok(Self::Reserved),
            "consumed" => Ok(Self::Consumed),
            "released" => Ok(Self::Released),
            "expired" => Ok(Self::Expired),
            other => Err(InventoryError::Serialization(format!(
                "invalid reservation status: {other}"
            ))),
        }
    }

    /// Whether this status is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Reserved)
    }
}

/// A hold on stock, created atomically with the matching decrement.
///
/// A cached copy lives in the fast store with a TTL mirroring `expires_at`;
/// the durable copy (written asynchronously) is the system of record for
/// recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Business identifier.
    pub id: ReservationId,
    /// Product being held.
    pub product_id: ProductId,
    /// Buyer holding the stock.
    pub user_id: UserId,
    /// Units held, within [`MIN_RESERVE_QUANTITY`]..=[`MAX_RESERVE_QUANTITY`].
    pub quantity: u32,
    /// Current lifecycle state.
    pub status: ReservationStatus,
    /// When the hold was taken.
    pub reserved_at: DateTime<Utc>,
    /// `reserved_at + 15min`, the scanner-eligibility boundary.
    pub expires_at: DateTime<Utc>,
    /// Set when the reservation was consumed.
    pub consumed_at: Option<DateTime<Utc>>,
    /// Set when the reservation was released or expired.
    pub released_at: Option<DateTime<Utc>>,
    /// Order created against this reservation, if consumed.
    pub order_id: Option<OrderId>,
}

impl Reservation {
    /// Create a new reservation in the `Reserved` state at `reserved_at`,
    /// with the fixed TTL applied.
    #[must_use]
    pub fn new(
        id: ReservationId,
        product_id: ProductId,
        user_id: UserId,
        quantity: u32,
        reserved_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            product_id,
            user_id,
            quantity,
            status: ReservationStatus::Reserved,
            reserved_at,
            expires_at: reserved_at + reservation_ttl(),
            consumed_at: None,
            released_at: None,
            order_id: None,
        }
    }

    /// Whether the reservation's TTL has elapsed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left until expiry at `now`. Negative once expired.
    #[must_use]
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }
}

/// Delivery state of an outbox row.
///
/// Status is monotone: `Pending`/`Retry` move to `Sent` (success, terminal)
/// or to `Failed` once the retry ceiling is reached (terminal, manual
/// intervention required). Rows are never auto-deleted except `Sent` rows
/// past the retention window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Staged, not yet attempted.
    Pending,
    /// At least one attempt failed; scheduled for another.
    Retry,
    /// Delivered to the bus. Terminal.
    Sent,
    /// Retry ceiling exhausted. Terminal; requires manual resolution.
    Failed,
}

impl OutboxStatus {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retry => "retry",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    /// Parse the database string representation.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Serialization`] if the string doesn't match a
    /// known status.
    pub fn parse(s: &str) -> Result<Self, InventoryError> {
        match s {
            "pending" => Ok(Self::Pending),
            "retry" => Ok(Self::Retry),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(InventoryError::Serialization(format!(
                "invalid outbox status: {other}"
            ))),
        }
    }
}

/// A domain event staged for relay, before it has a surrogate id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboxEvent {
    /// Kind of aggregate the event describes (`reservation` or `stock`).
    pub aggregate_type: String,
    /// Business id of that aggregate.
    pub aggregate_id: String,
    /// Wire event type, e.g. `stock.reserved`.
    pub event_type: String,
    /// Idempotency key carried to consumers.
    pub event_id: Uuid,
    /// JSON payload as published.
    pub payload: serde_json::Value,
}

/// A durably staged domain event with relay bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEvent {
    /// Surrogate row id.
    pub id: i64,
    /// Kind of aggregate the event describes.
    pub aggregate_type: String,
    /// Business id of that aggregate.
    pub aggregate_id: String,
    /// Wire event type.
    pub event_type: String,
    /// Idempotency key carried to consumers.
    pub event_id: Uuid,
    /// JSON payload as published.
    pub payload: serde_json::Value,
    /// Delivery state.
    pub status: OutboxStatus,
    /// Delivery attempts so far.
    pub retry_count: i32,
    /// Most recent delivery error, if any.
    pub last_error: Option<String>,
    /// Earliest time the relay may retry this row.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// When the row was staged.
    pub created_at: DateTime<Utc>,
    /// When the row reached a terminal state.
    pub processed_at: Option<DateTime<Utc>>,
}
