//! Store abstractions: the seams between the engine and its two stores.
//!
//! The **fast store** (Redis in production) owns live stock and cached
//! reservations and is the sole arbiter of per-product concurrency: its
//! atomic scripted operations linearize all reserve/release calls on the same
//! product, so no in-process lock exists anywhere in the engine.
//!
//! The **durable store** (Postgres in production) is the system of record:
//! reservations are upserted asynchronously by the persistence worker, outbox
//! rows are staged synchronously on the request path, and recovery derives
//! live stock from stock snapshots plus active reservations.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::InventoryError;
use crate::model::{
    NewOutboxEvent, OrderId, OutboxEvent, ProductId, Reservation, ReservationId,
    ReservationStatus, Stock, StockSnapshot,
};

/// The low-latency store on the hot reservation path.
///
/// `reserve` and `release` are the coordinator's atomic primitives: each is a
/// single indivisible server-side operation with no partial effect on
/// failure.
#[async_trait]
pub trait FastStore: Send + Sync {
    /// Overwrite a product's stock record.
    async fn put_stock(&self, stock: &Stock) -> Result<(), InventoryError>;

    /// Read a product's stock record.
    async fn get_stock(&self, product_id: &ProductId) -> Result<Option<Stock>, InventoryError>;

    /// Atomically check-and-decrement stock and create the reservation record
    /// (with a TTL equal to time until `expires_at`) in one indivisible step.
    /// Returns the new quantity.
    ///
    /// # Errors
    ///
    /// [`InventoryError::InsufficientStock`] if the check fails (no side
    /// effects), [`InventoryError::StockNotFound`] if the product has no
    /// stock record, [`InventoryError::FastStore`] on infrastructure failure.
    async fn reserve(&self, reservation: &Reservation) -> Result<u32, InventoryError>;

    /// Atomically increment stock by `quantity` and delete the reservation
    /// record. If the record is already gone (TTL-evicted) this degrades to a
    /// plain increment, which keeps the operation idempotent. Returns the new
    /// quantity.
    async fn release(
        &self,
        product_id: &ProductId,
        reservation_id: &ReservationId,
        quantity: u32,
    ) -> Result<u32, InventoryError>;

    /// Read a cached reservation record.
    async fn get_reservation(
        &self,
        reservation_id: &ReservationId,
    ) -> Result<Option<Reservation>, InventoryError>;

    /// Re-materialize a reservation record with an explicit TTL (recovery
    /// path; bypasses the stock decrement).
    async fn put_reservation(
        &self,
        reservation: &Reservation,
        ttl: Duration,
    ) -> Result<(), InventoryError>;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), InventoryError>;

    /// Whether any stock record exists (recovery emptiness probe).
    async fn has_stock_records(&self) -> Result<bool, InventoryError>;
}

/// Durable reservation records plus the stock snapshots recovery derives from.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Idempotently upsert a batch of reservations keyed by business id.
    /// Per-item failures are logged and skipped; returns the number written.
    async fn upsert_batch(&self, reservations: &[Reservation]) -> Result<usize, InventoryError>;

    /// Read a durable reservation.
    async fn get(&self, id: &ReservationId) -> Result<Option<Reservation>, InventoryError>;

    /// Move a reservation to a terminal status, stamping the matching
    /// timestamp column (and `order_id` when consumed).
    async fn update_status(
        &self,
        id: &ReservationId,
        status: ReservationStatus,
        at: DateTime<Utc>,
        order_id: Option<&OrderId>,
    ) -> Result<(), InventoryError>;

    /// All reservations currently in the `Reserved` state (recovery input).
    async fn list_active(&self) -> Result<Vec<Reservation>, InventoryError>;

    /// `Reserved` rows whose `expires_at` lies in `[now - window, now]`,
    /// oldest first, capped at `limit` (scanner input; the bounded window
    /// keeps scan cost constant).
    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        window: Duration,
        limit: usize,
    ) -> Result<Vec<Reservation>, InventoryError>;

    /// Write the durable stocking snapshot for a product.
    async fn upsert_stock_snapshot(&self, snapshot: &StockSnapshot) -> Result<(), InventoryError>;

    /// All stock snapshots (recovery input).
    async fn list_stock_snapshots(&self) -> Result<Vec<StockSnapshot>, InventoryError>;
}

/// Durably staged domain events awaiting relay to the bus.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Stage events as `Pending` rows. This write is the request path's
    /// durability boundary: once it returns, the events will eventually reach
    /// the bus.
    async fn enqueue(&self, events: &[NewOutboxEvent]) -> Result<(), InventoryError>;

    /// `Pending` rows plus `Retry` rows whose `next_retry_at` has passed,
    /// ordered by creation time, capped at `limit`.
    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, InventoryError>;

    /// Mark a row delivered.
    async fn mark_sent(&self, id: i64, at: DateTime<Utc>) -> Result<(), InventoryError>;

    /// Record a failed attempt and schedule the next one.
    async fn mark_retry(
        &self,
        id: i64,
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), InventoryError>;

    /// Mark a row dead after the retry ceiling. Requires manual resolution;
    /// the row is never deleted automatically.
    async fn mark_failed(&self, id: i64, at: DateTime<Utc>, error: &str)
    -> Result<(), InventoryError>;

    /// Delete `Sent` rows processed before `cutoff`. Returns rows deleted.
    async fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64, InventoryError>;

    /// Look up a staged event by its idempotency key (admin/debug surface).
    async fn get_by_event_id(&self, event_id: Uuid)
    -> Result<Option<OutboxEvent>, InventoryError>;
}
