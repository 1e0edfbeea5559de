//! Asynchronous durable persistence of reservations.
//!
//! The reserve path never waits on Postgres: accepted reservations are pushed
//! onto a bounded in-process queue and a worker batches them to the durable
//! store, flushing when the batch fills or the interval fires, whichever
//! comes first. Queue admission blocks when the buffer is full — backpressure
//! surfaces as caller-visible slowdown instead of unbounded memory growth or
//! dropped writes.
//!
//! The queue is not write-ahead-logged: entries accepted but not yet flushed
//! are lost on a crash. The recovery manager's derivation tolerates the
//! resulting bounded stock overcount, and the scanner reconciles it within
//! one TTL.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use souk_core::InventoryError;
use souk_core::model::{
    OrderId, Reservation, ReservationId, ReservationStatus, StockSnapshot,
};
use souk_core::stores::ReservationStore;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Postgres-backed durable reservation store.
pub struct PgReservationStore {
    pool: PgPool,
}

impl PgReservationStore {
    /// Create a store over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_reservation(row: &sqlx::postgres::PgRow) -> Result<Reservation, InventoryError> {
        let status_str: String = row.get("status");
        let quantity: i32 = row.get("quantity");
        Ok(Reservation {
            id: ReservationId(row.get("id")),
            product_id: souk_core::model::ProductId(row.get("product_id")),
            user_id: souk_core::model::UserId(row.get("user_id")),
            quantity: u32::try_from(quantity)
                .map_err(|_| InventoryError::Serialization("negative quantity".into()))?,
            status: ReservationStatus::parse(&status_str)?,
            reserved_at: row.get("reserved_at"),
            expires_at: row.get("expires_at"),
            consumed_at: row.get("consumed_at"),
            released_at: row.get("released_at"),
            order_id: row.get::<Option<String>, _>("order_id").map(OrderId),
        })
    }
}

#[async_trait]
impl ReservationStore for PgReservationStore {
    /// Status transitions are monotone: a row in a terminal state is never
    /// overwritten, so a queued reserved-state write flushing after a
    /// synchronous release cannot resurrect the hold.
    async fn upsert_batch(&self, reservations: &[Reservation]) -> Result<usize, InventoryError> {
        let mut written = 0;
        for reservation in reservations {
            let result = sqlx::query(
                r"
                INSERT INTO reservations (
                    id, product_id, user_id, quantity, status,
                    reserved_at, expires_at, consumed_at, released_at, order_id
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (id) DO UPDATE SET
                    status = EXCLUDED.status,
                    consumed_at = EXCLUDED.consumed_at,
                    released_at = EXCLUDED.released_at,
                    order_id = EXCLUDED.order_id
                WHERE reservations.status = 'reserved'
                ",
            )
            .bind(reservation.id.as_str())
            .bind(reservation.product_id.as_str())
            .bind(&reservation.user_id.0)
            .bind(i32::try_from(reservation.quantity).unwrap_or(i32::MAX))
            .bind(reservation.status.as_str())
            .bind(reservation.reserved_at)
            .bind(reservation.expires_at)
            .bind(reservation.consumed_at)
            .bind(reservation.released_at)
            .bind(reservation.order_id.as_ref().map(|o| o.0.as_str()))
            .execute(&self.pool)
            .await;

            // Per-item failures are skipped so the rest of the batch lands.
            match result {
                Ok(_) => written += 1,
                Err(e) => warn!(
                    reservation_id = %reservation.id,
                    error = %e,
                    "Skipping reservation in batch write"
                ),
            }
        }
        Ok(written)
    }

    async fn get(&self, id: &ReservationId) -> Result<Option<Reservation>, InventoryError> {
        let row = sqlx::query(
            r"
            SELECT id, product_id, user_id, quantity, status,
                   reserved_at, expires_at, consumed_at, released_at, order_id
            FROM reservations
            WHERE id = $1
            ",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| InventoryError::DurableStore(e.to_string()))?;

        row.as_ref().map(Self::row_to_reservation).transpose()
    }

    async fn update_status(
        &self,
        id: &ReservationId,
        status: ReservationStatus,
        at: DateTime<Utc>,
        order_id: Option<&OrderId>,
    ) -> Result<(), InventoryError> {
        let (consumed_at, released_at) = match status {
            ReservationStatus::Consumed => (Some(at), None),
            ReservationStatus::Released | ReservationStatus::Expired => (None, Some(at)),
            ReservationStatus::Reserved => (None, None),
        };
        sqlx::query(
            r"
            UPDATE reservations
            SET status = $1,
                consumed_at = COALESCE($2, consumed_at),
                released_at = COALESCE($3, released_at),
                order_id = COALESCE($4, order_id)
            WHERE id = $5
            ",
        )
        .bind(status.as_str())
        .bind(consumed_at)
        .bind(released_at)
        .bind(order_id.map(|o| o.0.as_str()))
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| InventoryError::DurableStore(e.to_string()))?;
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<Reservation>, InventoryError> {
        let rows = sqlx::query(
            r"
            SELECT id, product_id, user_id, quantity, status,
                   reserved_at, expires_at, consumed_at, released_at, order_id
            FROM reservations
            WHERE status = 'reserved'
            ",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| InventoryError::DurableStore(e.to_string()))?;

        rows.iter().map(Self::row_to_reservation).collect()
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        window: ChronoDuration,
        limit: usize,
    ) -> Result<Vec<Reservation>, InventoryError> {
        #[allow(clippy::cast_possible_wrap)]
        let rows = sqlx::query(
            r"
            SELECT id, product_id, user_id, quantity, status,
                   reserved_at, expires_at, consumed_at, released_at, order_id
            FROM reservations
            WHERE status = 'reserved' AND expires_at <= $1 AND expires_at >= $2
            ORDER BY expires_at ASC
            LIMIT $3
            ",
        )
        .bind(now)
        .bind(now - window)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| InventoryError::DurableStore(e.to_string()))?;

        rows.iter().map(Self::row_to_reservation).collect()
    }

    async fn upsert_stock_snapshot(&self, snapshot: &StockSnapshot) -> Result<(), InventoryError> {
        sqlx::query(
            r"
            INSERT INTO stock_snapshots (product_id, initial_quantity, low_stock_threshold, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (product_id) DO UPDATE SET
                initial_quantity = EXCLUDED.initial_quantity,
                low_stock_threshold = EXCLUDED.low_stock_threshold,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(snapshot.product_id.as_str())
        .bind(i32::try_from(snapshot.initial_quantity).unwrap_or(i32::MAX))
        .bind(i32::try_from(snapshot.low_stock_threshold).unwrap_or(i32::MAX))
        .bind(snapshot.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| InventoryError::DurableStore(e.to_string()))?;
        Ok(())
    }

    async fn list_stock_snapshots(&self) -> Result<Vec<StockSnapshot>, InventoryError> {
        let rows = sqlx::query(
            r"
            SELECT product_id, initial_quantity, low_stock_threshold, updated_at
            FROM stock_snapshots
            ",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| InventoryError::DurableStore(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let initial: i32 = row.get("initial_quantity");
                let threshold: i32 = row.get("low_stock_threshold");
                Ok(StockSnapshot {
                    product_id: souk_core::model::ProductId(row.get("product_id")),
                    initial_quantity: u32::try_from(initial).unwrap_or(0),
                    low_stock_threshold: u32::try_from(threshold).unwrap_or(0),
                    updated_at: row.get("updated_at"),
                })
            })
            .collect()
    }
}

/// Producer handle onto the bounded persistence queue.
#[derive(Clone)]
pub struct PersistenceQueue {
    sender: mpsc::Sender<Reservation>,
}

impl PersistenceQueue {
    /// Enqueue a reservation for durable persistence.
    ///
    /// Blocks while the queue is full — deliberate backpressure on the
    /// caller rather than dropping the write.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::DurableStore`] if the worker has shut down.
    pub async fn enqueue(&self, reservation: Reservation) -> Result<(), InventoryError> {
        self.sender
            .send(reservation)
            .await
            .map_err(|_| InventoryError::DurableStore("persistence worker stopped".into()))
    }
}

/// Batching worker draining the persistence queue to the durable store.
pub struct PersistenceWorker {
    receiver: mpsc::Receiver<Reservation>,
    store: Arc<dyn ReservationStore>,
    batch_size: usize,
    flush_interval: Duration,
}

impl PersistenceWorker {
    /// Create the queue/worker pair. The queue holds `capacity` entries;
    /// size it at several multiples of `batch_size` to absorb bursts.
    #[must_use]
    pub fn channel(
        store: Arc<dyn ReservationStore>,
        batch_size: usize,
        flush_interval: Duration,
        capacity: usize,
    ) -> (PersistenceQueue, Self) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            PersistenceQueue { sender },
            Self {
                receiver,
                store,
                batch_size,
                flush_interval,
            },
        )
    }

    /// Spawn the worker loop as a background task.
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            batch_size = self.batch_size,
            flush_interval_ms = self.flush_interval.as_millis() as u64,
            "Persistence worker started"
        );
        let mut batch: Vec<Reservation> = Vec::with_capacity(self.batch_size);
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = self.receiver.recv() => {
                    match received {
                        Some(reservation) => {
                            batch.push(reservation);
                            if batch.len() >= self.batch_size {
                                Self::flush(&*self.store, &mut batch).await;
                            }
                        }
                        None => {
                            // All producers dropped.
                            Self::flush(&*self.store, &mut batch).await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        Self::flush(&*self.store, &mut batch).await;
                    }
                }
                _ = shutdown.recv() => {
                    // Drain whatever is immediately available, then flush the
                    // partial batch before exiting.
                    while let Ok(reservation) = self.receiver.try_recv() {
                        batch.push(reservation);
                    }
                    Self::flush(&*self.store, &mut batch).await;
                    info!("Persistence worker stopping");
                    break;
                }
            }
        }
    }

    async fn flush(store: &dyn ReservationStore, batch: &mut Vec<Reservation>) {
        if batch.is_empty() {
            return;
        }
        let size = batch.len();
        match store.upsert_batch(batch).await {
            Ok(written) => {
                metrics::counter!("inventory.persistence.flushed").increment(written as u64);
                debug!(size, written, "Flushed reservation batch");
            }
            // Eventually consistent by design: log and keep going, the
            // recovery derivation tolerates the gap.
            Err(e) => warn!(size, error = %e, "Reservation batch write failed"),
        }
        batch.clear();
    }
}
