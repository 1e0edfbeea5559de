//! Boot-time recovery of fast-store state from the durable store.
//!
//! The fast store is a cache with authority over concurrency, not over
//! truth. After it loses its data the durable store can rebuild it: live
//! quantity is derived as `initial_quantity − Σ active unexpired reserved`,
//! and unexpired reservations are re-materialized with their remaining TTL.
//! Reservations found already past their TTL are expired here rather than
//! waiting a scanner pass.
//!
//! Because reservations are persisted asynchronously, a crash can lose the
//! tail of the persistence queue; derivation then overcounts stock by at most
//! that tail, and the overcount heals within one TTL as the phantom holds
//! never get consumed.

use chrono::{DateTime, Utc};
use souk_core::InventoryError;
use souk_core::environment::Clock;
use souk_core::event::StockEvent;
use souk_core::model::{ProductId, Reservation, ReservationStatus, Stock};
use souk_core::stores::{FastStore, OutboxStore, ReservationStore};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// How much rebuilding a recovery pass performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryKind {
    /// Fast store already had stock records; derived state was only compared
    /// against it and drift logged.
    Verify,
    /// Fast store was empty; stock and reservations were rebuilt from the
    /// durable store.
    Full,
}

/// Summary of one recovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Which mode ran.
    pub kind: RecoveryKind,
    /// Stock snapshots considered.
    pub products: usize,
    /// Reservations re-materialized into the fast store.
    pub rematerialized: usize,
    /// Reservations found past their TTL and expired.
    pub expired: usize,
    /// Products whose cached quantity disagreed with the derived one
    /// (verify mode only).
    pub drift: usize,
}

/// Rebuilds or verifies fast-store state on boot.
pub struct RecoveryManager {
    fast: Arc<dyn FastStore>,
    reservations: Arc<dyn ReservationStore>,
    outbox: Arc<dyn OutboxStore>,
    clock: Arc<dyn Clock>,
}

impl RecoveryManager {
    /// Wire the manager to its stores.
    #[must_use]
    pub fn new(
        fast: Arc<dyn FastStore>,
        reservations: Arc<dyn ReservationStore>,
        outbox: Arc<dyn OutboxStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            fast,
            reservations,
            outbox,
            clock,
        }
    }

    /// Run one recovery pass, picking verify or full mode from whether the
    /// fast store holds any stock records.
    ///
    /// # Errors
    ///
    /// Store errors; per-reservation re-materialization failures are logged
    /// and skipped instead.
    pub async fn run(&self) -> Result<RecoveryReport, InventoryError> {
        let kind = if self.fast.has_stock_records().await? {
            RecoveryKind::Verify
        } else {
            RecoveryKind::Full
        };
        self.run_as(kind).await
    }

    /// Run one recovery pass in a forced mode, bypassing the fast-store
    /// probe. Full mode rebuilds the cache even when it holds records.
    ///
    /// # Errors
    ///
    /// Same as [`run`](Self::run).
    pub async fn run_as(&self, kind: RecoveryKind) -> Result<RecoveryReport, InventoryError> {
        let now = self.clock.now();
        let snapshots = self.reservations.list_stock_snapshots().await?;
        let active = self.reservations.list_active().await?;

        let (live, lapsed): (Vec<_>, Vec<_>) = active
            .into_iter()
            .partition(|reservation| !reservation.is_expired(now));

        let mut held: HashMap<ProductId, u32> = HashMap::new();
        for reservation in &live {
            *held.entry(reservation.product_id.clone()).or_insert(0) += reservation.quantity;
        }

        let mut report = RecoveryReport {
            kind,
            products: snapshots.len(),
            rematerialized: 0,
            expired: 0,
            drift: 0,
        };

        for snapshot in &snapshots {
            let held_quantity = held.get(&snapshot.product_id).copied().unwrap_or(0);
            let derived = snapshot.initial_quantity.saturating_sub(held_quantity);
            match kind {
                RecoveryKind::Full => {
                    self.fast
                        .put_stock(&Stock {
                            product_id: snapshot.product_id.clone(),
                            quantity: derived,
                            initial_quantity: snapshot.initial_quantity,
                            low_stock_threshold: snapshot.low_stock_threshold,
                            updated_at: now,
                        })
                        .await?;
                }
                RecoveryKind::Verify => {
                    if let Some(cached) = self.fast.get_stock(&snapshot.product_id).await? {
                        if cached.quantity != derived {
                            report.drift += 1;
                            metrics::counter!("inventory.recovery.drift").increment(1);
                            warn!(
                                product_id = %snapshot.product_id,
                                cached = cached.quantity,
                                derived,
                                "Stock drift between fast store and derivation"
                            );
                        }
                    }
                }
            }
        }

        if kind == RecoveryKind::Full {
            for reservation in &live {
                let ttl = reservation.remaining_ttl(now);
                match self.fast.put_reservation(reservation, ttl).await {
                    Ok(()) => report.rematerialized += 1,
                    Err(e) => warn!(
                        reservation_id = %reservation.id,
                        error = %e,
                        "Reservation re-materialization failed"
                    ),
                }
            }
        }

        for reservation in lapsed {
            match self.expire_lapsed(reservation, now, kind).await {
                Ok(()) => report.expired += 1,
                Err(e) => warn!(error = %e, "Lapsed reservation expiry failed during recovery"),
            }
        }

        info!(
            kind = ?report.kind,
            products = report.products,
            rematerialized = report.rematerialized,
            expired = report.expired,
            drift = report.drift,
            "Recovery pass complete"
        );
        Ok(report)
    }

    /// Expire a reservation whose TTL lapsed while the engine was down.
    ///
    /// In full mode the derivation already excluded the hold, so only the
    /// durable status and the event trail need fixing. In verify mode the
    /// surviving cached quantity still carries the hold and must be given
    /// back.
    async fn expire_lapsed(
        &self,
        reservation: Reservation,
        now: DateTime<Utc>,
        kind: RecoveryKind,
    ) -> Result<(), InventoryError> {
        let event = StockEvent::Released {
            reservation_id: reservation.id.clone(),
            product_id: reservation.product_id.clone(),
            quantity: reservation.quantity,
        };
        self.outbox.enqueue(&[event.into_outbox()]).await?;
        // Terminal status before the credit: a repeated pass must not find
        // the row still reserved once the stock has been given back.
        self.reservations
            .update_status(&reservation.id, ReservationStatus::Expired, now, None)
            .await?;
        if kind == RecoveryKind::Verify {
            self.fast
                .release(&reservation.product_id, &reservation.id, reservation.quantity)
                .await?;
        }
        Ok(())
    }
}
