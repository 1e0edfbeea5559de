//! Inventory service: the orchestrator on the request path.
//!
//! Every operation follows the same shape: validation, atomic fast-store
//! step, synchronous outbox staging. The fast store is the concurrency
//! arbiter; the outbox write is the durability boundary — a reservation
//! whose events failed to stage is compensated (released) rather than left
//! half-committed. Only the accepted reservation rides the asynchronous
//! persistence queue; terminal transitions (release, consume, expire) write
//! the durable row before returning, so a repeat call or a scanner pass
//! never acts on a stale reserved status.

use crate::aggregate::ReservationAggregate;
use crate::mirror::ProductActivityMirror;
use crate::persistence::PersistenceQueue;
use crate::recovery::{RecoveryKind, RecoveryManager, RecoveryReport};
use souk_core::InventoryError;
use souk_core::environment::Clock;
use souk_core::event::StockEvent;
use souk_core::model::{
    OrderId, ProductId, Reservation, ReservationId, ReservationStatus, Stock, StockSnapshot,
    UserId,
};
use souk_core::stores::{FastStore, OutboxStore, ReservationStore};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Result of an accepted reserve call.
#[derive(Debug, Clone)]
pub struct ReserveOutcome {
    /// The reservation that now holds the stock.
    pub reservation: Reservation,
    /// Quantity remaining after the decrement.
    pub remaining: u32,
}

/// The inventory engine's operation surface.
pub struct InventoryService {
    fast: Arc<dyn FastStore>,
    reservations: Arc<dyn ReservationStore>,
    outbox: Arc<dyn OutboxStore>,
    persistence: PersistenceQueue,
    mirror: Arc<ProductActivityMirror>,
    clock: Arc<dyn Clock>,
}

impl InventoryService {
    /// Wire the service to its stores and collaborators.
    #[must_use]
    pub fn new(
        fast: Arc<dyn FastStore>,
        reservations: Arc<dyn ReservationStore>,
        outbox: Arc<dyn OutboxStore>,
        persistence: PersistenceQueue,
        mirror: Arc<ProductActivityMirror>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            fast,
            reservations,
            outbox,
            persistence,
            mirror,
            clock,
        }
    }

    /// Set a product's stock level, overwriting any previous record.
    ///
    /// Writes the fast-store record and the durable stocking snapshot the
    /// recovery manager derives from. Both writes must succeed.
    ///
    /// # Errors
    ///
    /// [`InventoryError::EmptyId`] for a blank product id; store errors
    /// otherwise.
    #[instrument(skip(self), fields(product_id = %product_id))]
    pub async fn set_stock(
        &self,
        product_id: ProductId,
        quantity: u32,
        low_stock_threshold: u32,
    ) -> Result<Stock, InventoryError> {
        if product_id.as_str().trim().is_empty() {
            return Err(InventoryError::EmptyId("product"));
        }
        let now = self.clock.now();
        let stock = Stock {
            product_id: product_id.clone(),
            quantity,
            initial_quantity: quantity,
            low_stock_threshold,
            updated_at: now,
        };
        self.fast.put_stock(&stock).await?;
        self.reservations
            .upsert_stock_snapshot(&StockSnapshot {
                product_id,
                initial_quantity: quantity,
                low_stock_threshold,
                updated_at: now,
            })
            .await?;

        info!(quantity, low_stock_threshold, "Stock set");
        Ok(stock)
    }

    /// Reserve stock for a user.
    ///
    /// The decrement and the reservation record are created in one atomic
    /// fast-store step, then the `stock.reserved` event is staged in the
    /// outbox. If staging fails the reservation is compensated — released
    /// back — so stock is never held without a durable event trail.
    ///
    /// # Errors
    ///
    /// Validation errors from the aggregate, [`InventoryError::ProductNotActive`],
    /// [`InventoryError::InsufficientStock`], [`InventoryError::StockNotFound`],
    /// or store errors.
    #[instrument(skip(self), fields(product_id = %product_id, user_id = %user_id))]
    pub async fn reserve(
        &self,
        product_id: ProductId,
        user_id: UserId,
        quantity: u32,
    ) -> Result<ReserveOutcome, InventoryError> {
        // Validation first: a malformed request is reported as such even
        // when the product is also inactive.
        let now = self.clock.now();
        let mut aggregate = ReservationAggregate::create(
            ReservationId::generate(),
            product_id,
            user_id,
            quantity,
            now,
        )?;

        if !self.mirror.is_active(&aggregate.reservation().product_id) {
            metrics::counter!("inventory.reserve.rejected").increment(1);
            return Err(InventoryError::ProductNotActive {
                product_id: aggregate.reservation().product_id.clone(),
            });
        }

        let remaining = match self.fast.reserve(aggregate.reservation()).await {
            Ok(remaining) => remaining,
            Err(e) => {
                metrics::counter!("inventory.reserve.rejected").increment(1);
                return Err(e);
            }
        };

        let events: Vec<_> = aggregate
            .pending_events()
            .iter()
            .cloned()
            .map(StockEvent::into_outbox)
            .collect();
        if let Err(e) = self.outbox.enqueue(&events).await {
            // Durability boundary not reached: give the stock back.
            self.compensate_reserve(aggregate.reservation()).await;
            metrics::counter!("inventory.reserve.rejected").increment(1);
            return Err(e);
        }
        aggregate.clear_events();

        let reservation = aggregate.into_reservation();
        self.enqueue_persistence(reservation.clone()).await;
        self.stage_threshold_events(&reservation.product_id, remaining)
            .await;

        metrics::counter!("inventory.reserve.accepted").increment(1);
        info!(
            reservation_id = %reservation.id,
            quantity,
            remaining,
            "Reservation accepted"
        );
        Ok(ReserveOutcome {
            reservation,
            remaining,
        })
    }

    /// Release a reservation, returning its stock.
    ///
    /// Idempotent: a reservation missing from both stores, or already in a
    /// terminal state, is treated as released and the call succeeds without
    /// touching stock. Returns the quantity now available, when known.
    ///
    /// # Errors
    ///
    /// Store errors only; double release is not an error.
    #[instrument(skip(self), fields(reservation_id = %reservation_id))]
    pub async fn release(
        &self,
        reservation_id: &ReservationId,
    ) -> Result<Option<u32>, InventoryError> {
        let Some(reservation) = self.load_reservation(reservation_id).await? else {
            debug!("Release of unknown reservation, treating as already released");
            return Ok(None);
        };
        if reservation.status.is_terminal() {
            debug!(status = reservation.status.as_str(), "Release is a no-op");
            return Ok(None);
        }

        let now = self.clock.now();
        let mut aggregate = ReservationAggregate::from_existing(reservation);
        aggregate.release(now)?;

        let events: Vec<_> = aggregate
            .pending_events()
            .iter()
            .cloned()
            .map(StockEvent::into_outbox)
            .collect();
        self.outbox.enqueue(&events).await?;
        aggregate.clear_events();

        // The terminal row is written synchronously, not through the
        // persistence queue: a repeat call must find it before crediting,
        // or the increment below runs once per retry.
        let reservation = aggregate.into_reservation();
        self.reservations.upsert_batch(&[reservation.clone()]).await?;

        // The increment is idempotent against TTL eviction of the cached
        // record, so this is safe even when the hold already lapsed.
        let remaining = self
            .fast
            .release(&reservation.product_id, &reservation.id, reservation.quantity)
            .await?;

        metrics::counter!("inventory.release").increment(1);
        info!(remaining, "Reservation released");
        Ok(Some(remaining))
    }

    /// Consume a reservation into an order.
    ///
    /// Stock stays decremented; the reservation leaves the scanner's reach by
    /// moving to the terminal `Consumed` state.
    ///
    /// # Errors
    ///
    /// [`InventoryError::ReservationNotFound`], [`InventoryError::ReservationExpired`],
    /// [`InventoryError::InvalidTransition`], or store errors.
    #[instrument(skip(self), fields(reservation_id = %reservation_id, order_id = %order_id))]
    pub async fn consume(
        &self,
        reservation_id: &ReservationId,
        order_id: OrderId,
    ) -> Result<Reservation, InventoryError> {
        let reservation = self.load_reservation(reservation_id).await?.ok_or_else(|| {
            InventoryError::ReservationNotFound {
                reservation_id: reservation_id.clone(),
            }
        })?;

        let now = self.clock.now();
        let mut aggregate = ReservationAggregate::from_existing(reservation);
        aggregate.consume(order_id, now)?;

        let events: Vec<_> = aggregate
            .pending_events()
            .iter()
            .cloned()
            .map(StockEvent::into_outbox)
            .collect();
        self.outbox.enqueue(&events).await?;
        aggregate.clear_events();

        let reservation = aggregate.into_reservation();
        // The terminal row lands durably before the call returns, so a
        // scanner pass at the TTL edge cannot still see the hold as reserved
        // and give back stock the sale kept.
        self.reservations.upsert_batch(&[reservation.clone()]).await?;
        // Refresh the cached copy so reads see the terminal state until the
        // TTL evicts it.
        let ttl = reservation.remaining_ttl(now).max(chrono::Duration::seconds(1));
        if let Err(e) = self.fast.put_reservation(&reservation, ttl).await {
            warn!(error = %e, "Cached reservation refresh failed after consume");
        }

        metrics::counter!("inventory.consume").increment(1);
        info!("Reservation consumed");
        Ok(reservation)
    }

    /// Expire a reservation on the scanner's behalf, returning its stock.
    ///
    /// The durable status is written synchronously here — the scanner must
    /// not re-select the same row on its next pass.
    ///
    /// # Errors
    ///
    /// [`InventoryError::InvalidTransition`] if the reservation reached a
    /// terminal state since it was selected; store errors otherwise.
    #[instrument(skip(self, reservation), fields(reservation_id = %reservation.id))]
    pub async fn expire(&self, reservation: Reservation) -> Result<(), InventoryError> {
        let now = self.clock.now();
        let mut aggregate = ReservationAggregate::from_existing(reservation);
        aggregate.mark_expired(now)?;
        let reservation = aggregate.reservation().clone();

        let events: Vec<_> = aggregate
            .pending_events()
            .iter()
            .cloned()
            .map(StockEvent::into_outbox)
            .collect();
        self.outbox.enqueue(&events).await?;

        // Terminal status precedes the credit: once the stock is given back
        // the row must be invisible to the next scanner pass. A failure
        // after this point under-counts until recovery; it never re-credits.
        self.reservations
            .update_status(&reservation.id, ReservationStatus::Expired, now, None)
            .await?;

        self.fast
            .release(&reservation.product_id, &reservation.id, reservation.quantity)
            .await?;

        metrics::counter!("inventory.expired").increment(1);
        info!(quantity = reservation.quantity, "Reservation expired, stock reclaimed");
        Ok(())
    }

    /// Run a recovery pass in an operator-chosen mode.
    ///
    /// `Full` rebuilds the fast store from durable state even when it holds
    /// records; `Verify` only reports drift. The automatic boot-time pass
    /// picks its own mode; this is the administrative override.
    ///
    /// # Errors
    ///
    /// Store errors from the pass.
    pub async fn trigger_recovery(
        &self,
        kind: RecoveryKind,
    ) -> Result<RecoveryReport, InventoryError> {
        let manager = RecoveryManager::new(
            self.fast.clone(),
            self.reservations.clone(),
            self.outbox.clone(),
            self.clock.clone(),
        );
        manager.run_as(kind).await
    }

    /// Read a product's live stock.
    ///
    /// # Errors
    ///
    /// Fast-store errors only; a missing record is `Ok(None)`.
    pub async fn get_stock(&self, product_id: &ProductId) -> Result<Option<Stock>, InventoryError> {
        self.fast.get_stock(product_id).await
    }

    /// Read a reservation, preferring the cached copy.
    ///
    /// # Errors
    ///
    /// Store errors only; a missing reservation is `Ok(None)`.
    pub async fn get_reservation(
        &self,
        reservation_id: &ReservationId,
    ) -> Result<Option<Reservation>, InventoryError> {
        self.load_reservation(reservation_id).await
    }

    /// Cached copy first, durable copy as fallback (covers TTL eviction and
    /// fast-store restarts).
    async fn load_reservation(
        &self,
        reservation_id: &ReservationId,
    ) -> Result<Option<Reservation>, InventoryError> {
        if let Some(reservation) = self.fast.get_reservation(reservation_id).await? {
            return Ok(Some(reservation));
        }
        self.reservations.get(reservation_id).await
    }

    async fn compensate_reserve(&self, reservation: &Reservation) {
        match self
            .fast
            .release(&reservation.product_id, &reservation.id, reservation.quantity)
            .await
        {
            Ok(_) => warn!(
                reservation_id = %reservation.id,
                "Outbox staging failed, reservation compensated"
            ),
            // Both the outbox and the compensation failed: the scanner
            // reclaims the orphaned hold after the TTL.
            Err(e) => warn!(
                reservation_id = %reservation.id,
                error = %e,
                "Compensating release failed, TTL will reclaim the hold"
            ),
        }
    }

    async fn enqueue_persistence(&self, reservation: Reservation) {
        if let Err(e) = self.persistence.enqueue(reservation).await {
            // The outbox row already guarantees the event trail; the durable
            // reservation row catches up through recovery.
            warn!(error = %e, "Persistence enqueue failed");
        }
    }

    /// Stage `stock.depleted` / `stock.low` after an accepted reserve. Off
    /// the critical path: failures are logged, never surfaced to the caller.
    async fn stage_threshold_events(&self, product_id: &ProductId, remaining: u32) {
        let threshold = match self.fast.get_stock(product_id).await {
            Ok(Some(stock)) => stock.low_stock_threshold,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Threshold check skipped");
                return;
            }
        };

        let event = if remaining == 0 {
            Some(StockEvent::Depleted {
                product_id: product_id.clone(),
            })
        } else if remaining <= threshold {
            Some(StockEvent::Low {
                product_id: product_id.clone(),
                quantity: remaining,
                threshold,
            })
        } else {
            None
        };

        if let Some(event) = event {
            let event_type = event.event_type();
            if let Err(e) = self.outbox.enqueue(&[event.into_outbox()]).await {
                warn!(event_type, error = %e, "Threshold event staging failed");
            }
        }
    }
}
