//! Reservation aggregate: the store-agnostic state machine.
//!
//! Wraps a [`Reservation`] and enforces its lifecycle: born `Reserved`,
//! moving to exactly one of the terminal states `Consumed`, `Released`, or
//! `Expired`. Every transition appends a domain event to an in-memory buffer
//! that the service drains only after the outbox write is confirmed — so no
//! event can be dropped between aggregate mutation and outbox persistence
//! within a request.

use chrono::{DateTime, Utc};
use souk_core::InventoryError;
use souk_core::event::StockEvent;
use souk_core::model::{
    MAX_RESERVE_QUANTITY, MIN_RESERVE_QUANTITY, OrderId, ProductId, Reservation, ReservationId,
    ReservationStatus, UserId,
};

/// A reservation plus its buffer of not-yet-persisted domain events.
#[derive(Debug, Clone)]
pub struct ReservationAggregate {
    reservation: Reservation,
    pending_events: Vec<StockEvent>,
}

impl ReservationAggregate {
    /// Create a new reservation in the `Reserved` state, recording the
    /// `stock.reserved` event.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::InvalidQuantity`] when `quantity` is outside
    /// 1..=10 and [`InventoryError::EmptyId`] when an identifier is blank.
    pub fn create(
        id: ReservationId,
        product_id: ProductId,
        user_id: UserId,
        quantity: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, InventoryError> {
        if product_id.as_str().trim().is_empty() {
            return Err(InventoryError::EmptyId("product"));
        }
        if user_id.0.trim().is_empty() {
            return Err(InventoryError::EmptyId("user"));
        }
        if !(MIN_RESERVE_QUANTITY..=MAX_RESERVE_QUANTITY).contains(&quantity) {
            return Err(InventoryError::InvalidQuantity {
                requested: quantity,
            });
        }

        let reservation = Reservation::new(id, product_id, user_id, quantity, now);
        let created = StockEvent::Reserved {
            reservation_id: reservation.id.clone(),
            product_id: reservation.product_id.clone(),
            user_id: reservation.user_id.clone(),
            quantity: reservation.quantity,
        };
        Ok(Self {
            reservation,
            pending_events: vec![created],
        })
    }

    /// Wrap an existing reservation (loaded from a store) with an empty
    /// event buffer.
    #[must_use]
    pub const fn from_existing(reservation: Reservation) -> Self {
        Self {
            reservation,
            pending_events: Vec::new(),
        }
    }

    /// The underlying reservation.
    #[must_use]
    pub const fn reservation(&self) -> &Reservation {
        &self.reservation
    }

    /// Give up the aggregate, keeping the reservation.
    #[must_use]
    pub fn into_reservation(self) -> Reservation {
        self.reservation
    }

    /// Events recorded since the buffer was last cleared.
    #[must_use]
    pub fn pending_events(&self) -> &[StockEvent] {
        &self.pending_events
    }

    /// Drop buffered events. Call only after the outbox write is confirmed.
    pub fn clear_events(&mut self) {
        self.pending_events.clear();
    }

    /// Mark the reservation consumed by `order_id`.
    ///
    /// # Errors
    ///
    /// [`InventoryError::InvalidTransition`] unless currently `Reserved`;
    /// [`InventoryError::ReservationExpired`] if the TTL elapsed first.
    pub fn consume(&mut self, order_id: OrderId, now: DateTime<Utc>) -> Result<(), InventoryError> {
        if self.reservation.status != ReservationStatus::Reserved {
            return Err(InventoryError::InvalidTransition {
                from: self.reservation.status,
                attempted: "consume",
            });
        }
        if self.reservation.is_expired(now) {
            return Err(InventoryError::ReservationExpired {
                reservation_id: self.reservation.id.clone(),
            });
        }

        self.reservation.status = ReservationStatus::Consumed;
        self.reservation.consumed_at = Some(now);
        self.reservation.order_id = Some(order_id.clone());
        self.pending_events.push(StockEvent::Consumed {
            reservation_id: self.reservation.id.clone(),
            product_id: self.reservation.product_id.clone(),
            order_id,
        });
        Ok(())
    }

    /// Release the reservation, giving its stock back.
    ///
    /// Idempotency against double release is handled one layer up: the
    /// service treats "reservation not found" as already-released. Here a
    /// release from a terminal state is simply rejected.
    ///
    /// # Errors
    ///
    /// [`InventoryError::InvalidTransition`] unless currently `Reserved`.
    pub fn release(&mut self, now: DateTime<Utc>) -> Result<(), InventoryError> {
        if self.reservation.status != ReservationStatus::Reserved {
            return Err(InventoryError::InvalidTransition {
                from: self.reservation.status,
                attempted: "release",
            });
        }

        self.reservation.status = ReservationStatus::Released;
        self.reservation.released_at = Some(now);
        self.pending_events.push(StockEvent::Released {
            reservation_id: self.reservation.id.clone(),
            product_id: self.reservation.product_id.clone(),
            quantity: self.reservation.quantity,
        });
        Ok(())
    }

    /// Mark the reservation expired (scanner path). Emits the same
    /// `stock.released` fact as an explicit release — consumers care that
    /// the stock came back, not who returned it.
    ///
    /// # Errors
    ///
    /// [`InventoryError::InvalidTransition`] unless currently `Reserved`.
    pub fn mark_expired(&mut self, now: DateTime<Utc>) -> Result<(), InventoryError> {
        if self.reservation.status != ReservationStatus::Reserved {
            return Err(InventoryError::InvalidTransition {
                from: self.reservation.status,
                attempted: "expire",
            });
        }

        self.reservation.status = ReservationStatus::Expired;
        self.reservation.released_at = Some(now);
        self.pending_events.push(StockEvent::Released {
            reservation_id: self.reservation.id.clone(),
            product_id: self.reservation.product_id.clone(),
            quantity: self.reservation.quantity,
        });
        Ok(())
    }
}
