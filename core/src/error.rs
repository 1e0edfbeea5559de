//! Error taxonomy for the inventory engine.
//!
//! Errors fall into the layers the service boundary distinguishes:
//!
//! - **Validation**: rejected synchronously, no state change
//! - **Business rule**: surfaced to the caller, never retried
//! - **Infrastructure**: fail-fast on the synchronous path (atomicity means
//!   no partial effect), retried or logged-and-skipped on async paths

use thiserror::Error;

use crate::model::{ProductId, ReservationId, ReservationStatus};

/// Errors produced by inventory operations.
#[derive(Error, Debug)]
pub enum InventoryError {
    /// Requested quantity is outside the allowed per-reservation bounds.
    #[error("quantity {requested} outside allowed range 1..=10")]
    InvalidQuantity {
        /// The out-of-range quantity.
        requested: u32,
    },

    /// A required identifier was empty.
    #[error("empty {0} identifier")]
    EmptyId(&'static str),

    /// Not enough stock to satisfy the reservation. No side effects occurred.
    #[error("insufficient stock for {product_id}: {available} available, {requested} requested")]
    InsufficientStock {
        /// The contended product.
        product_id: ProductId,
        /// Quantity available at decision time.
        available: u32,
        /// Quantity that was requested.
        requested: u32,
    },

    /// The product has no stock record in the fast store.
    #[error("no stock record for {product_id}")]
    StockNotFound {
        /// The unknown product.
        product_id: ProductId,
    },

    /// The product activity mirror marks the product as not reservable.
    #[error("product {product_id} is not active")]
    ProductNotActive {
        /// The inactive product.
        product_id: ProductId,
    },

    /// No reservation with this id is known.
    #[error("reservation {reservation_id} not found")]
    ReservationNotFound {
        /// The unknown reservation.
        reservation_id: ReservationId,
    },

    /// A transition was attempted from a terminal state.
    #[error("cannot {attempted} reservation in state {from:?}")]
    InvalidTransition {
        /// State the reservation was in.
        from: ReservationStatus,
        /// The rejected transition.
        attempted: &'static str,
    },

    /// The reservation's TTL elapsed before the transition.
    #[error("reservation {reservation_id} has expired")]
    ReservationExpired {
        /// The expired reservation.
        reservation_id: ReservationId,
    },

    /// The fast store was unreachable or returned an unexpected reply.
    #[error("fast store error: {0}")]
    FastStore(String),

    /// The durable store was unreachable or a query failed.
    #[error("durable store error: {0}")]
    DurableStore(String),

    /// The message bus rejected a publish or subscription.
    #[error("event bus error: {0}")]
    Bus(String),

    /// A value could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl InventoryError {
    /// Whether the error is a business-rule rejection (never retried) as
    /// opposed to a validation or infrastructure failure.
    #[must_use]
    pub const fn is_business(&self) -> bool {
        matches!(
            self,
            Self::InsufficientStock { .. }
                | Self::ProductNotActive { .. }
                | Self::ReservationNotFound { .. }
                | Self::InvalidTransition { .. }
                | Self::ReservationExpired { .. }
                | Self::StockNotFound { .. }
        )
    }

    /// Whether the error came from an infrastructure dependency and is worth
    /// retrying on an asynchronous path.
    #[must_use]
    pub const fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::FastStore(_) | Self::DurableStore(_) | Self::Bus(_)
        )
    }
}
