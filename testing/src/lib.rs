//! # Souk Testing
//!
//! Testing utilities for the Souk inventory engine.
//!
//! This crate provides:
//! - [`FixedClock`]: deterministic, manually advanced time
//! - [`InMemoryFastStore`]: mutex-serialized stand-in for the Redis
//!   coordinator, with the same atomicity and TTL semantics
//! - [`InMemoryReservationStore`] / [`InMemoryOutboxStore`]: durable-store
//!   fakes with failure injection
//! - [`InMemoryEventBus`]: capturing bus with failure injection
//!
//! The fakes implement the `souk-core` store traits, so service-level tests
//! exercise the real orchestration logic against them.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod bus;
mod clock;
mod fast_store;
mod outbox_store;
mod reservation_store;

pub use bus::InMemoryEventBus;
pub use clock::FixedClock;
pub use fast_store::InMemoryFastStore;
pub use outbox_store::InMemoryOutboxStore;
pub use reservation_store::InMemoryReservationStore;
