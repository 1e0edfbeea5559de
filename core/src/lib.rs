//! # Souk Core
//!
//! Shared domain model and abstractions for the Souk inventory service.
//!
//! This crate defines the vocabulary the rest of the engine speaks:
//!
//! - [`model`]: stock, reservations, outbox rows, and their invariants
//! - [`event`]: domain events published to and consumed from the bus
//! - [`event_bus`]: the publish/subscribe abstraction (bus mechanics are a
//!   black box behind this trait)
//! - [`stores`]: the seams between the engine and its two stores — the fast
//!   (volatile) store on the hot path and the durable system of record
//! - [`environment`]: the clock abstraction for deterministic time in tests
//! - [`error`]: the error taxonomy shared across components
//!
//! # Design
//!
//! The engine never talks to Redis, Postgres, or Kafka directly — it talks to
//! the traits defined here. Production implementations live in
//! `souk-inventory`; in-memory fakes live in `souk-testing`. Shared clients
//! are injected as explicit dependencies rather than process-wide globals.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod environment;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod model;
pub mod stores;

pub use error::InventoryError;
