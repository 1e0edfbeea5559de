//! # Souk Inventory
//!
//! The inventory reservation and consistency engine for the Souk marketplace.
//!
//! This crate guarantees that no two concurrent buyers can over-reserve the
//! same unit of stock, that reservations expire safely, that every state
//! change is durably recorded and reliably propagated, and that the system
//! recovers correctly after a cache failure.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   reserve/release    ┌─────────────────┐
//! │  Inventory   │─────────────────────▶│ RedisCoordinator │  fast store
//! │   Service    │   (atomic Lua)       └─────────────────┘  (Redis)
//! │              │
//! │              │   stage events       ┌─────────────────┐
//! │              │─────────────────────▶│  PgOutboxStore  │  durable store
//! │              │   (sync, durability  └────────┬────────┘  (Postgres)
//! │              │    boundary)                  │ poll
//! │              │                      ┌────────▼────────┐
//! │              │                      │   OutboxRelay   │──▶ Kafka bus
//! │              │                      └─────────────────┘
//! │              │   enqueue            ┌─────────────────┐
//! │              │─────────────────────▶│ PersistenceWorker│──▶ Postgres
//! └──────────────┘   (bounded queue)    └─────────────────┘   (batched upsert)
//!
//!   RecoveryManager: rebuilds Redis from Postgres after cache loss
//!   ExpirationScanner: safety net releasing overdue reservations
//!   ProductActivityMirror: gates Reserve on upstream product lifecycle
//! ```
//!
//! Per-product atomicity is delegated entirely to the fast store's scripted
//! operations; the service holds no in-process locks and scales horizontally.
//!
//! Transport (HTTP/RPC routing, auth, DTO mapping) is a separate concern and
//! lives with the gateway; this crate exposes [`service::InventoryService`]
//! as its public operation surface.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregate;
pub mod app;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod mirror;
pub mod outbox;
pub mod persistence;
pub mod recovery;
pub mod retry;
pub mod scanner;
pub mod service;

pub use service::InventoryService;
