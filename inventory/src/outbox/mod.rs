//! Outbox-based event relay.
//!
//! Guarantees at-least-once delivery to the message bus without a
//! distributed transaction: domain events are staged as durable rows
//! immediately after a successful coordinator call (the request path's
//! durability boundary), then a background poller publishes them with
//! exponential backoff. Rows that exhaust the retry ceiling flip to `Failed`
//! and wait for manual resolution — there is no automatic dead-letter topic,
//! a deliberate limitation.
//!
//! Ordering is per-batch creation order only; consumers deduplicate on the
//! `event_id` carried in event metadata.

mod relay;
mod store;

pub use relay::{OutboxCleanup, OutboxRelay};
pub use store::PgOutboxStore;
