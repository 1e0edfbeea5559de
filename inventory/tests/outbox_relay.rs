//! Outbox relay delivery, backoff, and cleanup behavior.

#![allow(clippy::unwrap_used)]

use chrono::Duration as ChronoDuration;
use souk_core::environment::Clock;
use souk_core::event::{StockEvent, TOPIC_STOCK_EVENTS};
use souk_core::model::{OutboxStatus, ProductId, ReservationId, UserId};
use souk_core::stores::OutboxStore;
use souk_inventory::outbox::{OutboxCleanup, OutboxRelay};
use souk_inventory::retry::RetryPolicy;
use souk_testing::{FixedClock, InMemoryEventBus, InMemoryOutboxStore};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    clock: Arc<FixedClock>,
    outbox: Arc<InMemoryOutboxStore>,
    bus: Arc<InMemoryEventBus>,
    relay: OutboxRelay,
}

fn harness() -> Harness {
    let clock = Arc::new(FixedClock::default());
    let outbox = Arc::new(InMemoryOutboxStore::new());
    let bus = Arc::new(InMemoryEventBus::new());
    let relay = OutboxRelay::new(
        outbox.clone(),
        bus.clone(),
        clock.clone(),
        RetryPolicy::default(),
        Duration::from_secs(5),
        50,
    );
    Harness {
        clock,
        outbox,
        bus,
        relay,
    }
}

fn reserved_event() -> StockEvent {
    StockEvent::Reserved {
        reservation_id: ReservationId("rsv-1".into()),
        product_id: ProductId("p1".into()),
        user_id: UserId("u1".into()),
        quantity: 2,
    }
}

#[tokio::test]
async fn pending_rows_are_published_and_marked_sent() {
    let h = harness();
    h.outbox
        .enqueue(&[reserved_event().into_outbox()])
        .await
        .unwrap();

    assert_eq!(h.relay.drain_once().await.unwrap(), 1);

    let row = &h.outbox.rows()[0];
    assert_eq!(row.status, OutboxStatus::Sent);
    assert!(row.processed_at.is_some());

    let published = h.bus.published();
    assert_eq!(published.len(), 1);
    let (topic, event) = &published[0];
    assert_eq!(topic, TOPIC_STOCK_EVENTS);
    assert_eq!(event.event_type, "stock.reserved");
    // Metadata carries the idempotency key consumers deduplicate on.
    let metadata = event.metadata.as_ref().unwrap();
    assert_eq!(
        metadata["event_id"].as_str().unwrap(),
        row.event_id.to_string()
    );
}

#[tokio::test]
async fn failed_publish_schedules_exponential_backoff() {
    let h = harness();
    h.outbox
        .enqueue(&[reserved_event().into_outbox()])
        .await
        .unwrap();

    h.bus.fail_next_publishes(1);
    assert_eq!(h.relay.drain_once().await.unwrap(), 0);

    let row = &h.outbox.rows()[0];
    assert_eq!(row.status, OutboxStatus::Retry);
    assert_eq!(row.retry_count, 1);
    assert_eq!(
        row.next_retry_at.unwrap(),
        h.clock.now() + ChronoDuration::seconds(30)
    );

    // Not due yet: the row is skipped.
    assert_eq!(h.relay.drain_once().await.unwrap(), 0);
    assert!(h.bus.published().is_empty());

    // Second failure doubles the delay.
    h.clock.advance(ChronoDuration::seconds(30));
    h.bus.fail_next_publishes(1);
    assert_eq!(h.relay.drain_once().await.unwrap(), 0);
    let row = &h.outbox.rows()[0];
    assert_eq!(row.retry_count, 2);
    assert_eq!(
        row.next_retry_at.unwrap(),
        h.clock.now() + ChronoDuration::seconds(60)
    );

    // Once the broker recovers, the row goes out.
    h.clock.advance(ChronoDuration::seconds(60));
    assert_eq!(h.relay.drain_once().await.unwrap(), 1);
    assert_eq!(h.outbox.rows()[0].status, OutboxStatus::Sent);
}

#[tokio::test]
async fn retry_ceiling_marks_the_row_failed() {
    let h = harness();
    h.outbox
        .enqueue(&[reserved_event().into_outbox()])
        .await
        .unwrap();

    for _ in 0..5 {
        h.bus.fail_next_publishes(1);
        h.relay.drain_once().await.unwrap();
        h.clock.advance(ChronoDuration::minutes(30));
    }

    let row = &h.outbox.rows()[0];
    assert_eq!(row.status, OutboxStatus::Failed);
    assert_eq!(row.retry_count, 4);
    assert!(row.last_error.is_some());

    // Dead rows are never picked up again.
    assert_eq!(h.relay.drain_once().await.unwrap(), 0);
    assert!(h.bus.published().is_empty());
}

#[tokio::test]
async fn batch_preserves_creation_order() {
    let h = harness();
    let events = vec![
        reserved_event().into_outbox(),
        StockEvent::Depleted {
            product_id: ProductId("p1".into()),
        }
        .into_outbox(),
    ];
    h.outbox.enqueue(&events).await.unwrap();

    assert_eq!(h.relay.drain_once().await.unwrap(), 2);
    assert_eq!(
        h.bus.published_types(TOPIC_STOCK_EVENTS),
        vec!["stock.reserved", "stock.depleted"]
    );
}

#[tokio::test]
async fn cleanup_deletes_only_old_sent_rows() {
    let h = harness();
    h.outbox
        .enqueue(&[
            reserved_event().into_outbox(),
            StockEvent::Depleted {
                product_id: ProductId("p1".into()),
            }
            .into_outbox(),
        ])
        .await
        .unwrap();

    // Send the first row, kill the second.
    let rows = h.outbox.rows();
    h.outbox
        .mark_sent(rows[0].id, h.clock.now())
        .await
        .unwrap();
    h.outbox
        .mark_failed(rows[1].id, h.clock.now(), "broker gone")
        .await
        .unwrap();

    let cleanup = OutboxCleanup::new(
        h.outbox.clone() as Arc<dyn OutboxStore>,
        h.clock.clone() as Arc<dyn Clock>,
        ChronoDuration::hours(24),
        Duration::from_secs(3600),
    );

    // Inside the retention window: nothing to do.
    assert_eq!(cleanup.sweep_once().await.unwrap(), 0);

    h.clock.advance(ChronoDuration::hours(25));
    assert_eq!(cleanup.sweep_once().await.unwrap(), 1);

    // The failed row survives as the manual-intervention record.
    let remaining = h.outbox.rows();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].status, OutboxStatus::Failed);
}

#[tokio::test]
async fn staged_rows_are_retrievable_by_event_id() {
    let h = harness();
    let staged = reserved_event().into_outbox();
    let event_id = staged.event_id;
    h.outbox.enqueue(&[staged]).await.unwrap();

    let found = h.outbox.get_by_event_id(event_id).await.unwrap().unwrap();
    assert_eq!(found.event_type, "stock.reserved");
    assert!(
        h.outbox
            .get_by_event_id(uuid::Uuid::new_v4())
            .await
            .unwrap()
            .is_none()
    );
}
