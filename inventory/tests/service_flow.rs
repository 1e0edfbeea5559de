//! End-to-end flows through the inventory service against in-memory stores.

#![allow(clippy::unwrap_used)]

use chrono::Duration as ChronoDuration;
use souk_core::InventoryError;
use souk_core::environment::Clock;
use souk_core::model::{
    OrderId, OutboxStatus, ProductId, Reservation, ReservationStatus, Stock, UserId,
    reservation_ttl,
};
use souk_core::stores::{FastStore, ReservationStore};
use souk_inventory::InventoryService;
use souk_inventory::mirror::{ProductActivityMirror, ProductLifecycle};
use souk_inventory::persistence::PersistenceWorker;
use souk_inventory::recovery::RecoveryKind;
use souk_inventory::scanner::ExpirationScanner;
use souk_testing::{
    FixedClock, InMemoryFastStore, InMemoryOutboxStore, InMemoryReservationStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct Harness {
    clock: Arc<FixedClock>,
    fast: Arc<InMemoryFastStore>,
    reservations: Arc<InMemoryReservationStore>,
    outbox: Arc<InMemoryOutboxStore>,
    mirror: Arc<ProductActivityMirror>,
    service: Arc<InventoryService>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Harness {
    fn new() -> Self {
        Self::with_flush_interval(Duration::from_millis(10))
    }

    /// A long interval keeps reserve-time rows stuck in the queue, for tests
    /// that exercise behavior before the worker has flushed anything.
    fn with_flush_interval(flush_interval: Duration) -> Self {
        let clock = Arc::new(FixedClock::default());
        let fast = Arc::new(InMemoryFastStore::new(clock.clone()));
        let reservations = Arc::new(InMemoryReservationStore::new());
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let mirror = Arc::new(ProductActivityMirror::new());

        let (queue, worker) =
            PersistenceWorker::channel(reservations.clone(), 50, flush_interval, 200);
        let (shutdown_tx, _) = broadcast::channel(1);
        let _worker_handle = worker.spawn(shutdown_tx.subscribe());

        let service = Arc::new(InventoryService::new(
            fast.clone(),
            reservations.clone(),
            outbox.clone(),
            queue,
            mirror.clone(),
            clock.clone(),
        ));

        Self {
            clock,
            fast,
            reservations,
            outbox,
            mirror,
            service,
            shutdown_tx,
        }
    }

    /// Wait until the persistence worker has flushed `count` reservations.
    async fn await_durable(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.reservations.len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn p(id: &str) -> ProductId {
    ProductId(id.to_string())
}

fn u(id: &str) -> UserId {
    UserId(id.to_string())
}

#[tokio::test]
async fn reserve_decrements_until_stock_runs_out() {
    let h = Harness::new();
    h.service.set_stock(p("shirt"), 10, 0).await.unwrap();

    let first = h.service.reserve(p("shirt"), u("alice"), 3).await.unwrap();
    assert_eq!(first.remaining, 7);
    let second = h.service.reserve(p("shirt"), u("bob"), 5).await.unwrap();
    assert_eq!(second.remaining, 2);

    let err = h
        .service
        .reserve(p("shirt"), u("carol"), 5)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        InventoryError::InsufficientStock {
            available: 2,
            requested: 5,
            ..
        }
    ));
    // Failed reserve has no side effects.
    let stock = h.service.get_stock(&p("shirt")).await.unwrap().unwrap();
    assert_eq!(stock.quantity, 2);

    // Releasing the first hold makes the quantity reservable again.
    let remaining = h.service.release(&first.reservation.id).await.unwrap();
    assert_eq!(remaining, Some(5));
    assert!(h.service.reserve(p("shirt"), u("carol"), 5).await.is_ok());
}

#[tokio::test]
async fn reserve_validates_quantity_and_product() {
    let h = Harness::new();
    h.service.set_stock(p("shirt"), 10, 0).await.unwrap();

    assert!(matches!(
        h.service.reserve(p("shirt"), u("a"), 0).await.unwrap_err(),
        InventoryError::InvalidQuantity { requested: 0 }
    ));
    assert!(matches!(
        h.service.reserve(p("shirt"), u("a"), 11).await.unwrap_err(),
        InventoryError::InvalidQuantity { requested: 11 }
    ));
    assert!(matches!(
        h.service.reserve(p(""), u("a"), 1).await.unwrap_err(),
        InventoryError::EmptyId("product")
    ));
    assert!(matches!(
        h.service.reserve(p("unknown"), u("a"), 1).await.unwrap_err(),
        InventoryError::StockNotFound { .. }
    ));
}

#[tokio::test]
async fn deactivated_products_are_not_reservable() {
    let h = Harness::new();
    h.service.set_stock(p("shirt"), 10, 0).await.unwrap();

    h.mirror.apply(p("shirt"), ProductLifecycle::Deactivated);
    assert!(matches!(
        h.service.reserve(p("shirt"), u("a"), 1).await.unwrap_err(),
        InventoryError::ProductNotActive { .. }
    ));
    // Stock untouched by the gate.
    assert_eq!(
        h.service.get_stock(&p("shirt")).await.unwrap().unwrap().quantity,
        10
    );

    h.mirror.apply(p("shirt"), ProductLifecycle::Published);
    assert!(h.service.reserve(p("shirt"), u("a"), 1).await.is_ok());
}

#[tokio::test]
async fn accepted_operations_stage_outbox_events() {
    let h = Harness::new();
    h.service.set_stock(p("shirt"), 10, 0).await.unwrap();

    let outcome = h.service.reserve(p("shirt"), u("a"), 2).await.unwrap();
    h.service.release(&outcome.reservation.id).await.unwrap();

    let types = h.outbox.event_types();
    assert_eq!(types, vec!["stock.reserved", "stock.released"]);
    // Every staged row carries an idempotency key and starts pending.
    for row in h.outbox.rows() {
        assert_eq!(row.status, OutboxStatus::Pending);
        assert!(!row.event_id.is_nil());
    }
}

#[tokio::test]
async fn depletion_and_low_stock_are_reported() {
    let h = Harness::new();
    h.service.set_stock(p("rare"), 3, 0).await.unwrap();
    h.service.reserve(p("rare"), u("a"), 3).await.unwrap();
    assert!(h.outbox.event_types().contains(&"stock.depleted".to_string()));

    h.service.set_stock(p("common"), 10, 8).await.unwrap();
    h.service.reserve(p("common"), u("a"), 3).await.unwrap();
    let low = h
        .outbox
        .rows()
        .into_iter()
        .find(|row| row.event_type == "stock.low")
        .unwrap();
    assert_eq!(low.payload["quantity"], 7);
    assert_eq!(low.payload["threshold"], 8);
}

#[tokio::test]
async fn failed_outbox_write_compensates_the_reservation() {
    let h = Harness::new();
    h.service.set_stock(p("shirt"), 10, 0).await.unwrap();

    h.outbox.fail_next_enqueue();
    let err = h.service.reserve(p("shirt"), u("a"), 4).await.unwrap_err();
    assert!(matches!(err, InventoryError::DurableStore(_)));

    // Stock given back, nothing staged, nothing persisted.
    assert_eq!(
        h.service.get_stock(&p("shirt")).await.unwrap().unwrap().quantity,
        10
    );
    assert!(h.outbox.rows().is_empty());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.reservations.is_empty());
}

#[tokio::test]
async fn release_is_idempotent() {
    let h = Harness::new();
    h.service.set_stock(p("shirt"), 10, 0).await.unwrap();
    let outcome = h.service.reserve(p("shirt"), u("a"), 2).await.unwrap();
    h.await_durable(1).await;

    assert_eq!(
        h.service.release(&outcome.reservation.id).await.unwrap(),
        Some(10)
    );
    h.await_durable(1).await;

    // Second release: cached record gone, durable copy terminal, no-op.
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let durable = h.reservations.get(&outcome.reservation.id).await.unwrap();
            if durable.is_some_and(|r| r.status == ReservationStatus::Released) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(h.service.release(&outcome.reservation.id).await.unwrap(), None);
    assert_eq!(
        h.service.get_stock(&p("shirt")).await.unwrap().unwrap().quantity,
        10
    );

    // Releasing an id that never existed is also a no-op.
    assert_eq!(
        h.service
            .release(&souk_core::model::ReservationId("rsv-ghost".into()))
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn release_repeated_before_the_durable_flush_credits_once() {
    // The worker will not flush for a minute: the durable store only sees
    // what release itself writes.
    let h = Harness::with_flush_interval(Duration::from_secs(60));
    h.service.set_stock(p("shirt"), 10, 0).await.unwrap();
    let outcome = h.service.reserve(p("shirt"), u("a"), 2).await.unwrap();

    assert_eq!(
        h.service.release(&outcome.reservation.id).await.unwrap(),
        Some(10)
    );
    // The immediate retry finds the terminal row and does nothing.
    assert_eq!(h.service.release(&outcome.reservation.id).await.unwrap(), None);
    assert_eq!(
        h.service.get_stock(&p("shirt")).await.unwrap().unwrap().quantity,
        10
    );
}

#[tokio::test]
async fn consume_keeps_stock_and_records_the_order() {
    let h = Harness::new();
    h.service.set_stock(p("shirt"), 10, 0).await.unwrap();
    let outcome = h.service.reserve(p("shirt"), u("a"), 2).await.unwrap();

    let consumed = h
        .service
        .consume(&outcome.reservation.id, OrderId("ord-1".into()))
        .await
        .unwrap();
    assert_eq!(consumed.status, ReservationStatus::Consumed);
    assert_eq!(consumed.order_id, Some(OrderId("ord-1".into())));

    // Stock stays decremented; the hold became a sale.
    assert_eq!(
        h.service.get_stock(&p("shirt")).await.unwrap().unwrap().quantity,
        8
    );
    assert!(h.outbox.event_types().contains(&"stock.consumed".to_string()));

    // A second consume is rejected from the terminal state.
    assert!(matches!(
        h.service
            .consume(&outcome.reservation.id, OrderId("ord-2".into()))
            .await
            .unwrap_err(),
        InventoryError::InvalidTransition { .. }
    ));
}

#[tokio::test]
async fn consume_after_ttl_is_rejected() {
    let h = Harness::new();
    h.service.set_stock(p("shirt"), 10, 0).await.unwrap();
    let outcome = h.service.reserve(p("shirt"), u("a"), 2).await.unwrap();
    h.await_durable(1).await;

    h.clock.advance(reservation_ttl());
    let err = h
        .service
        .consume(&outcome.reservation.id, OrderId("ord-1".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, InventoryError::ReservationExpired { .. }));
}

#[tokio::test]
async fn scanner_reclaims_overdue_reservations() {
    let h = Harness::new();
    h.service.set_stock(p("shirt"), 10, 0).await.unwrap();
    let outcome = h.service.reserve(p("shirt"), u("a"), 4).await.unwrap();
    h.await_durable(1).await;

    let scanner = ExpirationScanner::new(
        h.service.clone(),
        h.reservations.clone() as Arc<dyn ReservationStore>,
        h.clock.clone() as Arc<dyn Clock>,
        Duration::from_secs(60),
        ChronoDuration::hours(24),
        100,
    );

    // Not yet due.
    h.clock.advance(ChronoDuration::minutes(14));
    assert_eq!(scanner.scan_once().await.unwrap(), 0);

    h.clock.advance(ChronoDuration::minutes(1));
    assert_eq!(scanner.scan_once().await.unwrap(), 1);

    // Stock reclaimed, terminal status written, release event staged.
    assert_eq!(
        h.service.get_stock(&p("shirt")).await.unwrap().unwrap().quantity,
        10
    );
    let durable = h
        .reservations
        .get(&outcome.reservation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(durable.status, ReservationStatus::Expired);
    assert!(h.outbox.event_types().contains(&"stock.released".to_string()));

    // A second pass finds nothing.
    assert_eq!(scanner.scan_once().await.unwrap(), 0);
}

#[tokio::test]
async fn failed_expiry_leaves_the_hold_for_the_next_pass() {
    let h = Harness::new();
    h.service.set_stock(p("shirt"), 10, 0).await.unwrap();
    let outcome = h.service.reserve(p("shirt"), u("a"), 4).await.unwrap();
    h.await_durable(1).await;

    let scanner = ExpirationScanner::new(
        h.service.clone(),
        h.reservations.clone() as Arc<dyn ReservationStore>,
        h.clock.clone() as Arc<dyn Clock>,
        Duration::from_secs(60),
        ChronoDuration::hours(24),
        100,
    );
    h.clock.advance(ChronoDuration::minutes(16));

    // The outbox write fails: the pass must leave stock and status alone.
    h.outbox.fail_next_enqueue();
    assert_eq!(scanner.scan_once().await.unwrap(), 0);
    assert_eq!(
        h.service.get_stock(&p("shirt")).await.unwrap().unwrap().quantity,
        6
    );
    let durable = h
        .reservations
        .get(&outcome.reservation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(durable.status, ReservationStatus::Reserved);

    // The retry credits exactly once.
    assert_eq!(scanner.scan_once().await.unwrap(), 1);
    assert_eq!(
        h.service.get_stock(&p("shirt")).await.unwrap().unwrap().quantity,
        10
    );
    assert_eq!(scanner.scan_once().await.unwrap(), 0);
    assert_eq!(
        h.service.get_stock(&p("shirt")).await.unwrap().unwrap().quantity,
        10
    );
}

#[tokio::test]
async fn scanner_skips_rows_outside_the_window() {
    let h = Harness::new();
    h.service.set_stock(p("shirt"), 10, 0).await.unwrap();
    h.service.reserve(p("shirt"), u("a"), 1).await.unwrap();
    h.await_durable(1).await;

    let scanner = ExpirationScanner::new(
        h.service.clone(),
        h.reservations.clone() as Arc<dyn ReservationStore>,
        h.clock.clone() as Arc<dyn Clock>,
        Duration::from_secs(60),
        ChronoDuration::hours(24),
        100,
    );

    // Expired far beyond the trailing window: left for recovery tooling.
    h.clock.advance(ChronoDuration::hours(26));
    assert_eq!(scanner.scan_once().await.unwrap(), 0);
}

#[tokio::test]
async fn forced_recovery_is_reachable_through_the_service() {
    let h = Harness::new();
    h.service.set_stock(p("shirt"), 10, 0).await.unwrap();
    h.service.reserve(p("shirt"), u("a"), 3).await.unwrap();
    h.await_durable(1).await;

    // An operator rebuild after the cached value went bad.
    h.fast
        .put_stock(&Stock {
            product_id: p("shirt"),
            quantity: 99,
            initial_quantity: 10,
            low_stock_threshold: 0,
            updated_at: h.clock.now(),
        })
        .await
        .unwrap();

    let report = h.service.trigger_recovery(RecoveryKind::Full).await.unwrap();
    assert_eq!(report.kind, RecoveryKind::Full);
    assert_eq!(
        h.service.get_stock(&p("shirt")).await.unwrap().unwrap().quantity,
        7
    );
}

#[tokio::test]
async fn validation_runs_before_the_activity_gate() {
    let h = Harness::new();
    h.service.set_stock(p("shirt"), 10, 0).await.unwrap();
    h.mirror.apply(p("shirt"), ProductLifecycle::Deactivated);

    // A malformed request on an inactive product reports the request error.
    assert!(matches!(
        h.service.reserve(p("shirt"), u("a"), 0).await.unwrap_err(),
        InventoryError::InvalidQuantity { requested: 0 }
    ));
    assert!(matches!(
        h.service.reserve(p("shirt"), u("a"), 1).await.unwrap_err(),
        InventoryError::ProductNotActive { .. }
    ));
}

#[tokio::test]
async fn reservation_reads_fall_back_to_the_durable_store() {
    let h = Harness::new();
    h.service.set_stock(p("shirt"), 10, 0).await.unwrap();
    let outcome = h.service.reserve(p("shirt"), u("a"), 2).await.unwrap();
    h.await_durable(1).await;

    // Simulate cache loss; the durable copy still answers reads.
    h.fast.clear();
    let found: Option<Reservation> = h
        .service
        .get_reservation(&outcome.reservation.id)
        .await
        .unwrap();
    assert_eq!(found.unwrap().id, outcome.reservation.id);
}
