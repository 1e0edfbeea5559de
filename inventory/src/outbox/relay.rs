//! Outbox relay poller and sent-row cleanup.

use crate::retry::RetryPolicy;
use chrono::Duration as ChronoDuration;
use serde_json::json;
use souk_core::environment::Clock;
use souk_core::event::{SerializedEvent, TOPIC_STOCK_EVENTS};
use souk_core::event_bus::EventBus;
use souk_core::model::OutboxEvent;
use souk_core::stores::OutboxStore;
use souk_core::InventoryError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Background poller that drains due outbox rows to the bus.
///
/// Each cycle selects `Pending`/due-`Retry` rows in creation order and
/// publishes them one by one: success marks the row `Sent`; failure
/// schedules `next_retry_at = now + base * multiplier^retry_count`, flipping
/// to `Failed` once the ceiling is reached. A cycle in flight always
/// completes before shutdown.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    poll_interval: Duration,
    batch_size: usize,
}

impl OutboxRelay {
    /// Create a relay with the given schedule.
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
        poll_interval: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            policy,
            poll_interval,
            batch_size,
        }
    }

    /// Spawn the polling loop as a background task.
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            batch_size = self.batch_size,
            "Outbox relay started"
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.drain_once().await {
                        Ok(0) => {}
                        Ok(published) => debug!(published, "Outbox relay cycle complete"),
                        Err(e) => warn!(error = %e, "Outbox relay cycle failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Outbox relay stopping");
                    break;
                }
            }
        }
    }

    /// Run one polling cycle. Returns the number of rows marked `Sent`.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::DurableStore`] if the polling query itself
    /// fails; per-row publish failures are absorbed into the retry schedule.
    pub async fn drain_once(&self) -> Result<usize, InventoryError> {
        let now = self.clock.now();
        let due = self.store.fetch_due(now, self.batch_size).await?;
        if due.is_empty() {
            return Ok(0);
        }

        let mut sent = 0;
        for row in due {
            match self.publish_row(&row).await {
                Ok(()) => {
                    self.store.mark_sent(row.id, self.clock.now()).await?;
                    metrics::counter!("inventory.outbox.sent").increment(1);
                    sent += 1;
                }
                Err(e) => {
                    let attempts = row.retry_count + 1;
                    if self.policy.is_exhausted(attempts) {
                        self.store
                            .mark_failed(row.id, self.clock.now(), &e.to_string())
                            .await?;
                        metrics::counter!("inventory.outbox.dead").increment(1);
                    } else {
                        let delay = self.policy.delay_for_attempt(row.retry_count);
                        let next_retry_at = self.clock.now() + delay;
                        self.store
                            .mark_retry(row.id, attempts, next_retry_at, &e.to_string())
                            .await?;
                        metrics::counter!("inventory.outbox.retried").increment(1);
                        warn!(
                            outbox_id = row.id,
                            event_type = %row.event_type,
                            attempts,
                            next_retry_in_s = delay.num_seconds(),
                            error = %e,
                            "Outbox publish failed, retry scheduled"
                        );
                    }
                }
            }
        }
        Ok(sent)
    }

    async fn publish_row(&self, row: &OutboxEvent) -> Result<(), InventoryError> {
        let event = SerializedEvent::new(
            row.event_type.clone(),
            row.payload.clone(),
            Some(json!({
                "event_id": row.event_id,
                "aggregate_type": row.aggregate_type,
                "aggregate_id": row.aggregate_id,
                "published_at": self.clock.now(),
            })),
        );
        self.bus
            .publish(TOPIC_STOCK_EVENTS, &event)
            .await
            .map_err(|e| InventoryError::Bus(e.to_string()))
    }
}

/// Periodic deletion of `Sent` rows past the retention window.
///
/// `Failed` rows are never touched: they are the manual-intervention queue.
pub struct OutboxCleanup {
    store: Arc<dyn OutboxStore>,
    clock: Arc<dyn Clock>,
    retention: ChronoDuration,
    interval: Duration,
}

impl OutboxCleanup {
    /// Create a cleanup task with the given retention window.
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        clock: Arc<dyn Clock>,
        retention: ChronoDuration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            retention,
            interval,
        }
    }

    /// Spawn the cleanup loop as a background task.
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(0) => {}
                        Ok(deleted) => debug!(deleted, "Outbox cleanup removed sent rows"),
                        Err(e) => warn!(error = %e, "Outbox cleanup failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Outbox cleanup stopping");
                    break;
                }
            }
        }
    }

    /// Delete `Sent` rows older than the retention window once.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::DurableStore`] if the delete fails.
    pub async fn sweep_once(&self) -> Result<u64, InventoryError> {
        let cutoff = self.clock.now() - self.retention;
        let deleted = self.store.delete_sent_before(cutoff).await?;
        if deleted > 0 {
            metrics::counter!("inventory.outbox.cleaned").increment(deleted);
        }
        Ok(deleted)
    }
}
