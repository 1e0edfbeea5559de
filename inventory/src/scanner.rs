//! Safety-net scanner for reservations whose holders never acted.
//!
//! The fast store's TTL eviction reclaims the cached record but cannot give
//! the stock back or write the terminal status. This scanner does: it
//! periodically selects durable `Reserved` rows whose `expires_at` fell
//! inside a bounded trailing window and expires each through the service.
//! Rows older than the window are left for recovery or manual tooling, which
//! keeps every scan pass constant-cost.

use crate::service::InventoryService;
use chrono::Duration as ChronoDuration;
use souk_core::InventoryError;
use souk_core::environment::Clock;
use souk_core::stores::ReservationStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Periodic expiry of overdue reservations.
pub struct ExpirationScanner {
    service: Arc<InventoryService>,
    reservations: Arc<dyn ReservationStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    window: ChronoDuration,
    batch_size: usize,
}

impl ExpirationScanner {
    /// Create a scanner with the given schedule and trailing window.
    #[must_use]
    pub fn new(
        service: Arc<InventoryService>,
        reservations: Arc<dyn ReservationStore>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        window: ChronoDuration,
        batch_size: usize,
    ) -> Self {
        Self {
            service,
            reservations,
            clock,
            interval,
            window,
            batch_size,
        }
    }

    /// Spawn the scan loop as a background task.
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_s = self.interval.as_secs(),
            window_h = self.window.num_hours(),
            "Expiration scanner started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.scan_once().await {
                        Ok(0) => {}
                        Ok(expired) => debug!(expired, "Scan pass reclaimed reservations"),
                        Err(e) => warn!(error = %e, "Scan pass failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Expiration scanner stopping");
                    break;
                }
            }
        }
    }

    /// Run one scan pass. Returns the number of reservations expired.
    ///
    /// # Errors
    ///
    /// Returns the selection query's error; per-reservation expiry failures
    /// are logged and skipped so one stuck row cannot stall the pass.
    pub async fn scan_once(&self) -> Result<usize, InventoryError> {
        let now = self.clock.now();
        let overdue = self
            .reservations
            .list_expired(now, self.window, self.batch_size)
            .await?;

        let mut expired = 0;
        for reservation in overdue {
            let id = reservation.id.clone();
            match self.service.expire(reservation).await {
                Ok(()) => expired += 1,
                // Raced with a consume/release; the row is terminal now.
                Err(InventoryError::InvalidTransition { .. }) => {
                    debug!(reservation_id = %id, "Reservation turned terminal before expiry");
                }
                Err(e) => warn!(reservation_id = %id, error = %e, "Expiry failed"),
            }
        }
        Ok(expired)
    }
}
