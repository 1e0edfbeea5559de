//! In-memory durable reservation store fake.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use souk_core::InventoryError;
use souk_core::model::{
    OrderId, ProductId, Reservation, ReservationId, ReservationStatus, StockSnapshot,
};
use souk_core::stores::ReservationStore;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    reservations: HashMap<ReservationId, Reservation>,
    snapshots: HashMap<ProductId, StockSnapshot>,
}

/// Durable reservation store fake backed by hash maps.
///
/// Upserts are idempotent by business id and status transitions are
/// monotone, matching the guarded Postgres `ON CONFLICT` upsert the
/// production store uses.
#[derive(Default)]
pub struct InMemoryReservationStore {
    inner: Mutex<Inner>,
}

impl InMemoryReservationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of durable reservations held (test assertion helper).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.reservations.len()).unwrap_or(0)
    }

    /// Whether no durable reservations are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, InventoryError> {
        self.inner
            .lock()
            .map_err(|_| InventoryError::DurableStore("reservation store lock poisoned".into()))
    }
}

#[async_trait]
impl ReservationStore for InMemoryReservationStore {
    async fn upsert_batch(&self, reservations: &[Reservation]) -> Result<usize, InventoryError> {
        let mut inner = self.lock()?;
        for reservation in reservations {
            // Terminal rows win over late queue flushes.
            if inner
                .reservations
                .get(&reservation.id)
                .is_some_and(|existing| existing.status != ReservationStatus::Reserved)
            {
                continue;
            }
            inner
                .reservations
                .insert(reservation.id.clone(), reservation.clone());
        }
        Ok(reservations.len())
    }

    async fn get(&self, id: &ReservationId) -> Result<Option<Reservation>, InventoryError> {
        let inner = self.lock()?;
        Ok(inner.reservations.get(id).cloned())
    }

    async fn update_status(
        &self,
        id: &ReservationId,
        status: ReservationStatus,
        at: DateTime<Utc>,
        order_id: Option<&OrderId>,
    ) -> Result<(), InventoryError> {
        let mut inner = self.lock()?;
        if let Some(reservation) = inner.reservations.get_mut(id) {
            reservation.status = status;
            match status {
                ReservationStatus::Consumed => {
                    reservation.consumed_at = Some(at);
                    reservation.order_id = order_id.cloned();
                }
                ReservationStatus::Released | ReservationStatus::Expired => {
                    reservation.released_at = Some(at);
                }
                ReservationStatus::Reserved => {}
            }
        }
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<Reservation>, InventoryError> {
        let inner = self.lock()?;
        Ok(inner
            .reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Reserved)
            .cloned()
            .collect())
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        window: Duration,
        limit: usize,
    ) -> Result<Vec<Reservation>, InventoryError> {
        let inner = self.lock()?;
        let floor = now - window;
        let mut expired: Vec<Reservation> = inner
            .reservations
            .values()
            .filter(|r| {
                r.status == ReservationStatus::Reserved
                    && r.expires_at <= now
                    && r.expires_at >= floor
            })
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn upsert_stock_snapshot(&self, snapshot: &StockSnapshot) -> Result<(), InventoryError> {
        let mut inner = self.lock()?;
        inner
            .snapshots
            .insert(snapshot.product_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn list_stock_snapshots(&self) -> Result<Vec<StockSnapshot>, InventoryError> {
        let inner = self.lock()?;
        Ok(inner.snapshots.values().cloned().collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use souk_core::model::UserId;

    #[tokio::test]
    async fn terminal_rows_survive_late_reserved_writes() {
        let store = InMemoryReservationStore::new();
        let reserved = Reservation::new(
            ReservationId("rsv-1".into()),
            ProductId("shirt".into()),
            UserId("u1".into()),
            2,
            Utc::now(),
        );
        let mut released = reserved.clone();
        released.status = ReservationStatus::Released;
        released.released_at = Some(Utc::now());

        store.upsert_batch(&[released]).await.unwrap();
        // A queued reserved-state write flushing late must not resurrect it.
        store.upsert_batch(&[reserved.clone()]).await.unwrap();

        let row = store.get(&reserved.id).await.unwrap().unwrap();
        assert_eq!(row.status, ReservationStatus::Released);
    }
}
