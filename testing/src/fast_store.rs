//! In-memory fast store fake.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use souk_core::InventoryError;
use souk_core::environment::Clock;
use souk_core::model::{ProductId, Reservation, ReservationId, Stock};
use souk_core::stores::FastStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Inner {
    stocks: HashMap<ProductId, Stock>,
    /// Reservation plus its eviction instant (TTL emulation).
    reservations: HashMap<ReservationId, (Reservation, DateTime<Utc>)>,
}

/// Stand-in for the Redis coordinator's backing store.
///
/// A single mutex serializes every operation, which models the property the
/// engine relies on in production: the store itself linearizes concurrent
/// reserve/release calls on the same product. TTL eviction is emulated
/// against the injected [`Clock`].
///
/// Failure injection: [`InMemoryFastStore::set_unreachable`] makes every
/// operation fail the way a down Redis would, and [`InMemoryFastStore::clear`]
/// simulates total cache loss for recovery tests.
pub struct InMemoryFastStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    unreachable: AtomicBool,
}

impl InMemoryFastStore {
    /// Create an empty store reading time from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            unreachable: AtomicBool::new(false),
        }
    }

    /// Make every subsequent operation fail as if the store were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Drop all data, simulating cache loss.
    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.stocks.clear();
            inner.reservations.clear();
        }
    }

    fn check_reachable(&self) -> Result<(), InventoryError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(InventoryError::FastStore(
                "fast store unreachable (injected)".to_string(),
            ));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, InventoryError> {
        self.inner
            .lock()
            .map_err(|_| InventoryError::FastStore("fast store lock poisoned".to_string()))
    }
}

#[async_trait]
impl FastStore for InMemoryFastStore {
    async fn put_stock(&self, stock: &Stock) -> Result<(), InventoryError> {
        self.check_reachable()?;
        let mut inner = self.lock()?;
        inner.stocks.insert(stock.product_id.clone(), stock.clone());
        Ok(())
    }

    async fn get_stock(&self, product_id: &ProductId) -> Result<Option<Stock>, InventoryError> {
        self.check_reachable()?;
        let inner = self.lock()?;
        Ok(inner.stocks.get(product_id).cloned())
    }

    async fn reserve(&self, reservation: &Reservation) -> Result<u32, InventoryError> {
        self.check_reachable()?;
        let now = self.clock.now();
        let mut inner = self.lock()?;
        let stock = inner
            .stocks
            .get_mut(&reservation.product_id)
            .ok_or_else(|| InventoryError::StockNotFound {
                product_id: reservation.product_id.clone(),
            })?;
        if stock.quantity < reservation.quantity {
            return Err(InventoryError::InsufficientStock {
                product_id: reservation.product_id.clone(),
                available: stock.quantity,
                requested: reservation.quantity,
            });
        }
        stock.quantity -= reservation.quantity;
        stock.updated_at = now;
        let remaining = stock.quantity;
        inner.reservations.insert(
            reservation.id.clone(),
            (reservation.clone(), reservation.expires_at),
        );
        Ok(remaining)
    }

    async fn release(
        &self,
        product_id: &ProductId,
        reservation_id: &ReservationId,
        quantity: u32,
    ) -> Result<u32, InventoryError> {
        self.check_reachable()?;
        let now = self.clock.now();
        let mut inner = self.lock()?;
        inner.reservations.remove(reservation_id);
        // Mirrors Redis HINCRBY: incrementing a missing key creates it.
        let stock = inner
            .stocks
            .entry(product_id.clone())
            .or_insert_with(|| Stock {
                product_id: product_id.clone(),
                quantity: 0,
                initial_quantity: 0,
                low_stock_threshold: 0,
                updated_at: now,
            });
        stock.quantity += quantity;
        stock.updated_at = now;
        Ok(stock.quantity)
    }

    async fn get_reservation(
        &self,
        reservation_id: &ReservationId,
    ) -> Result<Option<Reservation>, InventoryError> {
        self.check_reachable()?;
        let now = self.clock.now();
        let mut inner = self.lock()?;
        match inner.reservations.get(reservation_id) {
            Some((_, evict_at)) if now >= *evict_at => {
                inner.reservations.remove(reservation_id);
                Ok(None)
            }
            Some((reservation, _)) => Ok(Some(reservation.clone())),
            None => Ok(None),
        }
    }

    async fn put_reservation(
        &self,
        reservation: &Reservation,
        ttl: Duration,
    ) -> Result<(), InventoryError> {
        self.check_reachable()?;
        let evict_at = self.clock.now() + ttl;
        let mut inner = self.lock()?;
        inner
            .reservations
            .insert(reservation.id.clone(), (reservation.clone(), evict_at));
        Ok(())
    }

    async fn ping(&self) -> Result<(), InventoryError> {
        self.check_reachable()
    }

    async fn has_stock_records(&self) -> Result<bool, InventoryError> {
        self.check_reachable()?;
        let inner = self.lock()?;
        Ok(!inner.stocks.is_empty())
    }
}
