//! In-memory outbox store fake with failure injection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use souk_core::InventoryError;
use souk_core::model::{NewOutboxEvent, OutboxEvent, OutboxStatus};
use souk_core::stores::OutboxStore;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    rows: Vec<OutboxEvent>,
    next_id: i64,
}

/// Outbox fake backed by a vector of rows.
///
/// [`InMemoryOutboxStore::fail_next_enqueue`] makes the next `enqueue` fail,
/// which is how tests drive the service's compensating-release path.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    inner: Mutex<Inner>,
    fail_enqueue: AtomicBool,
}

impl InMemoryOutboxStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `enqueue` call fail with a durable-store error.
    pub fn fail_next_enqueue(&self) {
        self.fail_enqueue.store(true, Ordering::SeqCst);
    }

    /// Snapshot of all rows (test assertion helper).
    #[must_use]
    pub fn rows(&self) -> Vec<OutboxEvent> {
        self.inner.lock().map(|i| i.rows.clone()).unwrap_or_default()
    }

    /// Event types of all rows in insertion order (test assertion helper).
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|i| i.rows.iter().map(|r| r.event_type.clone()).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, InventoryError> {
        self.inner
            .lock()
            .map_err(|_| InventoryError::DurableStore("outbox store lock poisoned".into()))
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn enqueue(&self, events: &[NewOutboxEvent]) -> Result<(), InventoryError> {
        if self.fail_enqueue.swap(false, Ordering::SeqCst) {
            return Err(InventoryError::DurableStore(
                "outbox write failed (injected)".to_string(),
            ));
        }
        let now = Utc::now();
        let mut inner = self.lock()?;
        for event in events {
            inner.next_id += 1;
            let id = inner.next_id;
            inner.rows.push(OutboxEvent {
                id,
                aggregate_type: event.aggregate_type.clone(),
                aggregate_id: event.aggregate_id.clone(),
                event_type: event.event_type.clone(),
                event_id: event.event_id,
                payload: event.payload.clone(),
                status: OutboxStatus::Pending,
                retry_count: 0,
                last_error: None,
                next_retry_at: None,
                created_at: now,
                processed_at: None,
            });
        }
        Ok(())
    }

    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, InventoryError> {
        let inner = self.lock()?;
        let mut due: Vec<OutboxEvent> = inner
            .rows
            .iter()
            .filter(|row| match row.status {
                OutboxStatus::Pending => true,
                OutboxStatus::Retry => row.next_retry_at.is_none_or(|at| at <= now),
                OutboxStatus::Sent | OutboxStatus::Failed => false,
            })
            .cloned()
            .collect();
        due.sort_by_key(|row| row.created_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_sent(&self, id: i64, at: DateTime<Utc>) -> Result<(), InventoryError> {
        let mut inner = self.lock()?;
        if let Some(row) = inner.rows.iter_mut().find(|row| row.id == id) {
            row.status = OutboxStatus::Sent;
            row.processed_at = Some(at);
        }
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: i64,
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), InventoryError> {
        let mut inner = self.lock()?;
        if let Some(row) = inner.rows.iter_mut().find(|row| row.id == id) {
            row.status = OutboxStatus::Retry;
            row.retry_count = retry_count;
            row.next_retry_at = Some(next_retry_at);
            row.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: i64,
        at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), InventoryError> {
        let mut inner = self.lock()?;
        if let Some(row) = inner.rows.iter_mut().find(|row| row.id == id) {
            row.status = OutboxStatus::Failed;
            row.processed_at = Some(at);
            row.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64, InventoryError> {
        let mut inner = self.lock()?;
        let before = inner.rows.len();
        inner.rows.retain(|row| {
            !(row.status == OutboxStatus::Sent
                && row.processed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - inner.rows.len()) as u64)
    }

    async fn get_by_event_id(
        &self,
        event_id: Uuid,
    ) -> Result<Option<OutboxEvent>, InventoryError> {
        let inner = self.lock()?;
        Ok(inner.rows.iter().find(|row| row.event_id == event_id).cloned())
    }
}
