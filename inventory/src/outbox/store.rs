//! Postgres outbox store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use souk_core::InventoryError;
use souk_core::model::{NewOutboxEvent, OutboxEvent, OutboxStatus};
use souk_core::stores::OutboxStore;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Postgres-backed outbox store.
///
/// Rows live in the `outbox_events` table; the relay's polling query is
/// served by a partial index over non-terminal rows (see migrations).
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    /// Create a store over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<OutboxEvent, InventoryError> {
        let status_str: String = row.get("status");
        Ok(OutboxEvent {
            id: row.get("id"),
            aggregate_type: row.get("aggregate_type"),
            aggregate_id: row.get("aggregate_id"),
            event_type: row.get("event_type"),
            event_id: row.get("event_id"),
            payload: row.get("payload"),
            status: OutboxStatus::parse(&status_str)?,
            retry_count: row.get("retry_count"),
            last_error: row.get("last_error"),
            next_retry_at: row.get("next_retry_at"),
            created_at: row.get("created_at"),
            processed_at: row.get("processed_at"),
        })
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn enqueue(&self, events: &[NewOutboxEvent]) -> Result<(), InventoryError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| InventoryError::DurableStore(e.to_string()))?;
        for event in events {
            sqlx::query(
                r"
                INSERT INTO outbox_events (
                    aggregate_type, aggregate_id, event_type, event_id, payload, status
                ) VALUES ($1, $2, $3, $4, $5, 'pending')
                ",
            )
            .bind(&event.aggregate_type)
            .bind(&event.aggregate_id)
            .bind(&event.event_type)
            .bind(event.event_id)
            .bind(&event.payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| InventoryError::DurableStore(e.to_string()))?;
        }
        tx.commit()
            .await
            .map_err(|e| InventoryError::DurableStore(e.to_string()))?;

        metrics::counter!("inventory.outbox.staged").increment(events.len() as u64);
        Ok(())
    }

    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, InventoryError> {
        #[allow(clippy::cast_possible_wrap)]
        let rows = sqlx::query(
            r"
            SELECT id, aggregate_type, aggregate_id, event_type, event_id, payload,
                   status, retry_count, last_error, next_retry_at, created_at, processed_at
            FROM outbox_events
            WHERE status = 'pending'
               OR (status = 'retry' AND (next_retry_at IS NULL OR next_retry_at <= $1))
            ORDER BY created_at ASC
            LIMIT $2
            ",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| InventoryError::DurableStore(e.to_string()))?;

        rows.iter().map(Self::row_to_event).collect()
    }

    async fn mark_sent(&self, id: i64, at: DateTime<Utc>) -> Result<(), InventoryError> {
        sqlx::query(
            r"
            UPDATE outbox_events
            SET status = 'sent', processed_at = $1
            WHERE id = $2
            ",
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| InventoryError::DurableStore(e.to_string()))?;
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: i64,
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), InventoryError> {
        sqlx::query(
            r"
            UPDATE outbox_events
            SET status = 'retry', retry_count = $1, next_retry_at = $2, last_error = $3
            WHERE id = $4
            ",
        )
        .bind(retry_count)
        .bind(next_retry_at)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| InventoryError::DurableStore(e.to_string()))?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: i64,
        at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), InventoryError> {
        sqlx::query(
            r"
            UPDATE outbox_events
            SET status = 'failed', processed_at = $1, last_error = $2
            WHERE id = $3
            ",
        )
        .bind(at)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| InventoryError::DurableStore(e.to_string()))?;

        tracing::warn!(outbox_id = id, error, "Outbox row dead after retry ceiling");
        Ok(())
    }

    async fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64, InventoryError> {
        let result = sqlx::query(
            r"
            DELETE FROM outbox_events
            WHERE status = 'sent' AND processed_at < $1
            ",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| InventoryError::DurableStore(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn get_by_event_id(
        &self,
        event_id: Uuid,
    ) -> Result<Option<OutboxEvent>, InventoryError> {
        let row = sqlx::query(
            r"
            SELECT id, aggregate_type, aggregate_id, event_type, event_id, payload,
                   status, retry_count, last_error, next_retry_at, created_at, processed_at
            FROM outbox_events
            WHERE event_id = $1
            ",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| InventoryError::DurableStore(e.to_string()))?;

        row.as_ref().map(Self::row_to_event).transpose()
    }
}
