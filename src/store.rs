//! Callback store (C1): durable table plus transactional row operations.

use chrono::Utc;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::CallbackError;
use crate::models::CallbackRow;

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin_tx(&self) -> Result<Transaction<'_, Postgres>, CallbackError> {
        Ok(self.pool.begin().await?)
    }

    /// Inserts a fresh row. A primary-key conflict (replayed event id) is
    /// treated as idempotent success: callers distinguish via the returned
    /// bool (`true` = inserted, `false` = already present).
    pub async fn create(&self, row: &CallbackRow) -> Result<bool, CallbackError> {
        let result = sqlx::query(
            r#"
            INSERT INTO callback_message (
                id, payment_id, url, payload, created_at, updated_at,
                scheduled_at, delivered_at, delivery_attempts, publish_attempts, error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(row.id)
        .bind(row.payment_id)
        .bind(&row.url)
        .bind(&row.payload)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(row.scheduled_at)
        .bind(row.delivered_at)
        .bind(row.delivery_attempts)
        .bind(row.publish_attempts)
        .bind(&row.error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Fetches up to `limit` due rows under exclusive, skip-locked row
    /// locks within `tx`. Ordering is non-deterministic; the only contract
    /// is that no two concurrent fetchers observe the same row.
    pub async fn fetch_due(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        limit: i64,
    ) -> Result<Vec<CallbackRow>, CallbackError> {
        let rows = sqlx::query_as::<_, CallbackRow>(
            r#"
            SELECT id, payment_id, url, payload, created_at, updated_at,
                   scheduled_at, delivered_at, delivery_attempts, publish_attempts, error
            FROM callback_message
            WHERE scheduled_at IS NOT NULL AND scheduled_at <= now()
            FOR UPDATE SKIP LOCKED
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&mut **tx)
        .await?;

        Ok(rows)
    }

    /// Acquires an exclusive row lock by id and returns the current
    /// snapshot, or `None` if the row has since been deleted.
    pub async fn lock_by_id(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Option<CallbackRow>, CallbackError> {
        let row = sqlx::query_as::<_, CallbackRow>(
            r#"
            SELECT id, payment_id, url, payload, created_at, updated_at,
                   scheduled_at, delivered_at, delivery_attempts, publish_attempts, error
            FROM callback_message
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row)
    }

    /// Full-row write of the mutable fields, refreshing `updated_at`.
    pub async fn update(&self, tx: &mut Transaction<'_, Postgres>, row: &CallbackRow) -> Result<(), CallbackError> {
        sqlx::query(
            r#"
            UPDATE callback_message
            SET scheduled_at = $2,
                delivered_at = $3,
                delivery_attempts = $4,
                publish_attempts = $5,
                error = $6,
                updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(row.id)
        .bind(row.scheduled_at)
        .bind(row.delivered_at)
        .bind(row.delivery_attempts)
        .bind(row.publish_attempts)
        .bind(&row.error)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Unlocked point-read, used by tests and diagnostics.
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<CallbackRow>, CallbackError> {
        let row = sqlx::query_as::<_, CallbackRow>(
            r#"
            SELECT id, payment_id, url, payload, created_at, updated_at,
                   scheduled_at, delivered_at, delivery_attempts, publish_attempts, error
            FROM callback_message
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Read-only check of consumer-side idempotency state. Callers use
    /// this to decide whether a bus message has already been handled
    /// before doing any work for it; it does not itself record anything.
    pub async fn is_event_processed(&self, event_id: Uuid) -> Result<bool, CallbackError> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM processed_events WHERE event_id = $1)")
                .bind(event_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(exists)
    }

    /// Records a previously-processed bus event id. Callers must only call
    /// this once the work for `event_id` has durably completed; pair with
    /// [`Store::is_event_processed`] for the up-front check.
    pub async fn mark_event_processed(&self, event_id: Uuid, event_type: &str, source: &str) -> Result<bool, CallbackError> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, event_type, source)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(source)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Durable record of a filtered or malformed event.
    pub async fn record_dropped_event(&self, event_id: Option<Uuid>, reason: &str) -> Result<(), CallbackError> {
        sqlx::query("INSERT INTO dropped_events (event_id, reason) VALUES ($1, $2)")
            .bind(event_id)
            .bind(reason)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
