//! Repository for failed webhook rows and their retry bookkeeping.
//!
//! Outcome writes run inside a transaction that first locks the row with
//! `FOR UPDATE`, so two reconciliation runs that somehow overlap cannot both
//! record an outcome for the same row, and terminal rows are never touched
//! again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{WebhookEvent, WebhookEventId},
};

macro_rules! columns {
    () => {
        "id, provider, event_id, event_type, payload, retry_count, last_retried_at, \
         failure_reason, processed, exhausted, created_at, updated_at, deleted_at"
    };
}

/// Repository for webhook event rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns the shared pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a failed webhook row.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` if the provider event was
    /// already recorded.
    pub async fn create(&self, event: &WebhookEvent) -> Result<WebhookEventId> {
        self.create_impl(&*self.pool, event).await
    }

    /// Inserts a failed webhook row within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &WebhookEvent,
    ) -> Result<WebhookEventId> {
        self.create_impl(&mut **tx, event).await
    }

    async fn create_impl<'e, E>(&self, executor: E, event: &WebhookEvent) -> Result<WebhookEventId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO webhook_events (
                id, provider, event_id, event_type, payload, retry_count, last_retried_at,
                failure_reason, processed, exhausted, created_at, updated_at, deleted_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING id
            "#,
        )
        .bind(event.id)
        .bind(&event.provider)
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.retry_count)
        .bind(event.last_retried_at)
        .bind(&event.failure_reason)
        .bind(event.processed)
        .bind(event.exhausted)
        .bind(event.created_at)
        .bind(event.updated_at)
        .bind(event.deleted_at)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }

    /// Finds a row by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: WebhookEventId) -> Result<Option<WebhookEvent>> {
        let event = sqlx::query_as::<_, WebhookEvent>(concat!(
            "SELECT ",
            columns!(),
            " FROM webhook_events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }

    /// Loads up to `batch_size` non-terminal rows, oldest first.
    ///
    /// Rows whose retry count already reached the budget are included so the
    /// caller can dead-letter them instead of leaving them stranded.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_retry_candidates(&self, batch_size: usize) -> Result<Vec<WebhookEvent>> {
        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);

        let events = sqlx::query_as::<_, WebhookEvent>(concat!(
            "SELECT ",
            columns!(),
            " FROM webhook_events
              WHERE processed = FALSE
                AND exhausted = FALSE
                AND deleted_at IS NULL
              ORDER BY created_at ASC, id ASC
              LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(events)
    }

    /// Flags a row as dead-lettered.
    ///
    /// Returns the updated row, or `None` if it was already terminal.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn mark_exhausted(
        &self,
        id: WebhookEventId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>> {
        let mut tx = self.pool.begin().await?;
        let updated = self.mark_exhausted_in_tx(&mut tx, id, reason, at).await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Flags a row as dead-lettered within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the row lock or update fails.
    pub async fn mark_exhausted_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: WebhookEventId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>> {
        if !Self::lock_open_row(tx, id).await? {
            return Ok(None);
        }

        let event = sqlx::query_as::<_, WebhookEvent>(concat!(
            "UPDATE webhook_events
                SET exhausted = TRUE,
                    failure_reason = $2,
                    updated_at = $3
              WHERE id = $1
              RETURNING ",
            columns!()
        ))
        .bind(id)
        .bind(reason)
        .bind(at)
        .fetch_one(&mut **tx)
        .await?;

        Ok(Some(event))
    }

    /// Records a successful reprocessing.
    ///
    /// Sets `processed`, bumps `retry_count`, stamps `last_retried_at` and
    /// clears the failure reason. Returns `None` if the row was already
    /// terminal.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn record_success(
        &self,
        id: WebhookEventId,
        at: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>> {
        let mut tx = self.pool.begin().await?;
        let updated = self.record_success_in_tx(&mut tx, id, at).await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Records a successful reprocessing within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the row lock or update fails.
    pub async fn record_success_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: WebhookEventId,
        at: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>> {
        if !Self::lock_open_row(tx, id).await? {
            return Ok(None);
        }

        let event = sqlx::query_as::<_, WebhookEvent>(concat!(
            "UPDATE webhook_events
                SET processed = TRUE,
                    retry_count = retry_count + 1,
                    last_retried_at = $2,
                    failure_reason = NULL,
                    updated_at = $2
              WHERE id = $1
              RETURNING ",
            columns!()
        ))
        .bind(id)
        .bind(at)
        .fetch_one(&mut **tx)
        .await?;

        Ok(Some(event))
    }

    /// Records a failed reprocessing attempt.
    ///
    /// Bumps `retry_count`, stamps `last_retried_at` and stores `reason`.
    /// Returns `None` if the row was already terminal.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn record_failure(
        &self,
        id: WebhookEventId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>> {
        let mut tx = self.pool.begin().await?;
        let updated = self.record_failure_in_tx(&mut tx, id, reason, at).await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Records a failed reprocessing attempt within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the row lock or update fails.
    pub async fn record_failure_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: WebhookEventId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>> {
        if !Self::lock_open_row(tx, id).await? {
            return Ok(None);
        }

        let event = sqlx::query_as::<_, WebhookEvent>(concat!(
            "UPDATE webhook_events
                SET retry_count = retry_count + 1,
                    last_retried_at = $3,
                    failure_reason = $2,
                    updated_at = $3
              WHERE id = $1
              RETURNING ",
            columns!()
        ))
        .bind(id)
        .bind(reason)
        .bind(at)
        .fetch_one(&mut **tx)
        .await?;

        Ok(Some(event))
    }

    /// Locks the row and reports whether it is still open for outcomes.
    async fn lock_open_row(
        tx: &mut Transaction<'_, Postgres>,
        id: WebhookEventId,
    ) -> Result<bool> {
        let open: Option<bool> = sqlx::query_scalar(
            r#"
            SELECT NOT (processed OR exhausted OR deleted_at IS NOT NULL)
            FROM webhook_events
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(open.unwrap_or(false))
    }
}
