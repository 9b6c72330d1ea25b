//! Storage abstraction for the reconciliation job.
//!
//! The job only needs four operations on webhook rows. Production uses the
//! PostgreSQL repositories from `rebound-core`, where every outcome write is
//! its own transaction that locks the row and refuses to touch terminal
//! rows. Tests use the in-memory [`mock::MockWebhookStore`].

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use rebound_core::{
    error::Result,
    models::{WebhookEvent, WebhookEventId},
    storage::Storage,
};

/// Webhook row operations required by the reconciliation job.
///
/// Outcome writes return the updated row, or `None` when the row had already
/// reached a terminal state and was left untouched.
pub trait WebhookStore: Send + Sync + 'static {
    /// Loads up to `batch_size` non-terminal rows, oldest first.
    fn find_retry_candidates(
        &self,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<WebhookEvent>>> + Send + '_>>;

    /// Dead-letters a row.
    fn mark_exhausted(
        &self,
        id: WebhookEventId,
        reason: String,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookEvent>>> + Send + '_>>;

    /// Records a confirmed successful reprocessing.
    fn record_success(
        &self,
        id: WebhookEventId,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookEvent>>> + Send + '_>>;

    /// Records a failed reprocessing attempt.
    fn record_failure(
        &self,
        id: WebhookEventId,
        reason: String,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookEvent>>> + Send + '_>>;
}

/// Production store over the PostgreSQL repositories.
pub struct PostgresWebhookStore {
    storage: Arc<Storage>,
}

impl PostgresWebhookStore {
    /// Creates a store backed by `storage`.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl WebhookStore for PostgresWebhookStore {
    fn find_retry_candidates(
        &self,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<WebhookEvent>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhook_events.find_retry_candidates(batch_size).await })
    }

    fn mark_exhausted(
        &self,
        id: WebhookEventId,
        reason: String,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookEvent>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhook_events.mark_exhausted(id, &reason, at).await })
    }

    fn record_success(
        &self,
        id: WebhookEventId,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookEvent>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhook_events.record_success(id, at).await })
    }

    fn record_failure(
        &self,
        id: WebhookEventId,
        reason: String,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookEvent>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhook_events.record_failure(id, &reason, at).await })
    }
}

pub mod mock {
    //! In-memory webhook store for testing job logic without a database.
    //!
    //! Mirrors the PostgreSQL semantics: candidates exclude terminal rows and
    //! are ordered by `created_at` then id, and outcome writes on terminal
    //! rows are no-ops returning `None`. Supports injecting a query error and
    //! per-row write errors.

    use std::{
        collections::{HashMap, HashSet},
        future::Future,
        pin::Pin,
        sync::atomic::{AtomicU32, Ordering},
    };

    use chrono::{DateTime, Utc};
    use rebound_core::{error::Result, CoreError};
    use tokio::sync::RwLock;

    use super::{WebhookEvent, WebhookEventId, WebhookStore};

    /// Mock store holding rows in memory.
    #[derive(Debug, Default)]
    pub struct MockWebhookStore {
        rows: RwLock<HashMap<WebhookEventId, WebhookEvent>>,
        query_error: RwLock<Option<String>>,
        failing_writes: RwLock<HashSet<WebhookEventId>>,
        query_calls: AtomicU32,
    }

    impl MockWebhookStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Inserts or replaces a row.
        pub async fn insert(&self, event: WebhookEvent) {
            self.rows.write().await.insert(event.id, event);
        }

        /// Returns a row by id.
        pub async fn get(&self, id: WebhookEventId) -> Option<WebhookEvent> {
            self.rows.read().await.get(&id).cloned()
        }

        /// Makes the next candidate query fail.
        pub async fn inject_query_error(&self, message: impl Into<String>) {
            *self.query_error.write().await = Some(message.into());
        }

        /// Makes every outcome write for `id` fail with a database error.
        pub async fn fail_writes_for(&self, id: WebhookEventId) {
            self.failing_writes.write().await.insert(id);
        }

        /// Number of candidate queries issued.
        pub fn query_calls(&self) -> u32 {
            self.query_calls.load(Ordering::Acquire)
        }

        async fn update<F>(&self, id: WebhookEventId, apply: F) -> Result<Option<WebhookEvent>>
        where
            F: FnOnce(&mut WebhookEvent) + Send,
        {
            if self.failing_writes.read().await.contains(&id) {
                return Err(CoreError::Database(format!("injected write failure for {id}")));
            }

            let mut rows = self.rows.write().await;
            let Some(row) = rows.get_mut(&id) else {
                return Ok(None);
            };
            if row.is_terminal() {
                return Ok(None);
            }

            apply(row);
            Ok(Some(row.clone()))
        }
    }

    impl WebhookStore for MockWebhookStore {
        fn find_retry_candidates(
            &self,
            batch_size: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<WebhookEvent>>> + Send + '_>> {
            Box::pin(async move {
                self.query_calls.fetch_add(1, Ordering::AcqRel);

                let error = self.query_error.write().await.take();
                if let Some(error) = error {
                    return Err(CoreError::Database(error));
                }

                let mut candidates: Vec<WebhookEvent> = self
                    .rows
                    .read()
                    .await
                    .values()
                    .filter(|row| !row.is_terminal())
                    .cloned()
                    .collect();
                candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                candidates.truncate(batch_size);
                Ok(candidates)
            })
        }

        fn mark_exhausted(
            &self,
            id: WebhookEventId,
            reason: String,
            at: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookEvent>>> + Send + '_>> {
            Box::pin(self.update(id, move |row| {
                row.exhausted = true;
                row.failure_reason = Some(reason);
                row.updated_at = at;
            }))
        }

        fn record_success(
            &self,
            id: WebhookEventId,
            at: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookEvent>>> + Send + '_>> {
            Box::pin(self.update(id, move |row| {
                row.processed = true;
                row.retry_count += 1;
                row.last_retried_at = Some(at);
                row.failure_reason = None;
                row.updated_at = at;
            }))
        }

        fn record_failure(
            &self,
            id: WebhookEventId,
            reason: String,
            at: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookEvent>>> + Send + '_>> {
            Box::pin(self.update(id, move |row| {
                row.retry_count += 1;
                row.last_retried_at = Some(at);
                row.failure_reason = Some(reason);
                row.updated_at = at;
            }))
        }
    }
}
