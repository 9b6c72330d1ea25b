//! Lock-guarded batch reconciliation of failed webhooks.
//!
//! One run:
//!
//! 1. takes the distributed lock with a fresh token, or returns a skipped
//!    report without touching the store
//! 2. loads the oldest non-terminal rows, up to the batch size
//! 3. per row: dead-letters it if its retry budget is spent, defers it if its
//!    backoff window has not elapsed, otherwise reprocesses it through its
//!    provider and records the outcome
//! 4. releases the lock on every exit path and returns the counters
//!
//! A failure on one row is logged and counted; the batch moves on. A row
//! whose reprocessing panics is recorded as a failed attempt so it works
//! through its retry budget like any other failure. Lifecycle
//! events are published after the outcome is committed and a publish failure
//! never changes the row.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use rebound_core::{
    Clock, EventPublisher, LifecycleEvent, LifecycleTopic, RealClock, WebhookEvent,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::ReconcileConfig,
    error::{ProviderError, ReconcileError, Result},
    lock::DistributedLock,
    provider::ProviderRegistry,
    store::WebhookStore,
};

/// Counters describing one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Rows examined.
    pub processed: u32,
    /// Rows whose reprocessing was attempted.
    pub retried: u32,
    /// Rows reprocessed successfully.
    pub succeeded: u32,
    /// Rows that failed this cycle, deferred rows included.
    pub failed: u32,
    /// Rows dead-lettered this cycle.
    pub exhausted: u32,
    /// Rows left untouched because their backoff window had not elapsed or
    /// their provider's breaker was open.
    pub deferred: u32,
    /// True when another instance held the lock and nothing ran.
    pub skipped: bool,
}

impl ReconcileReport {
    /// Report for a run that did not get the lock.
    pub fn skipped() -> Self {
        Self { skipped: true, ..Self::default() }
    }
}

/// What happened to a single row.
enum RowOutcome {
    Exhausted,
    Deferred,
    Succeeded,
    Failed,
    /// The row turned terminal between the query and the write.
    AlreadyTerminal,
}

/// Batch job draining failed webhook rows.
pub struct ReconciliationJob {
    config: ReconcileConfig,
    store: Arc<dyn WebhookStore>,
    lock: Arc<dyn DistributedLock>,
    providers: ProviderRegistry,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
}

impl ReconciliationJob {
    /// Creates a job on the real clock.
    pub fn new(
        config: ReconcileConfig,
        store: Arc<dyn WebhookStore>,
        lock: Arc<dyn DistributedLock>,
        providers: ProviderRegistry,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self { config, store, lock, providers, publisher, clock: RealClock::shared() }
    }

    /// Replaces the clock used for eligibility and timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Job configuration.
    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Executes one run.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Storage` if the candidate query fails and
    /// `ReconcileError::Panicked` if the batch panicked outside row
    /// processing. The lock is released before either is returned. Not
    /// getting the lock, including a lock service failure, is a skipped run.
    pub async fn run(&self) -> Result<ReconcileReport> {
        let key = self.config.lock_key.as_str();
        let token = format!("{}-{}", std::process::id(), Uuid::new_v4());

        match self.lock.acquire(key, self.config.lock_ttl, &token).await {
            Ok(true) => {},
            Ok(false) => {
                info!(lock_key = key, "reconciliation skipped, lock held by another instance");
                return Ok(ReconcileReport::skipped());
            },
            Err(e) => {
                warn!(lock_key = key, error = %e, "reconciliation skipped, lock acquire failed");
                return Ok(ReconcileReport::skipped());
            },
        }

        debug!(lock_key = key, token = %token, "reconciliation lock acquired");

        let outcome = AssertUnwindSafe(self.run_batch()).catch_unwind().await;

        match self.lock.release(key, &token).await {
            Ok(true) => debug!(lock_key = key, "reconciliation lock released"),
            Ok(false) => warn!(lock_key = key, "reconciliation lock expired before release"),
            Err(e) => error!(lock_key = key, error = %e, "failed to release reconciliation lock"),
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "reconciliation batch panicked");
                Err(ReconcileError::Panicked { message })
            },
        }
    }

    async fn run_batch(&self) -> Result<ReconcileReport> {
        let rows = self.store.find_retry_candidates(self.config.batch_size).await?;
        let mut report = ReconcileReport::default();

        for row in &rows {
            report.processed += 1;

            let result = match AssertUnwindSafe(self.process_row(row)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => self.record_panic(row, &panic_message(panic.as_ref())).await,
            };

            match result {
                Ok(RowOutcome::Exhausted) => report.exhausted += 1,
                Ok(RowOutcome::Deferred) => {
                    report.deferred += 1;
                    report.failed += 1;
                },
                Ok(RowOutcome::Succeeded) => {
                    report.retried += 1;
                    report.succeeded += 1;
                },
                Ok(RowOutcome::Failed) => {
                    report.retried += 1;
                    report.failed += 1;
                },
                Ok(RowOutcome::AlreadyTerminal) => {},
                Err(e) => {
                    report.failed += 1;
                    error!(
                        webhook_id = %row.id,
                        provider = %row.provider,
                        event_id = %row.event_id,
                        error = %e,
                        "failed to reconcile webhook"
                    );
                },
            }
        }

        info!(
            processed = report.processed,
            retried = report.retried,
            succeeded = report.succeeded,
            failed = report.failed,
            exhausted = report.exhausted,
            deferred = report.deferred,
            "reconciliation run complete"
        );

        Ok(report)
    }

    async fn process_row(&self, row: &WebhookEvent) -> Result<RowOutcome> {
        let now = self.clock.now_utc();

        if row.is_over_budget(self.config.max_retries) {
            return self.dead_letter(row, now).await;
        }

        if !self.is_eligible(row, now) {
            debug!(
                webhook_id = %row.id,
                retry_count = row.retry_count,
                "webhook not yet due for retry"
            );
            return Ok(RowOutcome::Deferred);
        }

        let attempt = match self.providers.get(&row.provider) {
            Some(provider) => provider.reprocess(row).await,
            None => Err(ProviderError::UnknownProvider { provider: row.provider.clone() }),
        };
        let recorded_at = self.clock.now_utc();

        if let Err(failure) = &attempt {
            if failure.is_circuit_open() {
                debug!(
                    webhook_id = %row.id,
                    provider = %row.provider,
                    error = %failure,
                    "provider circuit open, webhook deferred"
                );
                return Ok(RowOutcome::Deferred);
            }
        }

        match attempt {
            Ok(()) => {
                let Some(updated) = self.store.record_success(row.id, recorded_at).await? else {
                    return Ok(RowOutcome::AlreadyTerminal);
                };
                info!(webhook_id = %row.id, event_id = %row.event_id, "webhook reconciled");
                self.publish(LifecycleTopic::Processed, &updated, None, recorded_at).await;
                Ok(RowOutcome::Succeeded)
            },
            Err(failure) => {
                let reason = failure.to_string();
                let Some(updated) =
                    self.store.record_failure(row.id, reason.clone(), recorded_at).await?
                else {
                    return Ok(RowOutcome::AlreadyTerminal);
                };
                warn!(
                    webhook_id = %row.id,
                    event_id = %row.event_id,
                    retry_count = updated.retry_count,
                    error = %reason,
                    "webhook reprocessing failed"
                );
                self.publish(LifecycleTopic::Retrying, &updated, Some(reason), recorded_at).await;
                Ok(RowOutcome::Failed)
            },
        }
    }

    /// Records a panic during reprocessing as a failed attempt.
    async fn record_panic(&self, row: &WebhookEvent, message: &str) -> Result<RowOutcome> {
        let reason = format!("panicked: {message}");
        let recorded_at = self.clock.now_utc();
        error!(
            webhook_id = %row.id,
            event_id = %row.event_id,
            panic = %message,
            "webhook reprocessing panicked"
        );

        let Some(updated) = self.store.record_failure(row.id, reason.clone(), recorded_at).await?
        else {
            return Ok(RowOutcome::AlreadyTerminal);
        };
        self.publish(LifecycleTopic::Retrying, &updated, Some(reason), recorded_at).await;
        Ok(RowOutcome::Failed)
    }

    async fn dead_letter(&self, row: &WebhookEvent, now: DateTime<Utc>) -> Result<RowOutcome> {
        let reason = match &row.failure_reason {
            Some(last) => {
                format!("retry budget of {} exhausted; last error: {last}", self.config.max_retries)
            },
            None => format!("retry budget of {} exhausted", self.config.max_retries),
        };

        let Some(updated) = self.store.mark_exhausted(row.id, reason.clone(), now).await? else {
            return Ok(RowOutcome::AlreadyTerminal);
        };

        warn!(
            webhook_id = %row.id,
            provider = %row.provider,
            event_id = %row.event_id,
            retry_count = row.retry_count,
            "webhook dead-lettered"
        );
        self.publish(LifecycleTopic::DeadLettered, &updated, Some(reason), now).await;
        Ok(RowOutcome::Exhausted)
    }

    /// A row with no prior retry is always due; otherwise it is due once
    /// `last_retried_at + capped_delay(retry_count)` has passed.
    fn is_eligible(&self, row: &WebhookEvent, now: DateTime<Utc>) -> bool {
        let Some(last_retried_at) = row.last_retried_at else {
            return true;
        };

        let wait = self.config.eligibility_backoff.capped_delay(row.attempts().max(1));
        chrono::Duration::from_std(wait)
            .ok()
            .and_then(|wait| last_retried_at.checked_add_signed(wait))
            .is_some_and(|due_at| due_at <= now)
    }

    async fn publish(
        &self,
        topic: LifecycleTopic,
        row: &WebhookEvent,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) {
        let event = LifecycleEvent::from_webhook(row, reason, at);
        if let Err(e) = self.publisher.publish(topic, event).await {
            warn!(
                webhook_id = %row.id,
                topic = %topic,
                error = %e,
                "failed to publish lifecycle event"
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use rebound_core::{events::mock::RecordingPublisher, TestClock};
    use serde_json::json;

    use super::*;
    use crate::{lock::mock::InMemoryLock, store::mock::MockWebhookStore};

    fn job_with(clock: &TestClock) -> ReconciliationJob {
        ReconciliationJob::new(
            ReconcileConfig::default(),
            Arc::new(MockWebhookStore::new()),
            Arc::new(InMemoryLock::new()),
            ProviderRegistry::new(),
            Arc::new(RecordingPublisher::new()),
        )
        .with_clock(Arc::new(clock.clone()))
    }

    fn retried(minutes_ago: i64, retry_count: i32, now: DateTime<Utc>) -> WebhookEvent {
        let mut row = WebhookEvent::new("stripe", "evt_1", "charge.refunded", json!({}), now);
        row.retry_count = retry_count;
        row.last_retried_at = Some(now - chrono::Duration::minutes(minutes_ago));
        row
    }

    #[test]
    fn never_retried_rows_are_always_eligible() {
        let clock = TestClock::new();
        let job = job_with(&clock);
        let row =
            WebhookEvent::new("stripe", "evt_1", "charge.refunded", json!({}), clock.now_utc());

        assert!(job.is_eligible(&row, clock.now_utc()));
    }

    #[test]
    fn eligibility_follows_capped_schedule() {
        let clock = TestClock::new();
        let job = job_with(&clock);
        let now = clock.now_utc();

        // Default schedule: 1, 2, 4, 8 ... minutes, capped at one hour.
        assert!(!job.is_eligible(&retried(0, 1, now), now));
        assert!(job.is_eligible(&retried(1, 1, now), now));
        assert!(!job.is_eligible(&retried(3, 3, now), now));
        assert!(job.is_eligible(&retried(4, 3, now), now));
        assert!(!job.is_eligible(&retried(59, 20, now), now));
        assert!(job.is_eligible(&retried(60, 20, now), now));
    }

    #[test]
    fn skipped_report_has_zero_counters() {
        let report = ReconcileReport::skipped();
        assert!(report.skipped);
        assert_eq!(ReconcileReport { skipped: false, ..report }, ReconcileReport::default());
    }

    #[test]
    fn report_serializes_all_counters() {
        let report =
            ReconcileReport { processed: 3, failed: 1, deferred: 1, ..Default::default() };
        let value = serde_json::to_value(report).unwrap();
        assert_eq!(value["processed"], 3);
        assert_eq!(value["deferred"], 1);
        assert_eq!(value["skipped"], false);
    }
}
