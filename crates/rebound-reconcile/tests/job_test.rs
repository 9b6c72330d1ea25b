//! Integration tests for the reconciliation job against in-memory seams.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rebound_core::{
    events::mock::RecordingPublisher, LifecycleTopic, TestClock, WebhookEvent,
};
use rebound_reconcile::{
    lock::mock::InMemoryLock, store::mock::MockWebhookStore, ProviderError, ProviderRegistry,
    ReconcileConfig, ReconcileError, ReconcileReport, ReconciliationJob, WebhookProvider,
};
use serde_json::json;

/// Provider whose outcome is scripted per event id and which records every
/// event it was asked to reprocess.
#[derive(Debug, Default)]
struct ScriptedProvider {
    failures: Mutex<HashMap<String, String>>,
    panics_on: Mutex<Option<String>>,
    circuit_open: Mutex<bool>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    fn fail(&self, event_id: &str, message: &str) {
        self.failures.lock().unwrap().insert(event_id.to_string(), message.to_string());
    }

    fn panic_on(&self, event_id: &str) {
        *self.panics_on.lock().unwrap() = Some(event_id.to_string());
    }

    fn open_circuit(&self) {
        *self.circuit_open.lock().unwrap() = true;
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebhookProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "stripe"
    }

    async fn reprocess(&self, event: &WebhookEvent) -> Result<(), ProviderError> {
        self.calls.lock().unwrap().push(event.event_id.clone());
        let panics = self.panics_on.lock().unwrap().as_deref() == Some(event.event_id.as_str());
        if panics {
            panic!("handler blew up on {}", event.event_id);
        }
        if *self.circuit_open.lock().unwrap() {
            let open = ProviderError::CircuitOpen { name: "stripe".to_string() };
            return Err(ProviderError::RetriesExhausted { attempts: 3, source: Box::new(open) });
        }
        match self.failures.lock().unwrap().get(&event.event_id) {
            Some(message) => Err(ProviderError::handler(message.clone())),
            None => Ok(()),
        }
    }
}

struct Fixture {
    clock: TestClock,
    store: Arc<MockWebhookStore>,
    lock: Arc<InMemoryLock>,
    provider: Arc<ScriptedProvider>,
    publisher: Arc<RecordingPublisher>,
    config: ReconcileConfig,
}

impl Fixture {
    fn new() -> Self {
        let clock = TestClock::starting_at(base_time());
        Self {
            lock: Arc::new(InMemoryLock::with_clock(Arc::new(clock.clone()))),
            clock,
            store: Arc::new(MockWebhookStore::new()),
            provider: Arc::new(ScriptedProvider::default()),
            publisher: Arc::new(RecordingPublisher::new()),
            config: ReconcileConfig { max_retries: 3, ..ReconcileConfig::default() },
        }
    }

    fn with_publisher(mut self, publisher: RecordingPublisher) -> Self {
        self.publisher = Arc::new(publisher);
        self
    }

    fn job(&self) -> ReconciliationJob {
        ReconciliationJob::new(
            self.config.clone(),
            self.store.clone(),
            self.lock.clone(),
            ProviderRegistry::new().with(self.provider.clone()),
            self.publisher.clone(),
        )
        .with_clock(Arc::new(self.clock.clone()))
    }

    /// Inserts a fresh row received `offset_secs` after the base time.
    async fn insert(&self, event_id: &str, offset_secs: i64) -> WebhookEvent {
        let row = WebhookEvent::new(
            "stripe",
            event_id,
            "invoice.paid",
            json!({ "id": event_id }),
            base_time() + chrono::Duration::seconds(offset_secs),
        );
        self.store.insert(row.clone()).await;
        row
    }

    /// Inserts a row that already failed `retry_count` times, the last one
    /// `minutes_ago` minutes before the clock's current time.
    async fn insert_retried(
        &self,
        event_id: &str,
        retry_count: i32,
        minutes_ago: i64,
    ) -> WebhookEvent {
        let mut row = self.insert(event_id, 0).await;
        row.retry_count = retry_count;
        row.failure_reason = Some("upstream 503".to_string());
        row.last_retried_at = Some(base_time() - chrono::Duration::minutes(minutes_ago));
        self.store.insert(row.clone()).await;
        row
    }
}

fn base_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-06-01T09:00:00Z").unwrap().with_timezone(&Utc)
}

/// A fresh row that reprocesses cleanly is marked processed and announced.
#[tokio::test]
async fn successful_reprocessing_marks_row_processed() -> Result<()> {
    let fx = Fixture::new();
    let row = fx.insert("evt_ok", 0).await;

    let report = fx.job().run().await?;

    assert_eq!(
        report,
        ReconcileReport { processed: 1, retried: 1, succeeded: 1, ..Default::default() }
    );
    let stored = fx.store.get(row.id).await.unwrap();
    assert!(stored.processed);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.last_retried_at, Some(base_time()));

    let processed = fx.publisher.on_topic(LifecycleTopic::Processed).await;
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].webhook_id, row.id);
    assert_eq!(processed[0].reason, None);
    Ok(())
}

/// A failed reprocessing bumps the count, stores the reason and publishes a
/// retrying event; the row stays a candidate.
#[tokio::test]
async fn failed_reprocessing_records_reason() -> Result<()> {
    let fx = Fixture::new();
    let row = fx.insert("evt_bad", 0).await;
    fx.provider.fail("evt_bad", "ledger unavailable");

    let report = fx.job().run().await?;

    assert_eq!(
        report,
        ReconcileReport { processed: 1, retried: 1, failed: 1, ..Default::default() }
    );
    let stored = fx.store.get(row.id).await.unwrap();
    assert!(!stored.processed && !stored.exhausted);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.failure_reason.as_deref(), Some("handler failed: ledger unavailable"));

    let retrying = fx.publisher.on_topic(LifecycleTopic::Retrying).await;
    assert_eq!(retrying.len(), 1);
    assert_eq!(retrying[0].retry_count, 1);
    Ok(())
}

/// A row whose budget is spent is dead-lettered without its side effect
/// ever being invoked.
#[tokio::test]
async fn over_budget_row_is_dead_lettered_without_reprocessing() -> Result<()> {
    let fx = Fixture::new();
    let row = fx.insert_retried("evt_spent", 3, 600).await;

    let report = fx.job().run().await?;

    assert_eq!(report, ReconcileReport { processed: 1, exhausted: 1, ..Default::default() });
    assert!(fx.provider.calls().is_empty());

    let stored = fx.store.get(row.id).await.unwrap();
    assert!(stored.exhausted);
    assert_eq!(stored.retry_count, 3);
    let reason = stored.failure_reason.unwrap();
    assert!(reason.contains("retry budget of 3 exhausted"));
    assert!(reason.contains("upstream 503"));

    let dead = fx.publisher.on_topic(LifecycleTopic::DeadLettered).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].webhook_id, row.id);
    Ok(())
}

/// The failure that spends the last attempt leaves the row a candidate, and
/// the next run dead-letters it.
#[tokio::test]
async fn last_failure_is_dead_lettered_on_following_run() -> Result<()> {
    let fx = Fixture::new();
    let row = fx.insert_retried("evt_last", 2, 600).await;
    fx.provider.fail("evt_last", "still broken");

    let first = fx.job().run().await?;
    assert_eq!(first.failed, 1);
    assert_eq!(fx.store.get(row.id).await.unwrap().retry_count, 3);

    let second = fx.job().run().await?;
    assert_eq!(second.exhausted, 1);
    assert_eq!(fx.provider.calls(), vec!["evt_last"]);
    assert!(fx.store.get(row.id).await.unwrap().exhausted);
    Ok(())
}

/// A row still inside its backoff window is counted as deferred and failed
/// but is not touched.
#[tokio::test]
async fn row_inside_backoff_window_is_deferred() -> Result<()> {
    let fx = Fixture::new();
    // Two failures so far: next attempt due two minutes after the last.
    let row = fx.insert_retried("evt_early", 2, 1).await;

    let report = fx.job().run().await?;

    assert_eq!(
        report,
        ReconcileReport { processed: 1, failed: 1, deferred: 1, ..Default::default() }
    );
    assert!(fx.provider.calls().is_empty());
    assert!(fx.publisher.events().await.is_empty());

    let stored = fx.store.get(row.id).await.unwrap();
    assert_eq!(stored.retry_count, 2);
    assert_eq!(stored.last_retried_at, row.last_retried_at);

    fx.clock.advance(Duration::from_secs(60));
    let later = fx.job().run().await?;
    assert_eq!(later.succeeded, 1);
    Ok(())
}

/// Another instance holding the lock means a skipped run that never reads
/// the store.
#[tokio::test]
async fn held_lock_skips_run_without_querying() -> Result<()> {
    let fx = Fixture::new();
    fx.insert("evt_waiting", 0).await;
    fx.lock.hold(&fx.config.lock_key, "other-instance", Duration::from_secs(60)).await;

    let report = fx.job().run().await?;

    assert_eq!(report, ReconcileReport::skipped());
    assert_eq!(fx.store.query_calls(), 0);
    assert_eq!(fx.lock.release_calls(), 0);
    assert_eq!(fx.lock.holder(&fx.config.lock_key).await.as_deref(), Some("other-instance"));
    Ok(())
}

/// An expired lock left by a crashed run is taken over.
#[tokio::test]
async fn expired_lock_is_taken_over() -> Result<()> {
    let fx = Fixture::new();
    fx.insert("evt_waiting", 0).await;
    fx.lock.hold(&fx.config.lock_key, "crashed", Duration::from_secs(60)).await;
    fx.clock.advance(Duration::from_secs(61));

    let report = fx.job().run().await?;

    assert!(!report.skipped);
    assert_eq!(report.succeeded, 1);
    assert_eq!(fx.lock.holder(&fx.config.lock_key).await, None);
    Ok(())
}

/// A write failure on one row is counted and the batch carries on.
#[tokio::test]
async fn row_error_does_not_stop_batch() -> Result<()> {
    let fx = Fixture::new();
    let broken = fx.insert("evt_1", 0).await;
    let healthy = fx.insert("evt_2", 1).await;
    fx.store.fail_writes_for(broken.id).await;

    let report = fx.job().run().await?;

    assert_eq!(report.processed, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.succeeded, 1);
    assert!(fx.store.get(healthy.id).await.unwrap().processed);
    assert_eq!(fx.provider.calls(), vec!["evt_1", "evt_2"]);
    Ok(())
}

/// A failing candidate query aborts the run but still releases the lock.
#[tokio::test]
async fn lock_is_released_when_query_fails() {
    let fx = Fixture::new();
    fx.store.inject_query_error("connection reset").await;

    let result = fx.job().run().await;

    assert!(matches!(result, Err(ReconcileError::Storage(_))));
    assert_eq!(fx.lock.release_calls(), 1);
    assert_eq!(fx.lock.holder(&fx.config.lock_key).await, None);
}

/// A lock service failure skips the run like a held lock.
#[tokio::test]
async fn lock_failure_skips_run() -> Result<()> {
    let fx = Fixture::new();
    fx.insert("evt_waiting", 0).await;
    fx.lock.inject_acquire_error("lock table missing").await;

    let report = fx.job().run().await?;

    assert_eq!(report, ReconcileReport::skipped());
    assert_eq!(fx.store.query_calls(), 0);
    assert_eq!(fx.lock.release_calls(), 0);
    Ok(())
}

/// A row that panics is recorded as a failed attempt, the rows after it
/// still run, and it is dead-lettered once its budget is spent.
#[tokio::test]
async fn panicking_row_fails_alone_and_is_eventually_dead_lettered() -> Result<()> {
    let fx = Fixture::new();
    let boom = fx.insert("evt_boom", 0).await;
    let healthy = fx.insert("evt_fine", 1).await;
    fx.provider.panic_on("evt_boom");

    let first = fx.job().run().await?;

    assert_eq!(
        first,
        ReconcileReport { processed: 2, retried: 2, succeeded: 1, failed: 1, ..Default::default() }
    );
    assert!(fx.store.get(healthy.id).await.unwrap().processed);
    assert_eq!(fx.lock.holder(&fx.config.lock_key).await, None);

    let stored = fx.store.get(boom.id).await.unwrap();
    assert_eq!(stored.retry_count, 1);
    assert!(stored.failure_reason.unwrap().starts_with("panicked: handler blew up on evt_boom"));
    assert_eq!(fx.publisher.on_topic(LifecycleTopic::Retrying).await.len(), 1);

    for _ in 1..fx.config.max_retries {
        fx.clock.advance(Duration::from_secs(2 * 3600));
        fx.job().run().await?;
    }
    assert_eq!(fx.store.get(boom.id).await.unwrap().retry_count, 3);

    fx.clock.advance(Duration::from_secs(2 * 3600));
    let last = fx.job().run().await?;

    assert_eq!(last.exhausted, 1);
    let stored = fx.store.get(boom.id).await.unwrap();
    assert!(stored.exhausted);
    assert!(stored.failure_reason.unwrap().contains("panicked"));
    Ok(())
}

/// An open provider breaker defers rows without spending their budget.
#[tokio::test]
async fn open_circuit_defers_without_recording_failure() -> Result<()> {
    let fx = Fixture::new();
    let row = fx.insert("evt_blocked", 0).await;
    fx.provider.open_circuit();

    let report = fx.job().run().await?;

    assert_eq!(
        report,
        ReconcileReport { processed: 1, failed: 1, deferred: 1, ..Default::default() }
    );
    let stored = fx.store.get(row.id).await.unwrap();
    assert_eq!(stored.retry_count, 0);
    assert_eq!(stored.last_retried_at, None);
    assert_eq!(stored.failure_reason, None);
    assert!(fx.publisher.events().await.is_empty());
    Ok(())
}

/// Rows are handled oldest first and no more than the batch size per run.
#[tokio::test]
async fn rows_are_processed_oldest_first_within_batch() -> Result<()> {
    let mut fx = Fixture::new();
    fx.config.batch_size = 2;
    fx.insert("evt_c", 30).await;
    fx.insert("evt_a", 10).await;
    fx.insert("evt_b", 20).await;

    let report = fx.job().run().await?;

    assert_eq!(report.processed, 2);
    assert_eq!(fx.provider.calls(), vec!["evt_a", "evt_b"]);

    fx.job().run().await?;
    assert_eq!(fx.provider.calls(), vec!["evt_a", "evt_b", "evt_c"]);
    Ok(())
}

/// Rows for a provider nobody registered follow the failure path.
#[tokio::test]
async fn unknown_provider_counts_as_failure() -> Result<()> {
    let fx = Fixture::new();
    let mut row = fx.insert("evt_paypal", 0).await;
    row.provider = "paypal".to_string();
    fx.store.insert(row.clone()).await;

    let report = fx.job().run().await?;

    assert_eq!(report.failed, 1);
    let stored = fx.store.get(row.id).await.unwrap();
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.failure_reason.as_deref(), Some("no provider registered for 'paypal'"));
    Ok(())
}

/// A publisher outage is logged and does not change the row outcome.
#[tokio::test]
async fn publish_failure_does_not_fail_row() -> Result<()> {
    let fx = Fixture::new().with_publisher(RecordingPublisher::failing());
    let row = fx.insert("evt_ok", 0).await;

    let report = fx.job().run().await?;

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 0);
    assert!(fx.store.get(row.id).await.unwrap().processed);
    assert_eq!(fx.publisher.events().await.len(), 1);
    Ok(())
}

/// Terminal rows are never picked up again.
#[tokio::test]
async fn terminal_rows_are_left_alone() -> Result<()> {
    let fx = Fixture::new();
    fx.insert("evt_once", 0).await;

    fx.job().run().await?;
    let second = fx.job().run().await?;

    assert_eq!(second, ReconcileReport::default());
    assert_eq!(fx.provider.calls(), vec!["evt_once"]);
    Ok(())
}
