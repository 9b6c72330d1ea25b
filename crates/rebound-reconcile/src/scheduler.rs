//! Periodic driver for the reconciliation job.

use std::{sync::Arc, time::Duration};

use rebound_core::{Clock, RealClock};
use rebound_resilience::Backoff;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::job::{ReconcileReport, ReconciliationJob};

/// Timing of scheduled runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Wait between the end of one run and the start of the next.
    pub interval: Duration,
    /// Wait after a failed run, grown per consecutive failure and capped at
    /// `interval` when that is larger.
    pub failure_backoff: Backoff,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            failure_backoff: Backoff {
                initial_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(300),
                multiplier: 2.0,
                jitter: true,
            },
        }
    }
}

/// Totals over the lifetime of a scheduler loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Runs started.
    pub runs: u64,
    /// Runs that returned an error.
    pub failures: u64,
    /// Runs skipped because another instance held the lock.
    pub skipped: u64,
}

/// Runs a [`ReconciliationJob`] immediately and then on every interval until
/// cancelled. Runs never overlap within one scheduler.
pub struct Scheduler {
    job: Arc<ReconciliationJob>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    /// Creates a scheduler sleeping on the real clock.
    pub fn new(job: Arc<ReconciliationJob>, config: SchedulerConfig) -> Self {
        Self { job, config, clock: RealClock::shared() }
    }

    /// Replaces the clock used for waits between runs.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Executes a single run outside the loop.
    ///
    /// # Errors
    ///
    /// Propagates the job error.
    pub async fn run_once(&self) -> crate::Result<ReconcileReport> {
        self.job.run().await
    }

    /// Loops until `cancel` fires. A run in progress is finished before the
    /// loop exits; only the wait between runs is interrupted.
    pub async fn run(&self, cancel: CancellationToken) -> SchedulerStats {
        let mut stats = SchedulerStats::default();
        let mut consecutive_failures = 0u32;

        info!(interval_secs = self.config.interval.as_secs(), "reconciliation scheduler started");

        while !cancel.is_cancelled() {
            stats.runs += 1;

            let wait = match self.job.run().await {
                Ok(report) => {
                    consecutive_failures = 0;
                    if report.skipped {
                        stats.skipped += 1;
                    }
                    self.config.interval
                },
                Err(e) => {
                    stats.failures += 1;
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    let wait = self.failure_delay(consecutive_failures);
                    error!(
                        error = %e,
                        consecutive_failures,
                        retry_in_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                        "reconciliation run failed"
                    );
                    wait
                },
            };

            tokio::select! {
                () = self.clock.sleep(wait) => {},
                () = cancel.cancelled() => break,
            }
        }

        info!(runs = stats.runs, failures = stats.failures, "reconciliation scheduler stopped");
        stats
    }

    fn failure_delay(&self, consecutive_failures: u32) -> Duration {
        self.config.failure_backoff.delay(consecutive_failures).min(self.config.interval.max(
            self.config.failure_backoff.initial_delay,
        ))
    }
}

#[cfg(test)]
mod tests {
    use rebound_core::events::NoOpPublisher;

    use super::*;
    use crate::{
        config::ReconcileConfig, lock::mock::InMemoryLock, provider::ProviderRegistry,
        store::mock::MockWebhookStore,
    };

    fn scheduler(config: SchedulerConfig) -> Scheduler {
        let job = ReconciliationJob::new(
            ReconcileConfig::default(),
            Arc::new(MockWebhookStore::new()),
            Arc::new(InMemoryLock::new()),
            ProviderRegistry::new(),
            Arc::new(NoOpPublisher),
        );
        Scheduler::new(Arc::new(job), config)
    }

    #[test]
    fn failure_delay_never_exceeds_interval() {
        let config = SchedulerConfig {
            interval: Duration::from_secs(30),
            failure_backoff: Backoff::exponential(Duration::from_secs(5), Duration::from_secs(300)),
        };
        let scheduler = scheduler(config);

        assert_eq!(scheduler.failure_delay(1), Duration::from_secs(5));
        assert_eq!(scheduler.failure_delay(2), Duration::from_secs(10));
        assert_eq!(scheduler.failure_delay(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn pre_cancelled_token_runs_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = scheduler(SchedulerConfig::default()).run(cancel).await;

        assert_eq!(stats, SchedulerStats::default());
    }
}
