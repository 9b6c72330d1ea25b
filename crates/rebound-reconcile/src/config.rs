//! Settings for a reconciliation run.

use std::time::Duration;

use rebound_resilience::Backoff;
use serde::{Deserialize, Serialize};

/// Reconciliation job configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Maximum rows examined per run.
    pub batch_size: usize,
    /// Reprocessing attempts before a row is dead-lettered.
    pub max_retries: u32,
    /// Name of the distributed lock guarding runs.
    pub lock_key: String,
    /// How long a run may hold the lock before others can take over.
    pub lock_ttl: Duration,
    /// Schedule deciding when a previously failed row is due again.
    ///
    /// Only the jitter-free value is used, so eligibility is deterministic.
    pub eligibility_backoff: Backoff,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retries: 5,
            lock_key: "reconcile:webhook-events".to_string(),
            lock_ttl: Duration::from_secs(300),
            eligibility_backoff: Backoff::exponential(
                Duration::from_secs(60),
                Duration::from_secs(3600),
            ),
        }
    }
}
