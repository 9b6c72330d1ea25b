//! Service configuration for the rebound reconciler.

use std::{fmt, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use rebound_reconcile::{ReconcileConfig, SchedulerConfig, StripeConfig};
use rebound_resilience::{Backoff, CircuitBreakerOptions};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "rebound.toml";

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`rebound.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Every field maps to the upper-cased environment variable of the same
/// name, e.g. `reconcile_batch_size` is set by `RECONCILE_BATCH_SIZE`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,
    /// Database connection acquire timeout in seconds.
    ///
    /// Environment variable: `DATABASE_CONNECTION_TIMEOUT`
    #[serde(default = "default_acquire_timeout", alias = "DATABASE_CONNECTION_TIMEOUT")]
    pub database_connection_timeout: u64,
    /// Connection attempts at startup before giving up.
    ///
    /// Environment variable: `DATABASE_CONNECT_ATTEMPTS`
    #[serde(default = "default_connect_attempts", alias = "DATABASE_CONNECT_ATTEMPTS")]
    pub database_connect_attempts: u32,

    // Reconciliation
    /// Maximum rows examined per run.
    ///
    /// Environment variable: `RECONCILE_BATCH_SIZE`
    #[serde(default = "default_batch_size", alias = "RECONCILE_BATCH_SIZE")]
    pub reconcile_batch_size: usize,
    /// Reprocessing attempts before a webhook is dead-lettered.
    ///
    /// Environment variable: `RECONCILE_MAX_RETRIES`
    #[serde(default = "default_max_retries", alias = "RECONCILE_MAX_RETRIES")]
    pub reconcile_max_retries: u32,
    /// Seconds between scheduled runs.
    ///
    /// Environment variable: `RECONCILE_INTERVAL_SECONDS`
    #[serde(default = "default_interval", alias = "RECONCILE_INTERVAL_SECONDS")]
    pub reconcile_interval_seconds: u64,
    /// Run a single reconciliation and exit instead of looping.
    ///
    /// Environment variable: `RECONCILE_RUN_ONCE`
    #[serde(default, alias = "RECONCILE_RUN_ONCE")]
    pub reconcile_run_once: bool,
    /// Distributed lock name shared by all instances.
    ///
    /// Environment variable: `RECONCILE_LOCK_KEY`
    #[serde(default = "default_lock_key", alias = "RECONCILE_LOCK_KEY")]
    pub reconcile_lock_key: String,
    /// Seconds a run may hold the lock before it can be taken over.
    ///
    /// Environment variable: `LOCK_TTL_SECONDS`
    #[serde(default = "default_lock_ttl", alias = "LOCK_TTL_SECONDS")]
    pub lock_ttl_seconds: u64,
    /// Wait in seconds after the first failure before a row is due again.
    ///
    /// Environment variable: `RECONCILE_BACKOFF_BASE_SECONDS`
    #[serde(default = "default_backoff_base", alias = "RECONCILE_BACKOFF_BASE_SECONDS")]
    pub reconcile_backoff_base_seconds: u64,
    /// Upper bound in seconds on the per-row wait.
    ///
    /// Environment variable: `RECONCILE_BACKOFF_MAX_SECONDS`
    #[serde(default = "default_backoff_max", alias = "RECONCILE_BACKOFF_MAX_SECONDS")]
    pub reconcile_backoff_max_seconds: u64,

    // Retry
    /// Attempts per provider call.
    ///
    /// Environment variable: `RETRY_MAX_ATTEMPTS`
    #[serde(default = "default_retry_attempts", alias = "RETRY_MAX_ATTEMPTS")]
    pub retry_max_attempts: u32,
    /// Delay before the second attempt in milliseconds.
    ///
    /// Environment variable: `RETRY_INITIAL_DELAY_MS`
    #[serde(default = "default_initial_delay_ms", alias = "RETRY_INITIAL_DELAY_MS")]
    pub retry_initial_delay_ms: u64,
    /// Maximum delay between attempts in milliseconds.
    ///
    /// Environment variable: `RETRY_MAX_DELAY_MS`
    #[serde(default = "default_max_delay_ms", alias = "RETRY_MAX_DELAY_MS")]
    pub retry_max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    ///
    /// Environment variable: `RETRY_BACKOFF_MULTIPLIER`
    #[serde(default = "default_multiplier", alias = "RETRY_BACKOFF_MULTIPLIER")]
    pub retry_backoff_multiplier: f64,
    /// Whether delays are randomised downwards.
    ///
    /// Environment variable: `RETRY_JITTER`
    #[serde(default = "default_jitter", alias = "RETRY_JITTER")]
    pub retry_jitter: bool,

    // Circuit breaker
    /// Consecutive failures that open the breaker.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_FAILURE_THRESHOLD`
    #[serde(default = "default_failure_threshold", alias = "CIRCUIT_BREAKER_FAILURE_THRESHOLD")]
    pub circuit_breaker_failure_threshold: u32,
    /// Consecutive half-open successes that close the breaker.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_SUCCESS_THRESHOLD`
    #[serde(default = "default_success_threshold", alias = "CIRCUIT_BREAKER_SUCCESS_THRESHOLD")]
    pub circuit_breaker_success_threshold: u32,
    /// Milliseconds the breaker stays open before a trial call.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_TIMEOUT_MS`
    #[serde(default = "default_circuit_timeout_ms", alias = "CIRCUIT_BREAKER_TIMEOUT_MS")]
    pub circuit_breaker_timeout_ms: u64,

    // Providers
    /// Stripe secret key. The Stripe provider is only registered when set.
    ///
    /// Environment variable: `STRIPE_API_KEY`
    #[serde(default, alias = "STRIPE_API_KEY")]
    pub stripe_api_key: Option<String>,
    /// Stripe API base URL.
    ///
    /// Environment variable: `STRIPE_API_BASE`
    #[serde(default = "default_stripe_api_base", alias = "STRIPE_API_BASE")]
    pub stripe_api_base: String,
    /// Budget for a single provider call in milliseconds.
    ///
    /// Environment variable: `PROVIDER_TIMEOUT_MS`
    #[serde(default = "default_provider_timeout_ms", alias = "PROVIDER_TIMEOUT_MS")]
    pub provider_timeout_ms: u64,

    // Logging
    /// Log filter directives.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Load configuration from defaults, config file, and environment variable
    /// overrides.
    ///
    /// # Errors
    ///
    /// Fails if a source cannot be parsed or a value is out of range.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Convert to the reconciliation job configuration.
    pub fn to_reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            batch_size: self.reconcile_batch_size,
            max_retries: self.reconcile_max_retries,
            lock_key: self.reconcile_lock_key.clone(),
            lock_ttl: Duration::from_secs(self.lock_ttl_seconds),
            eligibility_backoff: Backoff::exponential(
                Duration::from_secs(self.reconcile_backoff_base_seconds),
                Duration::from_secs(self.reconcile_backoff_max_seconds),
            ),
        }
    }

    /// Convert to scheduler timing, keeping the default failure backoff.
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(self.reconcile_interval_seconds),
            ..SchedulerConfig::default()
        }
    }

    /// Backoff schedule for provider call retries.
    pub fn to_retry_backoff(&self) -> Backoff {
        Backoff {
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            multiplier: self.retry_backoff_multiplier,
            jitter: self.retry_jitter,
        }
    }

    /// Breaker options for provider clients.
    pub fn to_circuit_options(&self) -> CircuitBreakerOptions {
        CircuitBreakerOptions {
            failure_threshold: self.circuit_breaker_failure_threshold,
            success_threshold: self.circuit_breaker_success_threshold,
            open_timeout: Duration::from_millis(self.circuit_breaker_timeout_ms),
            ..CircuitBreakerOptions::default()
        }
    }

    /// Stripe client settings, when a key is configured.
    pub fn to_stripe_config(&self) -> Option<StripeConfig> {
        let api_key = self.stripe_api_key.as_deref().filter(|key| !key.is_empty())?;

        Some(StripeConfig {
            api_base: self.stripe_api_base.clone(),
            request_timeout: Duration::from_millis(self.provider_timeout_ms),
            max_attempts: self.retry_max_attempts,
            backoff: self.to_retry_backoff(),
            circuit_breaker: self.to_circuit_options(),
            ..StripeConfig::new(api_key)
        })
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.rfind('@') {
            let scheme_end = self.database_url.find("://").map_or(0, |pos| pos + 3);
            if let Some(colon_pos) = self.database_url[scheme_end..at_pos].find(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(scheme_end + colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database_min_connections cannot exceed database_max_connections");
        }

        if self.reconcile_batch_size == 0 {
            anyhow::bail!("reconcile_batch_size must be greater than 0");
        }

        if self.reconcile_max_retries == 0 {
            anyhow::bail!("reconcile_max_retries must be greater than 0");
        }

        if self.reconcile_interval_seconds == 0 {
            anyhow::bail!("reconcile_interval_seconds must be greater than 0");
        }

        if self.reconcile_lock_key.trim().is_empty() {
            anyhow::bail!("reconcile_lock_key must not be empty");
        }

        if self.lock_ttl_seconds == 0 {
            anyhow::bail!("lock_ttl_seconds must be greater than 0");
        }

        if self.reconcile_backoff_base_seconds > self.reconcile_backoff_max_seconds {
            anyhow::bail!(
                "reconcile_backoff_base_seconds cannot exceed reconcile_backoff_max_seconds"
            );
        }

        if self.retry_max_attempts == 0 {
            anyhow::bail!("retry_max_attempts must be greater than 0");
        }

        if self.retry_initial_delay_ms > self.retry_max_delay_ms {
            anyhow::bail!("retry_initial_delay_ms cannot exceed retry_max_delay_ms");
        }

        if !self.retry_backoff_multiplier.is_finite() || self.retry_backoff_multiplier < 1.0 {
            anyhow::bail!("retry_backoff_multiplier must be a finite number of at least 1.0");
        }

        if self.circuit_breaker_failure_threshold == 0 {
            anyhow::bail!("circuit_breaker_failure_threshold must be greater than 0");
        }

        if self.circuit_breaker_success_threshold == 0 {
            anyhow::bail!("circuit_breaker_success_threshold must be greater than 0");
        }

        if self.provider_timeout_ms == 0 {
            anyhow::bail!("provider_timeout_ms must be greater than 0");
        }

        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url_masked())
            .field("database_max_connections", &self.database_max_connections)
            .field("reconcile_batch_size", &self.reconcile_batch_size)
            .field("reconcile_max_retries", &self.reconcile_max_retries)
            .field("reconcile_interval_seconds", &self.reconcile_interval_seconds)
            .field("reconcile_lock_key", &self.reconcile_lock_key)
            .field("stripe_api_key", &self.stripe_api_key.as_ref().map(|_| "***"))
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            database_connect_attempts: default_connect_attempts(),
            reconcile_batch_size: default_batch_size(),
            reconcile_max_retries: default_max_retries(),
            reconcile_interval_seconds: default_interval(),
            reconcile_run_once: false,
            reconcile_lock_key: default_lock_key(),
            lock_ttl_seconds: default_lock_ttl(),
            reconcile_backoff_base_seconds: default_backoff_base(),
            reconcile_backoff_max_seconds: default_backoff_max(),
            retry_max_attempts: default_retry_attempts(),
            retry_initial_delay_ms: default_initial_delay_ms(),
            retry_max_delay_ms: default_max_delay_ms(),
            retry_backoff_multiplier: default_multiplier(),
            retry_jitter: default_jitter(),
            circuit_breaker_failure_threshold: default_failure_threshold(),
            circuit_breaker_success_threshold: default_success_threshold(),
            circuit_breaker_timeout_ms: default_circuit_timeout_ms(),
            stripe_api_key: None,
            stripe_api_base: default_stripe_api_base(),
            provider_timeout_ms: default_provider_timeout_ms(),
            rust_log: default_log_level(),
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/rebound".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_connect_attempts() -> u32 {
    6
}

fn default_batch_size() -> usize {
    100
}

fn default_max_retries() -> u32 {
    5
}

fn default_interval() -> u64 {
    300
}

fn default_lock_key() -> String {
    "reconcile:webhook-events".to_string()
}

fn default_lock_ttl() -> u64 {
    300
}

fn default_backoff_base() -> u64 {
    60
}

fn default_backoff_max() -> u64 {
    3600
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_circuit_timeout_ms() -> u64 {
    60_000
}

fn default_stripe_api_base() -> String {
    "https://api.stripe.com".to_string()
}

fn default_provider_timeout_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info,rebound=debug".to_string()
}
