//! Rebound webhook reconciliation service.
//!
//! Main entry point. Loads configuration, connects to PostgreSQL, wires the
//! reconciliation job to its collaborators and drives it on a schedule until
//! a shutdown signal arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use rebound_core::{storage::Storage, CoreError, TracingPublisher};
use rebound_reconcile::{
    LoggingHandler, PostgresLock, PostgresWebhookStore, ProviderRegistry, ReconciliationJob,
    Scheduler, StripeProvider,
};
use rebound_resilience::{with_retry, Backoff, RetryOptions};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    init_tracing(&config.rust_log)?;

    info!("Starting Rebound reconciliation service");
    info!(
        database_url = %config.database_url_masked(),
        max_connections = config.database_max_connections,
        batch_size = config.reconcile_batch_size,
        max_retries = config.reconcile_max_retries,
        interval_secs = config.reconcile_interval_seconds,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    let storage = Arc::new(Storage::new(db_pool.clone()));
    storage.ensure_schema().await.context("Failed to create database schema")?;
    info!("Database schema ready");

    let providers = build_providers(&config)?;
    if providers.is_empty() {
        warn!("No providers configured; every candidate row will fail until one is registered");
    } else {
        info!(providers = ?providers.names(), "Providers registered");
    }

    let job = Arc::new(ReconciliationJob::new(
        config.to_reconcile_config(),
        Arc::new(PostgresWebhookStore::new(storage.clone())),
        Arc::new(PostgresLock::new(storage.clone())),
        providers,
        Arc::new(TracingPublisher),
    ));
    let scheduler = Scheduler::new(job, config.to_scheduler_config());

    if config.reconcile_run_once {
        let outcome = scheduler.run_once().await;
        db_pool.close().await;
        let report = outcome.context("Reconciliation run failed")?;
        info!(?report, "Single reconciliation run complete");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let scheduler_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    });

    info!("Rebound is reconciling webhooks");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");
    cancel.cancel();

    // A run in flight is allowed to finish so its lock is released cleanly.
    match scheduler_handle.await {
        Ok(stats) => {
            info!(runs = stats.runs, failures = stats.failures, "Scheduler stopped");
        },
        Err(e) => error!(error = %e, "Scheduler task failed"),
    }

    db_pool.close().await;
    info!("Database connections closed");

    info!("Rebound shutdown complete");
    Ok(())
}

/// Initializes tracing with the configured filter directives.
fn init_tracing(filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(filter).context("Invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Creates the database connection pool, retrying while the database comes
/// up.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let options = RetryOptions::<CoreError>::new()
        .max_attempts(config.database_connect_attempts)
        .backoff(Backoff::exponential(Duration::from_secs(1), Duration::from_secs(10)))
        .on_retry(|error, attempt, delay| {
            info!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Database connection failed, retrying..."
            );
        });

    let connected = with_retry(
        move || async move {
            let pool = PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .min_connections(config.database_min_connections)
                .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
                .idle_timeout(Duration::from_secs(600))
                .max_lifetime(Duration::from_secs(1800))
                .connect(&config.database_url)
                .await?;

            Storage::new(pool.clone()).health_check().await?;
            Ok::<_, CoreError>(pool)
        },
        &options,
    )
    .await
    .context("Failed to create database connection pool after retries")?;

    Ok(connected.value)
}

/// Registers every provider with configuration present.
fn build_providers(config: &Config) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    if let Some(stripe) = config.to_stripe_config() {
        let provider = StripeProvider::new(stripe, Arc::new(LoggingHandler))
            .context("Failed to create Stripe provider")?;
        registry.register(Arc::new(provider));
    }

    Ok(registry)
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
