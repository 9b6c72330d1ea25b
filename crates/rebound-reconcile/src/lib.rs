//! Reconciliation of webhooks whose original delivery failed.
//!
//! A [`ReconciliationJob`] periodically drains the `webhook_events` table:
//! each non-terminal row is reprocessed through its [`WebhookProvider`] until
//! it succeeds or its retry budget runs out, at which point it is
//! dead-lettered. A [`DistributedLock`] keeps at most one run active across
//! all instances, and the [`Scheduler`] drives runs on an interval.
//!
//! Storage, locking, providers and lifecycle publishing are all trait seams
//! with in-memory implementations under each module's `mock` submodule.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod job;
pub mod lock;
pub mod provider;
pub mod scheduler;
pub mod store;

pub use config::ReconcileConfig;
pub use error::{ProviderError, ReconcileError, Result};
pub use job::{ReconcileReport, ReconciliationJob};
pub use lock::{DistributedLock, PostgresLock};
pub use provider::{
    LoggingHandler, ProviderRegistry, StripeConfig, StripeProvider, WebhookHandler,
    WebhookProvider,
};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerStats};
pub use store::{PostgresWebhookStore, WebhookStore};
