//! Core domain models, lifecycle events and persistence.
//!
//! Provides the webhook event model, the lifecycle event publishing seam, the
//! clock abstraction and the PostgreSQL repositories shared by the resilience
//! primitives and the reconciliation job.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    EventPublisher, LifecycleEvent, LifecycleTopic, MulticastPublisher, NoOpPublisher,
    PublishError, TracingPublisher,
};
pub use models::{WebhookEvent, WebhookEventId};
pub use time::{Clock, RealClock, TestClock};
