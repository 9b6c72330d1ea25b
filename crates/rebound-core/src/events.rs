//! Lifecycle events emitted by webhook reconciliation.
//!
//! The reconciliation job publishes one event per row outcome so that
//! downstream consumers (metrics, alerting, audit) can follow the lifecycle
//! of a failed webhook without polling the table.
//!
//! ```text
//!  ┌──────────────────────┐   processed / retrying /   ┌──────────────────────┐
//!  │ ReconciliationJob    │ ─────── dead_lettered ───▶ │ EventPublisher       │
//!  │ (Producer)           │                            │ (Multicast, Tracing, │
//!  └──────────────────────┘                            │  broker adapters)    │
//!                                                      └──────────────────────┘
//! ```

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{WebhookEvent, WebhookEventId};

/// Topic a lifecycle event is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleTopic {
    /// Row was reprocessed successfully.
    Processed,
    /// Reprocessing failed; the row stays eligible for a later run.
    Retrying,
    /// Row exhausted its retry budget and left the normal path.
    DeadLettered,
}

impl LifecycleTopic {
    /// Wire name of the topic.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Processed => "webhook.processed",
            Self::Retrying => "webhook.retrying",
            Self::DeadLettered => "webhook.dead_lettered",
        }
    }
}

impl fmt::Display for LifecycleTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload published for every row outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Row identifier.
    pub webhook_id: WebhookEventId,
    /// Provider that sent the webhook.
    pub provider: String,
    /// Provider-side event identifier.
    pub event_id: String,
    /// Provider event type.
    pub event_type: String,
    /// Retry count after the outcome was recorded.
    pub retry_count: u32,
    /// Failure reason for retrying and dead-lettered outcomes.
    pub reason: Option<String>,
    /// When the outcome was recorded.
    pub occurred_at: DateTime<Utc>,
}

impl LifecycleEvent {
    /// Builds an event describing `webhook` as it stands after an outcome.
    pub fn from_webhook(
        webhook: &WebhookEvent,
        reason: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            webhook_id: webhook.id,
            provider: webhook.provider.clone(),
            event_id: webhook.event_id.clone(),
            event_type: webhook.event_type.clone(),
            retry_count: webhook.attempts(),
            reason,
            occurred_at,
        }
    }
}

/// Failure to hand an event to the downstream transport.
#[derive(Debug, Clone, Error)]
#[error("failed to publish to {topic}: {message}")]
pub struct PublishError {
    /// Topic that could not be published to.
    pub topic: LifecycleTopic,
    /// Transport error message.
    pub message: String,
}

impl PublishError {
    /// Creates a publish error for `topic`.
    pub fn new(topic: LifecycleTopic, message: impl Into<String>) -> Self {
        Self { topic, message: message.into() }
    }
}

/// Sink for lifecycle events.
///
/// Publishing happens after the row outcome is committed, so a failing
/// publisher never changes the stored state. Callers log publish errors and
/// carry on.
#[async_trait::async_trait]
pub trait EventPublisher: Send + Sync + fmt::Debug {
    /// Publishes `event` on `topic`.
    async fn publish(
        &self,
        topic: LifecycleTopic,
        event: LifecycleEvent,
    ) -> Result<(), PublishError>;
}

/// Publisher that discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpPublisher;

#[async_trait::async_trait]
impl EventPublisher for NoOpPublisher {
    async fn publish(
        &self,
        _topic: LifecycleTopic,
        _event: LifecycleEvent,
    ) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Publisher that writes every event to the structured log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPublisher;

#[async_trait::async_trait]
impl EventPublisher for TracingPublisher {
    async fn publish(
        &self,
        topic: LifecycleTopic,
        event: LifecycleEvent,
    ) -> Result<(), PublishError> {
        tracing::info!(
            topic = %topic,
            webhook_id = %event.webhook_id,
            provider = %event.provider,
            event_id = %event.event_id,
            retry_count = event.retry_count,
            reason = event.reason.as_deref().unwrap_or(""),
            "webhook lifecycle event"
        );
        Ok(())
    }
}

/// Publisher that forwards events to every subscriber concurrently.
///
/// A failing subscriber does not stop the others; the first error is
/// returned once all subscribers have been tried.
#[derive(Debug, Clone, Default)]
pub struct MulticastPublisher {
    subscribers: Vec<Arc<dyn EventPublisher>>,
}

impl MulticastPublisher {
    /// Creates a multicast publisher with no subscribers.
    pub fn new() -> Self {
        Self { subscribers: Vec::new() }
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, subscriber: Arc<dyn EventPublisher>) {
        self.subscribers.push(subscriber);
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[async_trait::async_trait]
impl EventPublisher for MulticastPublisher {
    async fn publish(
        &self,
        topic: LifecycleTopic,
        event: LifecycleEvent,
    ) -> Result<(), PublishError> {
        let futures = self.subscribers.iter().map(|subscriber| {
            let event = event.clone();
            async move { subscriber.publish(topic, event).await }
        });

        let results = futures::future::join_all(futures).await;
        for result in &results {
            if let Err(error) = result {
                tracing::warn!(topic = %topic, error = %error, "lifecycle subscriber failed");
            }
        }

        results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
    }
}

pub mod mock {
    //! Recording publisher for tests.

    use tokio::sync::Mutex;

    use super::{EventPublisher, LifecycleEvent, LifecycleTopic, PublishError};

    /// Publisher that keeps every event in memory, optionally failing.
    #[derive(Debug, Default)]
    pub struct RecordingPublisher {
        events: Mutex<Vec<(LifecycleTopic, LifecycleEvent)>>,
        fail: bool,
    }

    impl RecordingPublisher {
        /// Creates an empty recording publisher.
        pub fn new() -> Self {
            Self::default()
        }

        /// Creates a publisher that records and then reports failure.
        pub fn failing() -> Self {
            Self { events: Mutex::default(), fail: true }
        }

        /// Every published event in order.
        pub async fn events(&self) -> Vec<(LifecycleTopic, LifecycleEvent)> {
            self.events.lock().await.clone()
        }

        /// Events published on `topic`.
        pub async fn on_topic(&self, topic: LifecycleTopic) -> Vec<LifecycleEvent> {
            self.events
                .lock()
                .await
                .iter()
                .filter(|(t, _)| *t == topic)
                .map(|(_, event)| event.clone())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(
            &self,
            topic: LifecycleTopic,
            event: LifecycleEvent,
        ) -> Result<(), PublishError> {
            self.events.lock().await.push((topic, event));
            if self.fail {
                return Err(PublishError::new(topic, "recording publisher configured to fail"));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{mock::RecordingPublisher, *};

    fn sample_event() -> LifecycleEvent {
        let webhook = WebhookEvent::new(
            "stripe",
            "evt_1",
            "charge.refunded",
            serde_json::json!({}),
            Utc::now(),
        );
        LifecycleEvent::from_webhook(&webhook, None, Utc::now())
    }

    #[test]
    fn topics_have_stable_wire_names() {
        assert_eq!(LifecycleTopic::Processed.to_string(), "webhook.processed");
        assert_eq!(LifecycleTopic::Retrying.to_string(), "webhook.retrying");
        assert_eq!(LifecycleTopic::DeadLettered.to_string(), "webhook.dead_lettered");
    }

    #[tokio::test]
    async fn multicast_forwards_to_all_subscribers() {
        let first = Arc::new(RecordingPublisher::new());
        let second = Arc::new(RecordingPublisher::new());

        let mut multicast = MulticastPublisher::new();
        multicast.add_subscriber(first.clone());
        multicast.add_subscriber(second.clone());
        assert_eq!(multicast.subscriber_count(), 2);

        multicast.publish(LifecycleTopic::Processed, sample_event()).await.unwrap();

        assert_eq!(first.events().await.len(), 1);
        assert_eq!(second.on_topic(LifecycleTopic::Processed).await.len(), 1);
    }

    #[tokio::test]
    async fn multicast_reports_failure_after_trying_everyone() {
        let failing = Arc::new(RecordingPublisher::failing());
        let healthy = Arc::new(RecordingPublisher::new());

        let mut multicast = MulticastPublisher::new();
        multicast.add_subscriber(failing.clone());
        multicast.add_subscriber(healthy.clone());

        let result = multicast.publish(LifecycleTopic::Retrying, sample_event()).await;

        assert!(result.is_err());
        assert_eq!(healthy.events().await.len(), 1);
    }

    #[tokio::test]
    async fn empty_multicast_and_noop_succeed() {
        MulticastPublisher::new()
            .publish(LifecycleTopic::DeadLettered, sample_event())
            .await
            .unwrap();
        NoOpPublisher.publish(LifecycleTopic::DeadLettered, sample_event()).await.unwrap();
        TracingPublisher.publish(LifecycleTopic::DeadLettered, sample_event()).await.unwrap();
    }
}
