//! Webhook event model and strongly-typed identifiers.
//!
//! A `WebhookEvent` row is written by the payment domain when an inbound
//! provider webhook could not be processed. The reconciliation job owns the
//! retry bookkeeping columns (`retry_count`, `last_retried_at`,
//! `failure_reason`, `processed`, `exhausted`) from then on.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed identifier of a stored webhook event row.
///
/// Distinct from the provider's own event id (`WebhookEvent::event_id`),
/// which is only unique per provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WebhookEventId(pub Uuid);

impl WebhookEventId {
    /// Creates a new random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WebhookEventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WebhookEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for WebhookEventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for WebhookEventId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for WebhookEventId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        Ok(Self(<Uuid as sqlx::Decode<PgDb>>::decode(value)?))
    }
}

impl sqlx::Encode<'_, PgDb> for WebhookEventId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// A provider webhook whose processing failed and awaits reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookEvent {
    /// Row identifier.
    pub id: WebhookEventId,

    /// Provider that sent the webhook (e.g. `stripe`).
    pub provider: String,

    /// Provider-side event identifier, used to look the event up upstream.
    pub event_id: String,

    /// Provider event type (e.g. `payment_intent.succeeded`).
    pub event_type: String,

    /// Original webhook payload.
    pub payload: sqlx::types::Json<serde_json::Value>,

    /// Number of reconciliation attempts so far. Never decreases.
    pub retry_count: i32,

    /// When the last reconciliation attempt happened.
    pub last_retried_at: Option<DateTime<Utc>>,

    /// Error recorded by the most recent failed attempt.
    pub failure_reason: Option<String>,

    /// Set only after a confirmed successful reprocessing.
    pub processed: bool,

    /// Terminal dead-letter flag; exhausted rows are never picked up again.
    pub exhausted: bool,

    /// When the failed webhook was first recorded.
    pub created_at: DateTime<Utc>,

    /// Last modification time.
    pub updated_at: DateTime<Utc>,

    /// Soft-delete marker.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl WebhookEvent {
    /// Creates a fresh, never-retried event row.
    pub fn new(
        provider: impl Into<String>,
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: WebhookEventId::new(),
            provider: provider.into(),
            event_id: event_id.into(),
            event_type: event_type.into(),
            payload: sqlx::types::Json(payload),
            retry_count: 0,
            last_retried_at: None,
            failure_reason: None,
            processed: false,
            exhausted: false,
            created_at: received_at,
            updated_at: received_at,
            deleted_at: None,
        }
    }

    /// Retry count as an unsigned attempt number.
    pub fn attempts(&self) -> u32 {
        u32::try_from(self.retry_count).unwrap_or(0)
    }

    /// Whether the row has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.processed || self.exhausted || self.deleted_at.is_some()
    }

    /// Whether the retry budget is spent.
    pub fn is_over_budget(&self, max_retries: u32) -> bool {
        self.attempts() >= max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WebhookEvent {
        WebhookEvent::new(
            "stripe",
            "evt_123",
            "payment_intent.succeeded",
            serde_json::json!({"id": "evt_123"}),
            Utc::now(),
        )
    }

    #[test]
    fn new_event_is_pending() {
        let event = sample();
        assert_eq!(event.attempts(), 0);
        assert!(!event.is_terminal());
        assert!(!event.is_over_budget(5));
    }

    #[test]
    fn budget_is_inclusive_at_max() {
        let mut event = sample();
        event.retry_count = 5;
        assert!(event.is_over_budget(5));
        assert!(!event.is_over_budget(6));
    }

    #[test]
    fn deleted_or_exhausted_rows_are_terminal() {
        let mut event = sample();
        event.exhausted = true;
        assert!(event.is_terminal());

        let mut event = sample();
        event.deleted_at = Some(Utc::now());
        assert!(event.is_terminal());
    }

    #[test]
    fn negative_retry_count_reads_as_zero() {
        let mut event = sample();
        event.retry_count = -1;
        assert_eq!(event.attempts(), 0);
    }
}
