//! Error types for reconciliation runs and provider calls.

use rebound_core::CoreError;
use rebound_resilience::{
    is_retryable_http_status, CircuitBreakerError, GuardError, RetryError, Transient,
};
use thiserror::Error;

/// Result type alias for reconciliation operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Failures that abort a whole run.
///
/// Per-row failures never surface here; they are recorded on the row and
/// counted in the report.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Loading or updating webhook rows failed.
    #[error("storage error: {0}")]
    Storage(#[from] CoreError),

    /// The batch panicked; the lock was released before this was returned.
    #[error("reconciliation batch panicked: {message}")]
    Panicked {
        /// Panic payload, when it was a string
        message: String,
    },
}

/// Failure to reprocess a single webhook through its provider.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// No provider is registered under the row's provider name.
    #[error("no provider registered for '{provider}'")]
    UnknownProvider {
        /// Provider name stored on the row
        provider: String,
    },

    /// Connection-level failure talking to the provider.
    #[error("network error: {message}")]
    Network {
        /// Transport error message
        message: String,
    },

    /// A single provider call exceeded its time budget.
    #[error("{message}")]
    Timeout {
        /// Timeout description
        message: String,
    },

    /// The provider answered with a non-success status.
    #[error("provider returned HTTP {status}: {body}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Response body, possibly truncated
        body: String,
    },

    /// The event no longer exists upstream.
    #[error("event {event_id} not found upstream")]
    NotFound {
        /// Provider-side event id
        event_id: String,
    },

    /// The provider answered with something unusable.
    #[error("invalid provider response: {message}")]
    InvalidResponse {
        /// What was wrong with it
        message: String,
    },

    /// The provider's circuit breaker is open.
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen {
        /// Breaker name
        name: String,
    },

    /// Every call attempt failed.
    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        #[source]
        source: Box<ProviderError>,
    },

    /// The retry loop was cancelled.
    #[error("provider call cancelled")]
    Cancelled,

    /// The downstream side effect rejected the event.
    #[error("handler failed: {message}")]
    Handler {
        /// Handler error message
        message: String,
    },
}

impl ProviderError {
    /// Creates a handler error from a message.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler { message: message.into() }
    }

    /// Whether the call was refused by an open breaker, directly or as the
    /// final attempt of a retry loop.
    pub fn is_circuit_open(&self) -> bool {
        match self {
            Self::CircuitOpen { .. } => true,
            Self::RetriesExhausted { source, .. } => source.is_circuit_open(),
            _ => false,
        }
    }

    /// Whether the upstream gave a definitive answer about this one event.
    /// Such an answer says nothing about the provider's health.
    pub fn is_event_verdict(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::InvalidResponse { .. })
    }

    /// Creates an HTTP error, truncating very long bodies.
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        const MAX_BODY: usize = 512;
        let mut body = body.into();
        if body.len() > MAX_BODY {
            let cut = (0..=MAX_BODY).rev().find(|&i| body.is_char_boundary(i)).unwrap_or(0);
            body.truncate(cut);
        }
        Self::Http { status, body }
    }
}

impl Transient for ProviderError {
    fn retry_hint(&self) -> Option<bool> {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => Some(true),
            Self::Http { status, .. } => Some(is_retryable_http_status(*status)),
            Self::UnknownProvider { .. }
            | Self::NotFound { .. }
            | Self::InvalidResponse { .. }
            | Self::CircuitOpen { .. }
            | Self::RetriesExhausted { .. }
            | Self::Cancelled => Some(false),
            Self::Handler { .. } => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout { message: format!("provider request timed out: {error}") }
        } else if error.is_decode() {
            Self::InvalidResponse { message: error.to_string() }
        } else if let Some(status) = error.status() {
            Self::http(status.as_u16(), error.to_string())
        } else {
            Self::Network { message: error.to_string() }
        }
    }
}

impl From<GuardError<ProviderError>> for ProviderError {
    fn from(error: GuardError<ProviderError>) -> Self {
        match error {
            GuardError::Timeout { message, .. } => Self::Timeout { message },
            GuardError::DeadlinePassed { deadline } => {
                Self::Timeout { message: format!("deadline {deadline} already passed") }
            },
            GuardError::Inner(inner) => inner,
        }
    }
}

impl<E> From<CircuitBreakerError<E>> for ProviderError
where
    E: Into<Self>,
{
    fn from(error: CircuitBreakerError<E>) -> Self {
        match error {
            CircuitBreakerError::Open { name } => Self::CircuitOpen { name },
            CircuitBreakerError::Inner(inner) => inner.into(),
        }
    }
}

impl<E> From<RetryError<E>> for ProviderError
where
    E: Into<Self>,
{
    fn from(error: RetryError<E>) -> Self {
        match error {
            RetryError::MaxRetriesExceeded { attempts, last_error } => {
                Self::RetriesExhausted { attempts, source: Box::new(last_error.into()) }
            },
            RetryError::NonRetryable(inner) => inner.into(),
            RetryError::Cancelled { .. } => Self::Cancelled,
        }
    }
}
