//! Error types surfaced by the resilience primitives.
//!
//! Each primitive wraps the caller's own error type `E` instead of erasing
//! it, so callers can still branch on the underlying failure. Exhaustion and
//! non-retryability are separate variants and never collapse into one.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failure of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt in the budget failed.
    #[error("operation failed after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded {
        /// Attempts made, including the last one
        attempts: u32,
        /// Error returned by the final attempt
        #[source]
        last_error: E,
    },

    /// The retry predicate rejected the error; it is returned unchanged.
    #[error(transparent)]
    NonRetryable(E),

    /// The cancellation token fired before the budget was spent.
    #[error("retry cancelled after {attempts} attempts")]
    Cancelled {
        /// Attempts completed before cancellation
        attempts: u32,
        /// Error from the most recent attempt, if any ran
        last_error: Option<E>,
    },
}

impl<E> RetryError<E> {
    /// Returns true when the attempt budget ran out.
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::MaxRetriesExceeded { .. })
    }

    /// Returns true when the error was classified as permanent.
    pub const fn is_non_retryable(&self) -> bool {
        matches!(self, Self::NonRetryable(_))
    }

    /// Number of attempts made, when known.
    pub const fn attempts(&self) -> Option<u32> {
        match self {
            Self::MaxRetriesExceeded { attempts, .. } | Self::Cancelled { attempts, .. } => {
                Some(*attempts)
            },
            Self::NonRetryable(_) => None,
        }
    }

    /// Returns the underlying operation error, if one was captured.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::MaxRetriesExceeded { last_error, .. } => Some(last_error),
            Self::NonRetryable(error) => Some(error),
            Self::Cancelled { last_error, .. } => last_error,
        }
    }
}

/// Failure of a call routed through a circuit breaker.
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// The breaker rejected the call without invoking the operation.
    #[error("circuit breaker '{name}' is open")]
    Open {
        /// Name of the guarded dependency
        name: String,
    },

    /// The operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    /// Returns true when the call was short-circuited.
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// Returns the operation's own error, if it ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Open { .. } => None,
            Self::Inner(error) => Some(error),
        }
    }
}

/// Failure of a call bounded by a timeout or deadline.
#[derive(Debug, Error)]
pub enum GuardError<E> {
    /// The operation did not settle within its budget.
    #[error("{message}")]
    Timeout {
        /// Caller-supplied or default description
        message: String,
        /// Budget that was exceeded
        timeout: Duration,
    },

    /// The deadline had already passed; the operation was never started.
    #[error("deadline {deadline} already passed")]
    DeadlinePassed {
        /// The deadline that was requested
        deadline: DateTime<Utc>,
    },

    /// The operation settled in time with its own error.
    #[error(transparent)]
    Inner(E),
}

impl<E> GuardError<E> {
    /// Returns true for [`GuardError::Timeout`].
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns the operation's own error, if it settled with one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(error) => Some(error),
            Self::Timeout { .. } | Self::DeadlinePassed { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn exhaustion_and_rejection_are_distinguishable() {
        let exhausted: RetryError<io::Error> = RetryError::MaxRetriesExceeded {
            attempts: 3,
            last_error: io::Error::new(io::ErrorKind::TimedOut, "slow"),
        };
        let rejected: RetryError<io::Error> =
            RetryError::NonRetryable(io::Error::new(io::ErrorKind::InvalidInput, "bad"));

        assert!(exhausted.is_exhausted());
        assert!(!exhausted.is_non_retryable());
        assert_eq!(exhausted.attempts(), Some(3));

        assert!(rejected.is_non_retryable());
        assert!(!rejected.is_exhausted());
        assert_eq!(rejected.to_string(), "bad");
    }

    #[test]
    fn exhaustion_message_carries_attempts_and_cause() {
        let error: RetryError<io::Error> = RetryError::MaxRetriesExceeded {
            attempts: 4,
            last_error: io::Error::new(io::ErrorKind::ConnectionReset, "peer reset"),
        };

        assert_eq!(error.to_string(), "operation failed after 4 attempts: peer reset");
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn open_breaker_names_the_dependency() {
        let error: CircuitBreakerError<io::Error> =
            CircuitBreakerError::Open { name: "stripe".to_string() };

        assert!(error.is_open());
        assert_eq!(error.to_string(), "circuit breaker 'stripe' is open");
        assert!(error.into_inner().is_none());
    }

    #[test]
    fn timeout_displays_its_message() {
        let error: GuardError<io::Error> = GuardError::Timeout {
            message: "upstream too slow".to_string(),
            timeout: Duration::from_millis(100),
        };

        assert!(error.is_timeout());
        assert_eq!(error.to_string(), "upstream too slow");
    }
}
