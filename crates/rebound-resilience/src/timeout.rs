//! Timeout and deadline guards.
//!
//! [`with_timeout`] bounds a single future; [`with_deadline`] bounds work
//! against an absolute wall-clock instant and refuses to start when that
//! instant is already behind us. A losing operation is dropped, which
//! cancels it at its next suspension point, and the timer is released on
//! either outcome.

use std::{future::Future, time::Duration};

use chrono::{DateTime, Utc};
use rebound_core::{Clock, RealClock};

use crate::error::GuardError;

/// Races `future` against a `timeout` timer.
///
/// # Errors
///
/// Returns [`GuardError::Timeout`] carrying `message` (or a default naming
/// the budget) when the timer fires first, and [`GuardError::Inner`] when the
/// future settles in time with an error.
pub async fn with_timeout<T, E, Fut>(
    future: Fut,
    timeout: Duration,
    message: Option<&str>,
) -> Result<T, GuardError<E>>
where
    Fut: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result.map_err(GuardError::Inner),
        Err(_elapsed) => Err(GuardError::Timeout {
            message: message.map_or_else(
                || format!("operation timed out after {}ms", timeout.as_millis()),
                str::to_owned,
            ),
            timeout,
        }),
    }
}

/// Runs `operation` with whatever budget remains until `deadline_at`.
///
/// # Errors
///
/// See [`with_deadline_on`].
pub async fn with_deadline<T, E, F, Fut>(
    operation: F,
    deadline_at: DateTime<Utc>,
) -> Result<T, GuardError<E>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    with_deadline_on(&RealClock::new(), operation, deadline_at).await
}

/// [`with_deadline`] reading the current time from `clock`.
///
/// # Errors
///
/// Returns [`GuardError::DeadlinePassed`] without calling `operation` when no
/// time remains, otherwise the errors of [`with_timeout`].
pub async fn with_deadline_on<T, E, F, Fut>(
    clock: &dyn Clock,
    operation: F,
    deadline_at: DateTime<Utc>,
) -> Result<T, GuardError<E>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let remaining = deadline_at
        .signed_duration_since(clock.now_utc())
        .to_std()
        .ok()
        .filter(|remaining| !remaining.is_zero());

    let Some(remaining) = remaining else {
        return Err(GuardError::DeadlinePassed { deadline: deadline_at });
    };

    with_timeout(operation(), remaining, Some("deadline exceeded")).await
}
