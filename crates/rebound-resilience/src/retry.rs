//! Bounded retry of async operations.
//!
//! [`RetryExecutor::run`] invokes an operation up to `max_attempts` times,
//! sleeping through the injected [`Clock`] between attempts. The loop for one
//! call is strictly sequential; independent calls share nothing.
//!
//! Failure precedence on each failed attempt:
//!
//! 1. final attempt: [`RetryError::MaxRetriesExceeded`] with the last error
//! 2. predicate rejects: [`RetryError::NonRetryable`] with the error unchanged
//! 3. otherwise: compute backoff, fire `on_retry`, sleep, try again

use std::{
    fmt::{self, Display},
    future::Future,
    io,
    sync::Arc,
    time::Duration,
};

use rebound_core::{Clock, CoreError, RealClock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    backoff::Backoff,
    error::{CircuitBreakerError, GuardError, RetryError},
};

/// Lower-cased fragments that mark an error as a transient network failure.
const TRANSIENT_SIGNATURES: &[&str] = &[
    "econnreset",
    "econnrefused",
    "etimedout",
    "enotfound",
    "eai_again",
    "socket hang up",
    "connection reset",
    "connection refused",
    "connection closed",
    "timed out",
    "timeout",
    "dns error",
    "failed to lookup address",
];

/// Classification hooks for the default retry predicate.
///
/// Both methods are optional. An explicit [`retry_hint`](Self::retry_hint)
/// overrides everything else; otherwise the error code and then the display
/// message are matched against known transient network signatures.
pub trait Transient {
    /// Explicit retryability flag.
    fn retry_hint(&self) -> Option<bool> {
        None
    }

    /// Machine-readable code such as `ECONNRESET`.
    fn error_code(&self) -> Option<&str> {
        None
    }
}

/// Default classifier used when no `should_retry` predicate is configured.
pub fn is_transient<E>(error: &E) -> bool
where
    E: Transient + Display + ?Sized,
{
    if let Some(hint) = error.retry_hint() {
        return hint;
    }

    if error.error_code().is_some_and(matches_signature) {
        return true;
    }

    matches_signature(&error.to_string())
}

fn matches_signature(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    TRANSIENT_SIGNATURES.iter().any(|signature| lower.contains(signature))
}

/// Returns true for HTTP statuses worth retrying: 429, 502, 503, 504.
pub const fn is_retryable_http_status(status: u16) -> bool {
    matches!(status, 429 | 502 | 503 | 504)
}

impl Transient for io::Error {
    fn retry_hint(&self) -> Option<bool> {
        match self.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::UnexpectedEof => Some(true),
            io::ErrorKind::NotFound
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::InvalidData
            | io::ErrorKind::AlreadyExists
            | io::ErrorKind::Unsupported => Some(false),
            _ => None,
        }
    }
}

impl Transient for CoreError {
    fn retry_hint(&self) -> Option<bool> {
        Some(self.is_transient())
    }
}

impl<E: Transient> Transient for CircuitBreakerError<E> {
    fn retry_hint(&self) -> Option<bool> {
        match self {
            // Retrying into an open breaker only burns attempts.
            Self::Open { .. } => Some(false),
            Self::Inner(error) => error.retry_hint(),
        }
    }

    fn error_code(&self) -> Option<&str> {
        match self {
            Self::Open { .. } => None,
            Self::Inner(error) => error.error_code(),
        }
    }
}

impl<E: Transient> Transient for GuardError<E> {
    fn retry_hint(&self) -> Option<bool> {
        match self {
            Self::Timeout { .. } => Some(true),
            Self::DeadlinePassed { .. } => Some(false),
            Self::Inner(error) => error.retry_hint(),
        }
    }

    fn error_code(&self) -> Option<&str> {
        match self {
            Self::Timeout { .. } => Some("ETIMEDOUT"),
            Self::DeadlinePassed { .. } => None,
            Self::Inner(error) => error.error_code(),
        }
    }
}

type RetryPredicate<E> = Arc<dyn Fn(&E, u32) -> bool + Send + Sync>;
type RetryHook<E> = Arc<dyn Fn(&E, u32, Duration) + Send + Sync>;

/// Per-call retry configuration.
pub struct RetryOptions<E> {
    /// Total attempts including the first; values below 1 are treated as 1.
    pub max_attempts: u32,
    /// Delay schedule between attempts.
    pub backoff: Backoff,
    should_retry: RetryPredicate<E>,
    on_retry: Option<RetryHook<E>>,
}

impl<E> RetryOptions<E>
where
    E: Transient + Display + 'static,
{
    /// Defaults: 3 attempts, default backoff, transient-error classifier.
    pub fn new() -> Self {
        Self::with_predicate(|error: &E, _attempt| is_transient(error))
    }
}

impl<E> Default for RetryOptions<E>
where
    E: Transient + Display + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> RetryOptions<E> {
    /// Options with a custom predicate, for error types without [`Transient`].
    pub fn with_predicate<P>(predicate: P) -> Self
    where
        P: Fn(&E, u32) -> bool + Send + Sync + 'static,
    {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            should_retry: Arc::new(predicate),
            on_retry: None,
        }
    }

    /// Sets the attempt budget, clamped to at least one.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Sets the backoff schedule.
    #[must_use]
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replaces the retry predicate. Receives the error and 1-based attempt.
    #[must_use]
    pub fn should_retry<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&E, u32) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Installs a hook invoked before each backoff sleep.
    #[must_use]
    pub fn on_retry<H>(mut self, hook: H) -> Self
    where
        H: Fn(&E, u32, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    fn effective_max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl<E> Clone for RetryOptions<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            should_retry: Arc::clone(&self.should_retry),
            on_retry: self.on_retry.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryOptions<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("on_retry", &self.on_retry.is_some())
            .finish_non_exhaustive()
    }
}

/// Successful outcome of a retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryResult<T> {
    /// Value returned by the successful attempt.
    pub value: T,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Time from the first attempt to success, per the executor's clock.
    pub total_duration: Duration,
}

/// Runs operations under a [`RetryOptions`] budget.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    clock: Arc<dyn Clock>,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RealClock::shared())
    }
}

impl RetryExecutor {
    /// Creates an executor that sleeps on `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Runs `operation` until it succeeds or the budget is spent.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::MaxRetriesExceeded`] when the final attempt
    /// fails and [`RetryError::NonRetryable`] when the predicate rejects an
    /// earlier failure.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: F,
        options: &RetryOptions<E>,
    ) -> Result<RetryResult<T>, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_inner(operation, options, None).await
    }

    /// Like [`run`](Self::run), but stops when `token` is cancelled.
    ///
    /// The token is checked before every attempt and raced against each
    /// backoff sleep. An attempt already in flight is not interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Cancelled`] in addition to the errors of
    /// [`run`](Self::run).
    pub async fn run_cancellable<T, E, F, Fut>(
        &self,
        operation: F,
        options: &RetryOptions<E>,
        token: &CancellationToken,
    ) -> Result<RetryResult<T>, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_inner(operation, options, Some(token)).await
    }

    async fn run_inner<T, E, F, Fut>(
        &self,
        mut operation: F,
        options: &RetryOptions<E>,
        cancel: Option<&CancellationToken>,
    ) -> Result<RetryResult<T>, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let started = self.clock.now();
        let max_attempts = options.effective_max_attempts();
        let mut last_error: Option<E> = None;
        let mut attempt = 0;

        loop {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(RetryError::Cancelled { attempts: attempt, last_error });
            }

            attempt += 1;

            let error = match operation().await {
                Ok(value) => {
                    let total_duration = self.clock.now().saturating_duration_since(started);
                    if attempt > 1 {
                        debug!(attempt, total_ms = total_duration.as_millis(), "retry succeeded");
                    }
                    return Ok(RetryResult { value, attempts: attempt, total_duration });
                },
                Err(error) => error,
            };

            if attempt >= max_attempts {
                warn!(attempts = attempt, error = %error, "retry budget exhausted");
                return Err(RetryError::MaxRetriesExceeded { attempts: attempt, last_error: error });
            }

            if !(options.should_retry)(&error, attempt) {
                debug!(attempt, error = %error, "error is not retryable");
                return Err(RetryError::NonRetryable(error));
            }

            let delay = options.backoff.delay(attempt);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis(),
                error = %error,
                "attempt failed, retrying"
            );

            if let Some(hook) = &options.on_retry {
                hook(&error, attempt, delay);
            }

            match cancel {
                Some(token) => {
                    tokio::select! {
                        () = token.cancelled() => {
                            return Err(RetryError::Cancelled {
                                attempts: attempt,
                                last_error: Some(error),
                            });
                        },
                        () = self.clock.sleep(delay) => {},
                    }
                },
                None => self.clock.sleep(delay).await,
            }

            last_error = Some(error);
        }
    }
}

/// Runs `operation` with a real-clock [`RetryExecutor`].
///
/// # Errors
///
/// See [`RetryExecutor::run`].
pub async fn with_retry<T, E, F, Fut>(
    operation: F,
    options: &RetryOptions<E>,
) -> Result<RetryResult<T>, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    RetryExecutor::default().run(operation, options).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Coded {
        code: Option<&'static str>,
        message: &'static str,
        hint: Option<bool>,
    }

    impl Display for Coded {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.message)
        }
    }

    impl Transient for Coded {
        fn retry_hint(&self) -> Option<bool> {
            self.hint
        }

        fn error_code(&self) -> Option<&str> {
            self.code
        }
    }

    #[test]
    fn explicit_hint_overrides_message() {
        let error = Coded { code: Some("ECONNRESET"), message: "timeout", hint: Some(false) };
        assert!(!is_transient(&error));

        let error = Coded { code: None, message: "validation failed", hint: Some(true) };
        assert!(is_transient(&error));
    }

    #[test]
    fn error_code_is_matched() {
        let error = Coded { code: Some("EAI_AGAIN"), message: "lookup failed", hint: None };
        assert!(is_transient(&error));
    }

    #[test]
    fn message_signatures_are_case_insensitive() {
        for message in ["Socket hang up", "read ETIMEDOUT", "Connection refused by peer"] {
            let error = Coded { code: None, message, hint: None };
            assert!(is_transient(&error), "{message} should be transient");
        }

        let error = Coded { code: None, message: "card declined", hint: None };
        assert!(!is_transient(&error));
    }

    #[test]
    fn io_errors_classify_by_kind() {
        assert!(is_transient(&io::Error::new(io::ErrorKind::ConnectionReset, "x")));
        assert!(!is_transient(&io::Error::new(io::ErrorKind::PermissionDenied, "timeout")));
        assert!(is_transient(&io::Error::other("socket hang up")));
        assert!(!is_transient(&io::Error::other("disk full")));
    }

    #[test]
    fn guard_and_breaker_errors_classify() {
        let timeout: GuardError<io::Error> =
            GuardError::Timeout { message: "slow".into(), timeout: Duration::from_secs(1) };
        assert!(is_transient(&timeout));

        let open: CircuitBreakerError<io::Error> =
            CircuitBreakerError::Open { name: "connection reset".into() };
        assert!(!is_transient(&open));

        let inner: CircuitBreakerError<CoreError> =
            CircuitBreakerError::Inner(CoreError::Database("connection reset".into()));
        assert!(is_transient(&inner));

        let not_found: CircuitBreakerError<CoreError> =
            CircuitBreakerError::Inner(CoreError::NotFound("row".into()));
        assert!(!is_transient(&not_found));
    }

    #[test]
    fn retryable_http_statuses() {
        for status in [429, 502, 503, 504] {
            assert!(is_retryable_http_status(status));
        }
        for status in [200, 400, 401, 404, 500, 501] {
            assert!(!is_retryable_http_status(status));
        }
    }

    #[test]
    fn builder_clamps_attempts() {
        let options: RetryOptions<io::Error> = RetryOptions::new().max_attempts(0);
        assert_eq!(options.max_attempts, 1);

        let mut options: RetryOptions<io::Error> = RetryOptions::new();
        options.max_attempts = 0;
        assert_eq!(options.effective_max_attempts(), 1);
    }
}
