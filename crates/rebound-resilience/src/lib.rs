//! Failure-handling primitives for calls to unreliable dependencies.
//!
//! The building blocks compose but do not depend on each other:
//!
//! - **Backoff** - capped exponential delays with negative jitter
//! - **Retry** - bounded attempts around an async operation, with a pluggable
//!   retry predicate and a distinct error for exhaustion
//! - **Circuit breaker** - per-dependency CLOSED / OPEN / HALF_OPEN guard
//! - **Timeout guards** - bound a single call or a whole retry loop
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use rebound_resilience::{
//!     circuit::{CircuitBreaker, CircuitBreakerOptions},
//!     retry::{with_retry, RetryOptions},
//!     timeout::with_timeout,
//! };
//!
//! # async fn fetch() -> Result<String, std::io::Error> { Ok(String::new()) }
//! # async fn example() {
//! let breaker = CircuitBreaker::new("payments-api", CircuitBreakerOptions::default());
//! let options = RetryOptions::new().max_attempts(4);
//!
//! let result = with_retry(
//!     || breaker.execute(|| with_timeout(fetch(), Duration::from_secs(2), None)),
//!     &options,
//! )
//! .await;
//! # let _ = result;
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod circuit;
pub mod error;
pub mod retry;
pub mod timeout;

pub use backoff::{delay, Backoff};
pub use circuit::{CircuitBreaker, CircuitBreakerOptions, CircuitState, CircuitStats};
pub use error::{CircuitBreakerError, GuardError, RetryError};
pub use retry::{
    is_retryable_http_status, is_transient, with_retry, RetryExecutor, RetryOptions, RetryResult,
    Transient,
};
pub use timeout::{with_deadline, with_deadline_on, with_timeout};
