//! Circuit breaker guarding a single downstream dependency.
//!
//! Fails fast while a dependency is unhealthy and probes it again after a
//! cooldown. Counting is purely consecutive: a success clears the failure
//! count and a failure clears the success count.
//!
//! # State machine
//!
//! ```text
//!                 failure_threshold consecutive failures
//!     ┌────────┐ ───────────────────────────────────────▶ ┌────────┐
//!     │ CLOSED │                                           │  OPEN  │
//!     └────────┘ ◀──────────┐                              └────────┘
//!                           │ success_threshold                 │
//!                           │ consecutive successes             │ next call after
//!                           │                                   │ open_timeout
//!                      ┌───────────┐        any failure         │
//!                      │ HALF_OPEN │ ──────────────▶ OPEN       │
//!                      └───────────┘ ◀──────────────────────────┘
//! ```
//!
//! OPEN to HALF_OPEN is evaluated lazily when a call arrives; no timer runs
//! in the background. Each breaker is identified by a human-readable name
//! used in errors and logs. Callers keep one instance per dependency.

use std::{
    fmt,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use rebound_core::{Clock, RealClock};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::CircuitBreakerError;

/// Callback invoked with the breaker name when a transition happens.
pub type TransitionHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Thresholds and transition hooks for a [`CircuitBreaker`].
#[derive(Clone)]
pub struct CircuitBreakerOptions {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    /// How long the circuit stays open before allowing a probe.
    pub open_timeout: Duration,
    /// Fired on every transition into OPEN.
    pub on_open: Option<TransitionHook>,
    /// Fired on every transition into CLOSED.
    pub on_close: Option<TransitionHook>,
    /// Fired on every transition into HALF_OPEN.
    pub on_half_open: Option<TransitionHook>,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
            on_open: None,
            on_close: None,
            on_half_open: None,
        }
    }
}

impl CircuitBreakerOptions {
    /// Sets the OPEN hook.
    #[must_use]
    pub fn on_open(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(hook));
        self
    }

    /// Sets the CLOSED hook.
    #[must_use]
    pub fn on_close(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(hook));
        self
    }

    /// Sets the HALF_OPEN hook.
    #[must_use]
    pub fn on_half_open(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_half_open = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for CircuitBreakerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerOptions")
            .field("failure_threshold", &self.failure_threshold)
            .field("success_threshold", &self.success_threshold)
            .field("open_timeout", &self.open_timeout)
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .finish()
    }
}

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation - all calls allowed.
    Closed,
    /// Dependency unhealthy - calls rejected immediately.
    Open,
    /// Probing recovery - calls allowed, one failure reopens.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time snapshot of a breaker, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitStats {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures.
    pub failure_count: u32,
    /// Consecutive successes while half-open.
    pub success_count: u32,
    /// When the most recent failure was recorded.
    pub last_failure_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
}

impl BreakerState {
    const fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
        }
    }
}

/// Stateful guard for one logical dependency.
pub struct CircuitBreaker {
    name: String,
    options: CircuitBreakerOptions,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed breaker on the real clock.
    pub fn new(name: impl Into<String>, options: CircuitBreakerOptions) -> Self {
        Self::with_clock(name, options, RealClock::shared())
    }

    /// Creates a closed breaker reading time from `clock`.
    pub fn with_clock(
        name: impl Into<String>,
        options: CircuitBreakerOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { name: name.into(), options, clock, inner: Mutex::new(BreakerState::closed()) }
    }

    /// Name used in errors and logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `operation` if the breaker admits the call and records the
    /// outcome.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitBreakerError::Open`] without invoking `operation`
    /// while the circuit is open, or [`CircuitBreakerError::Inner`] with the
    /// operation's own error.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.admit().await {
            return Err(CircuitBreakerError::Open { name: self.name.clone() });
        }

        match operation().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            },
            Err(error) => {
                self.record_failure().await;
                Err(CircuitBreakerError::Inner(error))
            },
        }
    }

    /// Forces the breaker back to CLOSED with all counters zeroed.
    pub async fn reset(&self) {
        let previous = {
            let mut inner = self.inner.lock().await;
            let previous = inner.state;
            *inner = BreakerState::closed();
            previous
        };

        if previous != CircuitState::Closed {
            self.notify(CircuitState::Closed);
        }
    }

    /// Current state. Does not evaluate the open timeout.
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Snapshot of state and counters.
    pub async fn stats(&self) -> CircuitStats {
        let inner = *self.inner.lock().await;
        CircuitStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_at: inner.last_failure_at,
        }
    }

    async fn admit(&self) -> bool {
        let (allowed, transitioned) = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                CircuitState::Closed | CircuitState::HalfOpen => (true, false),
                CircuitState::Open => {
                    let cooled_down = inner.last_failure_at.map_or(true, |at| {
                        self.clock.now().saturating_duration_since(at) >= self.options.open_timeout
                    });
                    if cooled_down {
                        inner.state = CircuitState::HalfOpen;
                        inner.success_count = 0;
                        (true, true)
                    } else {
                        (false, false)
                    }
                },
            }
        };

        if transitioned {
            self.notify(CircuitState::HalfOpen);
        }
        allowed
    }

    async fn record_success(&self) {
        let closed = {
            let mut inner = self.inner.lock().await;
            inner.failure_count = 0;
            match inner.state {
                CircuitState::HalfOpen => {
                    inner.success_count += 1;
                    if inner.success_count >= self.options.success_threshold {
                        *inner = BreakerState::closed();
                        true
                    } else {
                        false
                    }
                },
                CircuitState::Closed | CircuitState::Open => false,
            }
        };

        if closed {
            self.notify(CircuitState::Closed);
        }
    }

    async fn record_failure(&self) {
        let opened = {
            let mut inner = self.inner.lock().await;
            inner.success_count = 0;
            inner.failure_count = inner.failure_count.saturating_add(1);
            inner.last_failure_at = Some(self.clock.now());

            let should_open = match inner.state {
                CircuitState::Closed => inner.failure_count >= self.options.failure_threshold,
                CircuitState::HalfOpen => true,
                CircuitState::Open => false,
            };
            if should_open {
                inner.state = CircuitState::Open;
            }
            should_open
        };

        if opened {
            self.notify(CircuitState::Open);
        }
    }

    fn notify(&self, state: CircuitState) {
        match state {
            CircuitState::Closed => {
                info!(breaker = %self.name, "circuit breaker closed");
                self.fire(self.options.on_close.as_ref());
            },
            CircuitState::HalfOpen => {
                info!(breaker = %self.name, "circuit breaker half-open, probing");
                self.fire(self.options.on_half_open.as_ref());
            },
            CircuitState::Open => {
                warn!(breaker = %self.name, "circuit breaker opened");
                self.fire(self.options.on_open.as_ref());
            },
        }
    }

    fn fire(&self, hook: Option<&TransitionHook>) {
        if let Some(hook) = hook {
            hook(&self.name);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use rebound_core::TestClock;

    use super::*;

    fn breaker(clock: &TestClock) -> CircuitBreaker {
        let options = CircuitBreakerOptions {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout: Duration::from_millis(1000),
            ..CircuitBreakerOptions::default()
        };
        CircuitBreaker::with_clock("test-dependency", options, Arc::new(clock.clone()))
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker.execute(|| async { Err::<(), _>("boom") }).await;
    }

    async fn succeed(breaker: &CircuitBreaker) {
        let _ = breaker.execute(|| async { Ok::<_, &str>(()) }).await;
    }

    #[tokio::test]
    async fn starts_closed() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);

        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(breaker.name(), "test-dependency");
    }

    #[tokio::test]
    async fn success_while_closed_clears_failures() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);

        fail(&breaker).await;
        fail(&breaker).await;
        succeed(&breaker).await;
        fail(&breaker).await;
        fail(&breaker).await;

        let stats = breaker.stats().await;
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 2);
        assert_eq!(stats.success_count, 0);
    }

    #[tokio::test]
    async fn open_circuit_does_not_probe_before_timeout() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);
        for _ in 0..3 {
            fail(&breaker).await;
        }

        clock.advance(Duration::from_millis(999));
        let calls = AtomicU32::new(0);
        let result = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn reset_forces_closed_and_zeroes_counters() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);
        for _ in 0..3 {
            fail(&breaker).await;
        }

        breaker.reset().await;

        let stats = breaker.stats().await;
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.last_failure_at, None);
    }
}
