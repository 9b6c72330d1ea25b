//! Capped exponential backoff with negative jitter.
//!
//! `delay(n)` is the wait before attempt `n + 1`:
//! `min(initial * multiplier^(n-1), max)`. With jitter enabled the capped
//! value is scaled by a uniform factor in `[0.5, 1.0)` and floored to whole
//! milliseconds, so jittered delays never exceed the ceiling.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponents above this saturate; any realistic multiplier has long since
/// passed every sane ceiling.
const MAX_EXPONENT: u32 = 64;

/// Backoff schedule configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Ceiling applied before jitter.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Whether to apply negative jitter.
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5000),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl Backoff {
    /// Exponential schedule without jitter.
    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self { initial_delay, max_delay, multiplier: 2.0, jitter: false }
    }

    /// Returns a copy with jitter switched on or off.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Deterministic delay for `attempt` (1-indexed; 0 is treated as 1).
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
        let growth = self.multiplier.powi(i32::try_from(exponent).unwrap_or(i32::MAX));
        let raw_nanos = self.initial_delay.as_nanos() as f64 * growth;

        let max_nanos = self.max_delay.as_nanos() as f64;
        if !raw_nanos.is_finite() || raw_nanos >= max_nanos {
            return self.max_delay;
        }

        Duration::from_nanos(raw_nanos.max(0.0) as u64)
    }

    /// Delay for `attempt`, jittered when enabled.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::rng())
    }

    /// Same as [`Backoff::delay`] with an explicit random source.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let capped = self.capped_delay(attempt);
        if !self.jitter {
            return capped;
        }
        apply_jitter(capped, rng.random_range(0.5..1.0))
    }
}

/// Free-function form of [`Backoff::delay`].
pub fn delay(attempt: u32, backoff: &Backoff) -> Duration {
    backoff.delay(attempt)
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn apply_jitter(capped: Duration, factor: f64) -> Duration {
    let millis = (capped.as_millis() as f64 * factor).floor();
    Duration::from_millis(millis.max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn no_jitter() -> Backoff {
        Backoff::default().with_jitter(false)
    }

    #[test]
    fn exponential_progression_without_jitter() {
        let backoff = no_jitter();

        let delays: Vec<_> = (1..=7).map(|attempt| backoff.delay(attempt).as_millis()).collect();

        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 3200, 5000]);
    }

    #[test]
    fn attempt_zero_behaves_like_first_attempt() {
        let backoff = no_jitter();
        assert_eq!(backoff.delay(0), backoff.delay(1));
    }

    #[test]
    fn huge_attempts_saturate_at_ceiling() {
        let backoff = no_jitter();
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(5000));
    }

    #[test]
    fn fractional_multiplier_is_honoured() {
        let backoff = Backoff {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            multiplier: 1.5,
            jitter: false,
        };

        assert_eq!(backoff.delay(3), Duration::from_millis(2250));
    }

    #[test]
    fn jitter_stays_within_lower_half_of_capped_value() {
        let backoff = Backoff::default();
        let mut rng = StdRng::seed_from_u64(7);
        let mut seen = std::collections::HashSet::new();

        for _ in 0..200 {
            let delay = backoff.delay_with_rng(4, &mut rng).as_millis();
            assert!((400..800).contains(&delay), "delay out of range: {delay}ms");
            seen.insert(delay);
        }

        assert!(seen.len() > 1, "jitter should vary the delay");
    }

    #[test]
    fn jitter_factor_edges_are_floored() {
        assert_eq!(apply_jitter(Duration::from_millis(101), 0.5), Duration::from_millis(50));
        assert_eq!(apply_jitter(Duration::from_millis(100), 0.999), Duration::from_millis(99));
    }
}
