//! Exponential backoff with optional jitter.
//!
//! `delay(attempt) = min(base × multiplier^attempt, max)`, plus a uniform
//! random extra in `[0, 0.25 × delay)` when jitter is enabled. The same
//! formula drives reconnection, discovery retries and the HTTP retry loops,
//! each with its own counter.

use std::time::Duration;

use rand::Rng;

const DEFAULT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MULTIPLIER: f64 = 2.0;
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const JITTER_FRACTION: f64 = 0.25;

/// Backoff parameters.
///
/// # Example
///
/// ```
/// use pulsewire_client::backoff::ReconnectionPolicy;
/// use std::time::Duration;
///
/// let policy = ReconnectionPolicy::new()
///     .with_max_attempts(3)
///     .with_jitter(false);
/// assert_eq!(policy.delay_for(2), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectionPolicy {
    /// Attempts allowed before giving up. Defaults to **10**.
    pub max_attempts: u32,
    /// Delay before the first retry. Defaults to **1 s**.
    pub base_delay: Duration,
    /// Growth factor per attempt, at least 1. Defaults to **2**.
    pub multiplier: f64,
    /// Upper bound on the un-jittered delay. Defaults to **30 s**.
    pub max_delay: Duration,
    /// Add up to 25 % random extra delay. Defaults to **on**.
    pub jitter: bool,
}

impl ReconnectionPolicy {
    /// Policy with the documented defaults.
    pub fn new() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: true,
        }
    }

    /// Set the number of attempts allowed before giving up.
    ///
    /// Defaults to **10**.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the delay before the first retry.
    ///
    /// Defaults to **1 second**.
    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Set the growth factor per attempt.
    ///
    /// Defaults to **2**. Values below 1 (and NaN) are clamped to 1.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Set the cap on the un-jittered delay.
    ///
    /// Defaults to **30 seconds**.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Enable or disable up to 25 % random extra delay.
    ///
    /// Defaults to **on**.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay for a zero-based attempt, without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = base_ms * self.multiplier.powi(exponent);
        let capped = if raw.is_finite() { raw.min(max_ms) } else { max_ms };
        Duration::from_millis(capped.round() as u64)
    }

    /// Delay for a zero-based attempt, with jitter when enabled.
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if self.jitter {
            delay + jitter(delay)
        } else {
            delay
        }
    }
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Uniform random extra in `[0, 0.25 × delay)`, truncated to microseconds.
fn jitter(delay: Duration) -> Duration {
    let fraction = rand::thread_rng().gen_range(0.0..JITTER_FRACTION);
    let micros = delay.as_micros() as f64 * fraction;
    Duration::from_micros(micros as u64)
}

/// Attempt counter bound to one policy.
///
/// The counter increments each time a delay is handed out and is compared
/// against `max_attempts` before that; once the limit is reached no further
/// delay is produced.
#[derive(Debug, Clone)]
pub struct ReconnectionBudget {
    policy: ReconnectionPolicy,
    attempts: u32,
}

impl ReconnectionBudget {
    pub fn new(policy: ReconnectionPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` when the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.policy.jittered_delay_for(self.attempts);
        self.attempts += 1;
        Some(delay)
    }

    /// Attempts handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn no_jitter() -> ReconnectionPolicy {
        ReconnectionPolicy::new().with_jitter(false)
    }

    #[test]
    fn defaults() {
        let policy = ReconnectionPolicy::default();
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert!(policy.jitter);
    }

    #[test]
    fn builders_set_each_field() {
        let policy = ReconnectionPolicy::new()
            .with_max_attempts(4)
            .with_base_delay(Duration::from_millis(250))
            .with_multiplier(3.0)
            .with_max_delay(Duration::from_secs(5))
            .with_jitter(false);
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.multiplier, 3.0);
        assert_eq!(policy.max_delay, Duration::from_secs(5));
        assert!(!policy.jitter);
        assert_eq!(ReconnectionPolicy::new().with_multiplier(0.5).multiplier, 1.0);
        assert_eq!(ReconnectionPolicy::new().with_multiplier(f64::NAN).multiplier, 1.0);
    }

    #[test]
    fn delay_is_exponential_then_capped() {
        let policy = no_jitter();
        for attempt in 0..policy.max_attempts {
            let expected = (1000u64 << attempt).min(30_000);
            assert_eq!(policy.delay_for(attempt), Duration::from_millis(expected));
        }
    }

    #[test]
    fn huge_attempt_saturates_at_max() {
        let policy = no_jitter().with_multiplier(10.0);
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn multiplier_below_one_is_clamped() {
        let policy = no_jitter().with_multiplier(0.5);
        assert_eq!(policy.delay_for(5), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let policy = ReconnectionPolicy::new();
        for attempt in 0..6 {
            let base = policy.delay_for(attempt);
            for _ in 0..200 {
                let d = policy.jittered_delay_for(attempt);
                assert!(d >= base, "{d:?} < {base:?}");
                assert!(d < base.mul_f64(1.25), "{d:?} >= 1.25 × {base:?}");
            }
        }
    }

    #[test]
    fn budget_hands_out_max_attempts_delays() {
        let mut budget = ReconnectionBudget::new(
            no_jitter()
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(1000)),
        );
        assert_eq!(budget.next_delay(), Some(Duration::from_millis(1000)));
        assert_eq!(budget.next_delay(), Some(Duration::from_millis(2000)));
        assert_eq!(budget.next_delay(), Some(Duration::from_millis(4000)));
        assert_eq!(budget.next_delay(), None);
        assert!(budget.is_exhausted());
        assert_eq!(budget.attempts(), 3);

        budget.reset();
        assert_eq!(budget.attempts(), 0);
        assert_eq!(budget.next_delay(), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn zero_budget_never_yields() {
        let mut budget = ReconnectionBudget::new(no_jitter().with_max_attempts(0));
        assert_eq!(budget.next_delay(), None);
    }
}
