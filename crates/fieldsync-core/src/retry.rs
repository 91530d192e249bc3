//! Retry policy
//!
//! Pure backoff schedule: retry `n` waits `base * multiplier^(n-1)`.
//! Past `max_attempts` the policy returns `None` and the caller must treat
//! that as exhaustion (queue the change), never as "retry forever". The
//! propagation loop stops after attempt `max_attempts`, so only the first
//! `max_attempts - 1` delays are ever slept.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ErrorKind;

/// Pluggable jitter applied to a computed delay
///
/// Implementations must be deterministic for a given input if callers rely
/// on reproducible schedules.
pub trait Jitter: Send + Sync {
    fn apply(&self, attempt: u32, delay: Duration) -> Duration;
}

/// Proportional jitter: shifts a delay by a fixed fraction derived from the attempt
///
/// Spreads retries of different attempt numbers apart while keeping the
/// schedule reproducible.
#[derive(Debug, Clone, Copy)]
pub struct ProportionalJitter {
    /// Maximum fraction of the delay added (0.0-1.0)
    pub factor: f64,
}

impl Jitter for ProportionalJitter {
    fn apply(&self, attempt: u32, delay: Duration) -> Duration {
        let factor = self.factor.clamp(0.0, 1.0);
        // Cycle through [0, factor) in fifths so consecutive attempts differ
        let step = f64::from(attempt % 5) / 5.0;
        delay.mul_f64(1.0 + factor * step)
    }
}

/// A scheduled retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    pub attempt_number: u32,
    pub scheduled_delay: Duration,
    pub cause: ErrorKind,
}

/// Exponential backoff schedule
#[derive(Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Growth factor per retry
    pub multiplier: f64,
    /// Propagation attempts allowed per call, the first one included
    pub max_attempts: u32,
    /// Upper bound for a single delay
    pub max_delay: Option<Duration>,
    jitter: Option<Arc<dyn Jitter>>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("base", &self.base)
            .field("multiplier", &self.multiplier)
            .field("max_attempts", &self.max_attempts)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 2.0, 3)
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, multiplier: f64, max_attempts: u32) -> Self {
        Self {
            base,
            multiplier,
            max_attempts,
            max_delay: None,
            jitter: None,
        }
    }

    /// Cap every delay at `max_delay`
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Apply a jitter function to every delay
    pub fn with_jitter(mut self, jitter: Arc<dyn Jitter>) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Delay after failed attempt `n` (1-based), or `None` past `max_attempts`
    pub fn delay_for_attempt(&self, n: u32) -> Option<Duration> {
        if n == 0 || n > self.max_attempts {
            return None;
        }

        let exponent = i32::try_from(n - 1).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(0.0).powi(exponent);
        let mut delay = if factor.is_finite() {
            Duration::try_from_secs_f64(self.base.as_secs_f64() * factor).unwrap_or(Duration::MAX)
        } else {
            Duration::MAX
        };

        if let Some(max_delay) = self.max_delay {
            delay = delay.min(max_delay);
        }
        if let Some(ref jitter) = self.jitter {
            delay = jitter.apply(n, delay);
        }
        Some(delay)
    }

    /// Describe retry `n` caused by `cause`; `None` when the cause is not
    /// retryable or retries are exhausted
    pub fn attempt(&self, n: u32, cause: ErrorKind) -> Option<RetryAttempt> {
        if !cause.is_retryable() {
            return None;
        }
        self.delay_for_attempt(n).map(|scheduled_delay| RetryAttempt {
            attempt_number: n,
            scheduled_delay,
            cause,
        })
    }

    /// The complete schedule of retry delays
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_attempts)
            .filter_map(|n| self.delay_for_attempt(n))
            .collect()
    }
}
