//! Backoff Module
//!
//! Delay computation between retry attempts.

use std::str::FromStr;
use std::time::Duration;

/// Fraction of the delay used as the jitter window (+/- half of it).
const JITTER_FACTOR: f64 = 0.5;

// == Backoff Strategy ==
/// How the delay grows between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// `attempt * base`
    Linear,
    /// `base * 2^(attempt - 1)`
    Exponential,
    /// Exponential, randomized by +/- 25%
    ExponentialWithJitter,
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            "exponential_jitter" | "exponentialwithjitter" | "jitter" => {
                Ok(Self::ExponentialWithJitter)
            }
            other => Err(format!("unknown backoff strategy '{other}'")),
        }
    }
}

impl BackoffStrategy {
    /// Delay to wait after the given failed attempt (1-based), capped at `max`.
    pub fn delay(&self, attempt: u32, base: Duration, max: Duration) -> Duration {
        self.delay_with_random(attempt, base, max, fastrand::f64())
    }

    /// Same as [`BackoffStrategy::delay`] with the random sample supplied; `random` is in `[0, 1)`.
    pub fn delay_with_random(
        &self,
        attempt: u32,
        base: Duration,
        max: Duration,
        random: f64,
    ) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self {
            Self::Linear => base.saturating_mul(attempt),
            Self::Exponential => exponential(base, attempt),
            Self::ExponentialWithJitter => apply_jitter(exponential(base, attempt), random),
        };
        delay.min(max)
    }
}

fn exponential(base: Duration, attempt: u32) -> Duration {
    let factor = 2f64.powi(i32::try_from(attempt - 1).unwrap_or(i32::MAX));
    secs_to_duration_saturating(base.as_secs_f64() * factor)
}

/// Centers a uniform jitter on `delay`; the result lies in `[0.75 * delay, 1.25 * delay]`.
fn apply_jitter(delay: Duration, random: f64) -> Duration {
    let secs = delay.as_secs_f64();
    let window = secs * JITTER_FACTOR;
    secs_to_duration_saturating(secs - window / 2.0 + window * random)
}

fn secs_to_duration_saturating(secs: f64) -> Duration {
    if secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
