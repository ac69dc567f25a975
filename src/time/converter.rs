//! Expiration Converter Module
//!
//! Turns caller-facing expiration policies into the three persisted columns
//! (`absolute_expiration`, `sliding_interval`, `next_expiration`).

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::cache::ExpirationPolicy;
use crate::error::{CacheError, Result};
use crate::time::clock::{add_saturating, far_future, SharedClock};

/// Valid durations below this are logged at info level.
const SHORT_LIVED_THRESHOLD: Duration = Duration::from_secs(1);

// == Resolved Expiration ==
/// Expiration columns computed for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedExpiration {
    pub absolute: Option<DateTime<Utc>>,
    pub sliding: Option<Duration>,
    pub next: DateTime<Utc>,
}

// == Expiration Converter ==
/// Converts expirations against an injected clock, clamping to configured bounds.
#[derive(Debug, Clone)]
pub struct ExpirationConverter {
    clock: SharedClock,
    min: Duration,
    max: Duration,
}

impl ExpirationConverter {
    /// Creates a converter.
    ///
    /// # Arguments
    /// * `clock` - Time source
    /// * `min` - Lower clamp; past or too-close instants become this
    /// * `max` - Upper clamp
    pub fn new(clock: SharedClock, min: Duration, max: Duration) -> Self {
        Self { clock, min, max }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // == Convert To Relative Interval ==
    /// Converts an absolute instant into a duration from now.
    ///
    /// Instants at or before now are not rejected: they yield the minimum
    /// clamp so the entry expires almost immediately.
    pub fn convert_to_relative_interval(
        &self,
        absolute: Option<DateTime<Utc>>,
    ) -> Option<Duration> {
        absolute.map(|at| self.relative_interval_at(self.clock.now(), at))
    }

    fn relative_interval_at(&self, now: DateTime<Utc>, at: DateTime<Utc>) -> Duration {
        let Ok(relative) = (at - now).to_std() else {
            warn!(
                absolute = %at,
                now = %now,
                clamped = ?self.min,
                "Absolute expiration is in the past, using minimum expiration"
            );
            return self.min;
        };

        if relative.is_zero() {
            warn!(absolute = %at, clamped = ?self.min, "Absolute expiration is now, using minimum expiration");
            self.min
        } else if relative < self.min {
            warn!(
                requested = ?relative,
                clamped = ?self.min,
                "Expiration below configured minimum, clamping"
            );
            self.min
        } else if relative > self.max {
            warn!(
                requested = ?relative,
                clamped = ?self.max,
                "Expiration above configured maximum, clamping"
            );
            self.max
        } else {
            if relative < SHORT_LIVED_THRESHOLD {
                info!(requested = ?relative, "Short-lived cache entry");
            }
            relative
        }
    }

    // == Resolve ==
    /// Computes the persisted expiration columns for a write made now.
    ///
    /// # Arguments
    /// * `policy` - Caller's policy
    /// * `default_sliding` - Applied when `policy` is empty
    pub fn resolve(
        &self,
        policy: &ExpirationPolicy,
        default_sliding: Option<Duration>,
    ) -> Result<ResolvedExpiration> {
        let now = self.clock.now();

        let requested_absolute = match (policy.absolute, policy.relative_to_now) {
            (Some(at), Some(after)) => Some(at.min(add_saturating(now, after))),
            (Some(at), None) => Some(at),
            (None, Some(after)) => Some(add_saturating(now, after)),
            (None, None) => None,
        };
        let absolute = requested_absolute
            .map(|at| add_saturating(now, self.relative_interval_at(now, at)));

        let sliding = if policy.is_empty() {
            default_sliding
        } else {
            policy.sliding
        };
        if matches!(sliding, Some(d) if d.is_zero()) {
            return Err(CacheError::InvalidArgument(
                "sliding expiration must be positive".to_string(),
            ));
        }

        Ok(ResolvedExpiration {
            absolute,
            sliding,
            next: next_expiration(now, absolute, sliding),
        })
    }
}

/// Earliest instant at which an entry becomes stale.
pub fn next_expiration(
    now: DateTime<Utc>,
    absolute: Option<DateTime<Utc>>,
    sliding: Option<Duration>,
) -> DateTime<Utc> {
    match (absolute, sliding) {
        (Some(at), Some(window)) => at.min(add_saturating(now, window)),
        (Some(at), None) => at,
        (None, Some(window)) => add_saturating(now, window),
        (None, None) => far_future(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeDelta;
    use tracing_test::traced_test;

    use super::*;
    use crate::time::clock::Clock;
    use crate::time::ManualClock;

    const MIN: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(3600);

    fn converter() -> (Arc<ManualClock>, ExpirationConverter) {
        let clock = Arc::new(ManualClock::default());
        let converter = ExpirationConverter::new(clock.clone(), MIN, MAX);
        (clock, converter)
    }

    #[test]
    fn test_none_stays_none() {
        let (_, converter) = converter();
        assert_eq!(converter.convert_to_relative_interval(None), None);
    }

    #[test]
    fn test_past_instant_returns_minimum() {
        let (clock, converter) = converter();
        let past = clock.now() - TimeDelta::minutes(5);
        assert_eq!(converter.convert_to_relative_interval(Some(past)), Some(MIN));
    }

    #[test]
    fn test_now_returns_minimum() {
        let (clock, converter) = converter();
        assert_eq!(converter.convert_to_relative_interval(Some(clock.now())), Some(MIN));
    }

    #[test]
    fn test_below_minimum_is_clamped() {
        let (clock, converter) = converter();
        let soon = clock.now() + TimeDelta::milliseconds(200);
        assert_eq!(converter.convert_to_relative_interval(Some(soon)), Some(MIN));
    }

    #[test]
    fn test_above_maximum_is_clamped() {
        let (clock, converter) = converter();
        let later = clock.now() + TimeDelta::hours(5);
        assert_eq!(converter.convert_to_relative_interval(Some(later)), Some(MAX));
    }

    #[test]
    fn test_in_range_passes_through() {
        let (clock, converter) = converter();
        let later = clock.now() + TimeDelta::minutes(10);
        assert_eq!(
            converter.convert_to_relative_interval(Some(later)),
            Some(Duration::from_secs(600))
        );
    }

    #[test]
    #[traced_test]
    fn test_only_sub_second_durations_log_as_short_lived() {
        let clock = Arc::new(ManualClock::default());
        let converter = ExpirationConverter::new(clock.clone(), Duration::from_millis(100), MAX);

        let two_seconds = clock.now() + TimeDelta::seconds(2);
        converter.convert_to_relative_interval(Some(two_seconds));
        assert!(!logs_contain("Short-lived cache entry"));

        let half_second = clock.now() + TimeDelta::milliseconds(500);
        assert_eq!(
            converter.convert_to_relative_interval(Some(half_second)),
            Some(Duration::from_millis(500))
        );
        assert!(logs_contain("Short-lived cache entry"));
    }

    #[test]
    fn test_resolve_empty_policy_uses_sentinel() {
        let (_, converter) = converter();
        let resolved = converter.resolve(&ExpirationPolicy::default(), None).unwrap();
        assert_eq!(resolved.absolute, None);
        assert_eq!(resolved.sliding, None);
        assert_eq!(resolved.next, far_future());
    }

    #[test]
    fn test_resolve_empty_policy_uses_default_sliding() {
        let (clock, converter) = converter();
        let resolved = converter
            .resolve(&ExpirationPolicy::default(), Some(Duration::from_secs(60)))
            .unwrap();
        assert_eq!(resolved.sliding, Some(Duration::from_secs(60)));
        assert_eq!(resolved.next, clock.now() + TimeDelta::seconds(60));
    }

    #[test]
    fn test_resolve_takes_earliest_of_absolute_and_sliding() {
        let (clock, converter) = converter();
        let policy = ExpirationPolicy::new()
            .absolute_at(clock.now() + TimeDelta::minutes(2))
            .sliding(Duration::from_secs(600));

        let resolved = converter.resolve(&policy, None).unwrap();

        assert_eq!(resolved.next, clock.now() + TimeDelta::minutes(2));
        assert_eq!(resolved.absolute, Some(clock.now() + TimeDelta::minutes(2)));
    }

    #[test]
    fn test_resolve_relative_and_absolute_prefers_earlier() {
        let (clock, converter) = converter();
        let policy = ExpirationPolicy::new()
            .absolute_at(clock.now() + TimeDelta::minutes(30))
            .expire_after(Duration::from_secs(60));

        let resolved = converter.resolve(&policy, None).unwrap();

        assert_eq!(resolved.absolute, Some(clock.now() + TimeDelta::seconds(60)));
    }

    #[test]
    fn test_resolve_clamps_past_absolute() {
        let (clock, converter) = converter();
        let policy = ExpirationPolicy::new().absolute_at(clock.now() - TimeDelta::hours(1));

        let resolved = converter.resolve(&policy, None).unwrap();

        assert_eq!(resolved.next, clock.now() + TimeDelta::seconds(1));
    }

    #[test]
    fn test_resolve_rejects_zero_sliding() {
        let (_, converter) = converter();
        let policy = ExpirationPolicy::new().sliding(Duration::ZERO);
        assert!(matches!(
            converter.resolve(&policy, None),
            Err(CacheError::InvalidArgument(_))
        ));
    }
}
