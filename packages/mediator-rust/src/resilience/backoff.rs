//! Retry delay schedules.

use std::time::Duration;

use rand::Rng;

/// Delay between retry attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed(Duration),
    /// `base * 2^retry`, capped at `max`.
    ///
    /// With `jitter`, the delay is drawn uniformly from the upper half of
    /// the capped value so concurrent retriers spread out but never retry
    /// sooner than half the schedule.
    Exponential {
        base: Duration,
        max: Duration,
        jitter: bool,
    },
}

impl Backoff {
    /// Delay before retry number `retry` (0-based).
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential { base, max, jitter } => {
                let factor = 1u32.checked_shl(retry.min(31)).unwrap_or(u32::MAX);
                let capped = base.saturating_mul(factor).min(*max);
                if *jitter {
                    let half = capped / 2;
                    let spread = u64::try_from(half.as_micros()).unwrap_or(u64::MAX);
                    half + Duration::from_micros(rand::rng().random_range(0..=spread))
                } else {
                    capped
                }
            }
        }
    }
}
