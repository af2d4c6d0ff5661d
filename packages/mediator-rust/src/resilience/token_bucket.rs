//! Lock-free token bucket.
//!
//! The whole bucket state lives in one `AtomicU64`:
//!
//! ```text
//!  63                        24 23            0
//! +----------------------------+---------------+
//! | last refill (ms, 40 bits)  | tokens (24)   |
//! +----------------------------+---------------+
//! ```
//!
//! Tokens are fixed-point with 8 fractional bits so slow refill rates still
//! accumulate between calls. The refill timestamp is relative to the bucket's
//! creation time, which gives 40 bits (about 34 years) of headroom.

use std::sync::atomic::{AtomicU64, Ordering};

use courier_core::{ConfigError, SharedClock};

use crate::config::RateLimitConfig;

const FRACTION_BITS: u32 = 8;
const ONE_TOKEN: u64 = 1 << FRACTION_BITS;
const TOKEN_BITS: u32 = 24;
const TOKEN_MASK: u64 = (1 << TOKEN_BITS) - 1;
const STAMP_MASK: u64 = (1 << 40) - 1;

/// Largest capacity representable in the packed state word.
pub const MAX_CAPACITY: u32 = (TOKEN_MASK >> FRACTION_BITS) as u32;

#[inline]
fn pack(stamp_ms: u64, tokens_fp: u64) -> u64 {
    ((stamp_ms & STAMP_MASK) << TOKEN_BITS) | (tokens_fp & TOKEN_MASK)
}

#[inline]
fn unpack(word: u64) -> (u64, u64) {
    (word >> TOKEN_BITS, word & TOKEN_MASK)
}

/// Token-bucket rate limiter with capacity C and refill rate R tokens/second.
pub struct TokenBucket {
    state: AtomicU64,
    capacity_fp: u64,
    refill_per_second: u64,
    clock: SharedClock,
    epoch_ms: u64,
}

impl TokenBucket {
    /// Creates a full bucket.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSetting` if the capacity is out of range.
    pub fn new(config: &RateLimitConfig, clock: SharedClock) -> Result<Self, ConfigError> {
        config.validate()?;
        let capacity_fp = u64::from(config.capacity) * ONE_TOKEN;
        Ok(Self {
            state: AtomicU64::new(pack(0, capacity_fp)),
            capacity_fp,
            refill_per_second: u64::from(config.refill_per_second),
            epoch_ms: clock.now(),
            clock,
        })
    }

    fn elapsed_ms(&self) -> u64 {
        self.clock.now().saturating_sub(self.epoch_ms) & STAMP_MASK
    }

    /// Refilled token count and stamp for `word` as of `now`.
    fn refilled(&self, word: u64, now: u64) -> (u64, u64) {
        let (stamp, tokens) = unpack(word);
        let elapsed = now.saturating_sub(stamp);
        let added = u128::from(elapsed) * u128::from(self.refill_per_second) * u128::from(ONE_TOKEN)
            / 1_000;
        if added == 0 {
            // Keep the old stamp so sub-resolution elapsed time is not lost.
            return (stamp, tokens);
        }
        let added = u64::try_from(added).unwrap_or(u64::MAX);
        (now, tokens.saturating_add(added).min(self.capacity_fp))
    }

    /// Takes `n` tokens if available. Never blocks.
    pub fn try_acquire(&self, n: u32) -> bool {
        let needed = u64::from(n) * ONE_TOKEN;
        if needed > self.capacity_fp {
            return false;
        }
        let now = self.elapsed_ms();
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let (stamp, tokens) = self.refilled(current, now);
            if tokens < needed {
                return false;
            }
            let next = pack(stamp, tokens - needed);
            match self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Whole tokens currently available (refill included).
    #[must_use]
    pub fn available(&self) -> u32 {
        let (_, tokens) = self.refilled(self.state.load(Ordering::Acquire), self.elapsed_ms());
        u32::try_from(tokens >> FRACTION_BITS).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        u32::try_from(self.capacity_fp >> FRACTION_BITS).unwrap_or(u32::MAX)
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .field("refill_per_second", &self.refill_per_second)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use courier_core::ManualClock;
    use proptest::prelude::*;

    use super::*;

    fn bucket(capacity: u32, refill_per_second: u32, clock: &ManualClock) -> TokenBucket {
        TokenBucket::new(
            &RateLimitConfig {
                capacity,
                refill_per_second,
            },
            Arc::new(clock.clone()),
        )
        .unwrap()
    }

    #[test]
    fn capacity_then_reject_without_elapsed_time() {
        let clock = ManualClock::new(10_000);
        let limiter = bucket(3, 1, &clock);
        assert!(limiter.try_acquire(1));
        assert!(limiter.try_acquire(1));
        assert!(limiter.try_acquire(1));
        assert!(!limiter.try_acquire(1));
    }

    #[test]
    fn refills_over_time_up_to_capacity() {
        let clock = ManualClock::new(0);
        let limiter = bucket(10, 5, &clock);
        assert!(limiter.try_acquire(10));
        assert_eq!(limiter.available(), 0);

        clock.advance(Duration::from_millis(400));
        assert_eq!(limiter.available(), 2);
        assert!(limiter.try_acquire(2));
        assert!(!limiter.try_acquire(1));

        clock.advance(Duration::from_secs(60));
        assert_eq!(limiter.available(), 10);
    }

    #[test]
    fn slow_refill_accumulates_fractions() {
        let clock = ManualClock::new(0);
        let limiter = bucket(1, 1, &clock);
        assert!(limiter.try_acquire(1));
        for _ in 0..10 {
            clock.advance(Duration::from_millis(100));
            let _ = limiter.try_acquire(1);
        }
        // Ten 100ms checks add up to one full token even though each check
        // alone saw only a tenth of one; the last check consumed it.
        assert_eq!(limiter.available(), 0);
    }

    #[test]
    fn oversized_request_fails() {
        let clock = ManualClock::new(0);
        let limiter = bucket(5, 5, &clock);
        assert!(!limiter.try_acquire(6));
        assert_eq!(limiter.available(), 5);
    }

    #[test]
    fn concurrent_acquires_never_exceed_capacity() {
        let clock = ManualClock::new(0);
        let limiter = Arc::new(bucket(500, 1, &clock));
        let granted = Arc::new(AtomicU64::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let granted = Arc::clone(&granted);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        if limiter.try_acquire(1) {
                            granted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(granted.load(Ordering::Relaxed), 500);
    }

    proptest! {
        #[test]
        fn at_most_capacity_succeeds_at_zero_elapsed(capacity in 1u32..2_000, attempts in 0u32..4_000) {
            let clock = ManualClock::new(1_000);
            let limiter = bucket(capacity, 50, &clock);
            let granted = (0..attempts).filter(|_| limiter.try_acquire(1)).count();
            prop_assert_eq!(granted as u32, attempts.min(capacity));
        }
    }
}
