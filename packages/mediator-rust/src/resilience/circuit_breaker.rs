//! Circuit breaker with a CAS-packed state word, and a keyed registry.
//!
//! State layout:
//!
//! ```text
//!  63 62 61            48 47      40 39                      0
//! +-----+----------------+----------+-------------------------+
//! |state| failures (14)  | trials(8)| stamp (ms, 40 bits)     |
//! +-----+----------------+----------+-------------------------+
//! ```
//!
//! `stamp` is relative to the breaker's creation. In `Closed` it marks the
//! start of the current failure streak, in `Open` the moment the circuit
//! opened, in `HalfOpen` the moment trials began.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use courier_core::{ConfigError, MediatorError, SharedClock};
use dashmap::DashMap;
use tracing::warn;

use crate::config::CircuitBreakerConfig;

const STATE_SHIFT: u32 = 62;
const FAILURE_SHIFT: u32 = 48;
const FAILURE_MASK: u64 = (1 << 14) - 1;
const TRIAL_SHIFT: u32 = 40;
const TRIAL_MASK: u64 = (1 << 8) - 1;
const STAMP_MASK: u64 = (1 << 40) - 1;

const CLOSED: u64 = 0;
const OPEN: u64 = 1;
const HALF_OPEN: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Word {
    state: u64,
    failures: u64,
    trials: u64,
    stamp: u64,
}

impl Word {
    fn decode(raw: u64) -> Self {
        Self {
            state: raw >> STATE_SHIFT,
            failures: (raw >> FAILURE_SHIFT) & FAILURE_MASK,
            trials: (raw >> TRIAL_SHIFT) & TRIAL_MASK,
            stamp: raw & STAMP_MASK,
        }
    }

    fn encode(self) -> u64 {
        (self.state << STATE_SHIFT)
            | ((self.failures & FAILURE_MASK) << FAILURE_SHIFT)
            | ((self.trials & TRIAL_MASK) << TRIAL_SHIFT)
            | (self.stamp & STAMP_MASK)
    }

    fn closed(stamp: u64) -> Self {
        Self {
            state: CLOSED,
            failures: 0,
            trials: 0,
            stamp,
        }
    }

    fn open(stamp: u64) -> Self {
        Self {
            state: OPEN,
            failures: 0,
            trials: 0,
            stamp,
        }
    }
}

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn from_bits(bits: u64) -> Self {
        match bits {
            OPEN => CircuitState::Open,
            HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

/// Breaker guarding one protected resource.
pub struct CircuitBreaker {
    key: String,
    state: AtomicU64,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    epoch_ms: u64,
}

impl CircuitBreaker {
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSetting` if `config` does not validate.
    pub fn new(
        key: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            key: key.into(),
            state: AtomicU64::new(Word::closed(0).encode()),
            config,
            epoch_ms: clock.now(),
            clock,
        })
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_bits(Word::decode(self.state.load(Ordering::Acquire)).state)
    }

    /// Failures in the current streak while closed.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        let word = Word::decode(self.state.load(Ordering::Acquire));
        u32::try_from(word.failures).unwrap_or(u32::MAX)
    }

    fn now(&self) -> u64 {
        self.clock.now().saturating_sub(self.epoch_ms) & STAMP_MASK
    }

    #[allow(clippy::cast_possible_truncation)]
    fn millis(duration: std::time::Duration) -> u64 {
        duration.as_millis() as u64
    }

    /// Applies `step` until its CAS wins. `step` returns `None` to leave the
    /// word unchanged, otherwise the replacement word.
    fn update<T>(&self, mut step: impl FnMut(Word) -> (Option<Word>, T)) -> (Word, Option<Word>, T) {
        let mut raw = self.state.load(Ordering::Acquire);
        loop {
            let current = Word::decode(raw);
            let (next, out) = step(current);
            let Some(next) = next else {
                return (current, None, out);
            };
            match self.state.compare_exchange_weak(
                raw,
                next.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return (current, Some(next), out),
                Err(observed) => raw = observed,
            }
        }
    }

    fn transitioned(&self, from: Word, to: Option<Word>) {
        let Some(to) = to else { return };
        if from.state == to.state {
            return;
        }
        let from = CircuitState::from_bits(from.state);
        let to = CircuitState::from_bits(to.state);
        warn!(key = %self.key, from = from.as_str(), to = to.as_str(), "circuit breaker transition");
        metrics::counter!(
            "courier_circuit_transitions_total",
            "key" => self.key.clone(),
            "to" => to.as_str(),
        )
        .increment(1);
    }

    /// Admits a call or fails fast.
    ///
    /// # Errors
    ///
    /// Returns `MediatorError::CircuitOpen` while open (cooldown not yet
    /// elapsed) or while every half-open trial slot is taken.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, MediatorError> {
        let now = self.now();
        let cooldown = Self::millis(self.config.cooldown);
        let max_trials = u64::from(self.config.half_open_max_trials);

        let (from, to, admitted) = self.update(|word| match word.state {
            OPEN if now.saturating_sub(word.stamp) >= cooldown => (
                Some(Word {
                    state: HALF_OPEN,
                    failures: 0,
                    trials: 1,
                    stamp: now,
                }),
                Some(true),
            ),
            OPEN => (None, None),
            HALF_OPEN if word.trials < max_trials => (
                Some(Word {
                    trials: word.trials + 1,
                    ..word
                }),
                Some(true),
            ),
            HALF_OPEN => (None, None),
            _ => (None, Some(false)),
        });
        self.transitioned(from, to);

        match admitted {
            Some(trial) => Ok(BreakerPermit {
                breaker: Arc::clone(self),
                trial,
                settled: false,
            }),
            None => Err(MediatorError::CircuitOpen {
                key: self.key.clone(),
            }),
        }
    }

    fn on_success(&self, trial: bool) {
        let now = self.now();
        let (from, to, ()) = self.update(|word| match word.state {
            CLOSED if word.failures > 0 => (Some(Word::closed(word.stamp)), ()),
            HALF_OPEN if trial => (Some(Word::closed(now)), ()),
            _ => (None, ()),
        });
        self.transitioned(from, to);
    }

    fn on_failure(&self, trial: bool) {
        let now = self.now();
        let window = Self::millis(self.config.window);
        let threshold = u64::from(self.config.failure_threshold);
        let (from, to, ()) = self.update(|word| match word.state {
            CLOSED => {
                let streak_expired =
                    word.failures == 0 || now.saturating_sub(word.stamp) > window;
                let (failures, stamp) = if streak_expired {
                    (1, now)
                } else {
                    (word.failures + 1, word.stamp)
                };
                if failures >= threshold {
                    (Some(Word::open(now)), ())
                } else {
                    (
                        Some(Word {
                            failures,
                            stamp,
                            ..word
                        }),
                        (),
                    )
                }
            }
            HALF_OPEN if trial => (Some(Word::open(now)), ()),
            _ => (None, ()),
        });
        self.transitioned(from, to);
    }

    fn on_release(&self, trial: bool) {
        if !trial {
            return;
        }
        let _ = self.update(|word| match word.state {
            HALF_OPEN if word.trials > 0 => (
                Some(Word {
                    trials: word.trials - 1,
                    ..word
                }),
                (),
            ),
            _ => (None, ()),
        });
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("failures", &self.failure_count())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// BreakerPermit
// ---------------------------------------------------------------------------

/// Admission to one guarded call. Dropping an unsettled permit releases it
/// without counting a success or a failure.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    settled: bool,
}

impl BreakerPermit {
    /// Whether this call is a half-open trial.
    #[must_use]
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }

    /// Settles the permit from a call outcome using
    /// [`MediatorError::counts_as_failure`].
    pub fn record<T>(self, result: &Result<T, MediatorError>) {
        match result {
            Ok(_) => self.record_success(),
            Err(err) if err.counts_as_failure() => self.record_failure(),
            Err(_) => drop(self),
        }
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_release(self.trial);
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakerRegistry
// ---------------------------------------------------------------------------

/// Process-wide breakers keyed by protected resource.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    clock: SharedClock,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("config", &self.config)
            .field("breakers", &self.breakers.len())
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerRegistry {
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSetting` if `config` does not validate.
    pub fn new(config: CircuitBreakerConfig, clock: SharedClock) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            breakers: DashMap::new(),
        })
    }

    /// Returns the breaker for `key`, creating it closed on first use.
    pub fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(key) {
            return Arc::clone(existing.value());
        }
        let entry = self.breakers.entry(key.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker {
                key: key.to_string(),
                state: AtomicU64::new(Word::closed(0).encode()),
                config: self.config.clone(),
                epoch_ms: self.clock.now(),
                clock: Arc::clone(&self.clock),
            })
        });
        Arc::clone(entry.value())
    }

    #[must_use]
    pub fn state(&self, key: &str) -> Option<CircuitState> {
        self.breakers.get(key).map(|b| b.state())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Drops every breaker; the next call per key starts closed.
    pub fn clear(&self) {
        self.breakers.clear();
    }
}
