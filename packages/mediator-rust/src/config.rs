//! Configuration for the mediator, its behaviors, stores and transports.
//!
//! Every struct has a `Default` with production-safe values. Constructors
//! that accept a config call its `validate()` and report problems as
//! [`ConfigError`] before anything runs.

use std::time::Duration;

use courier_core::ConfigError;

use crate::resilience::Backoff;

// ---------------------------------------------------------------------------
// Mediator
// ---------------------------------------------------------------------------

/// How `publish` fans an event out to its handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishStrategy {
    /// Handlers run one after another, in registration order.
    Sequential,
    /// Handlers run concurrently on the calling task.
    #[default]
    Concurrent,
}

#[derive(Debug, Clone, Default)]
pub struct MediatorConfig {
    pub publish_strategy: PublishStrategy,
}

// ---------------------------------------------------------------------------
// Resilience
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt. 0 disables retrying.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(50),
                max: Duration::from_secs(2),
                jitter: true,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures within `window` that open the circuit.
    pub failure_threshold: u32,
    /// A failure streak older than this starts over.
    pub window: Duration,
    /// How long the circuit stays open before admitting trial calls.
    pub cooldown: Duration,
    /// Concurrent trial calls admitted while half-open.
    pub half_open_max_trials: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(30),
            cooldown: Duration::from_secs(10),
            half_open_max_trials: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSetting` if a counter is zero or does not
    /// fit the breaker's packed state word.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 || self.failure_threshold > 16_383 {
            return Err(ConfigError::InvalidSetting {
                field: "failure_threshold",
                reason: "must be between 1 and 16383".into(),
            });
        }
        if self.half_open_max_trials == 0 || self.half_open_max_trials > 255 {
            return Err(ConfigError::InvalidSetting {
                field: "half_open_max_trials",
                reason: "must be between 1 and 255".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Bucket capacity C (burst size), in whole tokens.
    pub capacity: u32,
    /// Refill rate R, tokens per second.
    pub refill_per_second: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            refill_per_second: 100,
        }
    }
}

impl RateLimitConfig {
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSetting` if the capacity is zero or too
    /// large for the bucket's packed state word.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 || self.capacity > crate::resilience::token_bucket::MAX_CAPACITY {
            return Err(ConfigError::InvalidSetting {
                field: "capacity",
                reason: format!(
                    "must be between 1 and {}",
                    crate::resilience::token_bucket::MAX_CAPACITY
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConcurrencyLimitConfig {
    pub max_in_flight: u32,
    /// How long a caller may wait for a slot. Zero rejects immediately.
    pub acquire_timeout: Duration,
}

impl Default for ConcurrencyLimitConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1000,
            acquire_timeout: Duration::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// What the idempotency behavior does when its store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// Reject the call with `StoreUnavailable`.
    #[default]
    Closed,
    /// Run the handler without deduplication.
    Open,
}

#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// Retention of completed outcomes. TTL is the only eviction policy.
    pub ttl: Duration,
    /// How long a `Processing` claim blocks other claimants before it may be taken over.
    pub processing_lease: Duration,
    pub failure_mode: FailureMode,
    /// How long a losing concurrent caller waits for the winner's outcome.
    pub in_flight_wait: Duration,
    pub poll_interval: Duration,
    /// Report repeats as `DuplicateMessage` instead of returning the cached outcome.
    pub surface_duplicates: bool,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            processing_lease: Duration::from_secs(30),
            failure_mode: FailureMode::Closed,
            in_flight_wait: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
            surface_duplicates: false,
        }
    }
}

impl IdempotencyConfig {
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSetting` for zero durations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl.is_zero() {
            return Err(ConfigError::InvalidSetting {
                field: "ttl",
                reason: "must be non-zero".into(),
            });
        }
        if self.processing_lease.is_zero() {
            return Err(ConfigError::InvalidSetting {
                field: "processing_lease",
                reason: "must be non-zero".into(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidSetting {
                field: "poll_interval",
                reason: "must be non-zero".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InboxConfig {
    /// How long processed markers are kept to reject late redeliveries.
    pub retention: Duration,
    /// How long a claim blocks redeliveries before it may be taken over.
    pub claim_lease: Duration,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            claim_lease: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Interval between drains of pending entries.
    pub poll_interval: Duration,
    /// Maximum entries published per drain.
    pub batch_size: usize,
    /// Publish attempts before an entry is marked `Failed`.
    pub max_attempts: u32,
    /// How long `Published` entries are kept before expiring.
    pub published_retention: Duration,
    /// How long `Failed` entries are kept; `None` keeps them until removed.
    pub failed_retention: Option<Duration>,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
            max_attempts: 5,
            published_retention: Duration::from_secs(24 * 60 * 60),
            failed_retention: Some(crate::storage::outbox::DEFAULT_FAILED_RETENTION),
        }
    }
}

impl OutboxConfig {
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSetting` for a zero batch size or attempt budget.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "batch_size",
                reason: "must be non-zero".into(),
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "max_attempts",
                reason: "must be non-zero".into(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Settings for [`InProcessTransport`](crate::transport::InProcessTransport).
#[derive(Debug, Clone)]
pub struct InProcessTransportConfig {
    /// Bounded queue capacity per subscription.
    pub queue_capacity: usize,
    /// How long an acknowledged publish waits for queue space.
    pub ack_timeout: Duration,
    /// Redeliveries after a nack before a delivery is dropped.
    pub max_redeliveries: u32,
    pub redelivery_delay: Duration,
}

impl Default for InProcessTransportConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            ack_timeout: Duration::from_secs(5),
            max_redeliveries: 5,
            redelivery_delay: Duration::from_millis(50),
        }
    }
}
