//! Lock-free resilience primitives used by the pipeline behaviors.

pub mod backoff;
pub mod circuit_breaker;
pub mod token_bucket;

pub use backoff::Backoff;
pub use circuit_breaker::{BreakerPermit, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use token_bucket::TokenBucket;
