//! Built-in pipeline behaviors.
//!
//! Each behavior is a `tower::Layer` over services that handle
//! [`Dispatch<M>`](crate::pipeline::Dispatch), so it can be registered for
//! any message type with `request_behavior` / `event_behavior`, or composed
//! with plain tower layers.

pub mod circuit_breaker;
pub mod concurrency;
pub mod idempotency;
pub mod rate_limit;
pub mod retry;
pub mod timeout;

pub use circuit_breaker::{BreakerKey, CircuitBreakerLayer, CircuitBreakerService};
pub use concurrency::{ConcurrencyLimitLayer, ConcurrencyLimitService};
pub use idempotency::{IdempotencyLayer, IdempotencyService};
pub use rate_limit::{RateLimitLayer, RateLimitService};
pub use retry::{RetryLayer, RetryPredicate, RetryService};
pub use timeout::{TimeoutLayer, TimeoutService};

#[cfg(test)]
pub(crate) mod testing {
    //! Stub services shared by the behavior tests.

    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use courier_core::{Envelope, ManualClock, MediatorError, Message, MessageId};
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;
    use tower::Service;

    use crate::pipeline::{Dispatch, PipelineContext};

    #[derive(Debug)]
    pub struct Charge {
        pub cents: u64,
    }

    impl Message for Charge {
        fn message_type() -> &'static str {
            "payments.charge"
        }
    }

    pub fn dispatch_with_id(id: &str) -> Dispatch<Charge> {
        let envelope = Envelope::with_id(Charge { cents: 500 }, MessageId::new(id), 0);
        let ctx = PipelineContext::new(
            CancellationToken::new(),
            envelope.headers.correlation_id.clone(),
            "charge-handler",
        );
        Dispatch::new(envelope, ctx)
    }

    pub fn dispatch() -> Dispatch<Charge> {
        dispatch_with_id("m-1")
    }

    pub fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(1_000_000))
    }

    type Script = Arc<dyn Fn(u32) -> Result<u32, MediatorError> + Send + Sync>;

    /// Answers call `n` (1-based) with `script(n)` after `delay`, recording
    /// the attempt numbers it saw.
    #[derive(Clone)]
    pub struct Scripted {
        pub calls: Arc<AtomicU32>,
        pub attempts: Arc<Mutex<Vec<u32>>>,
        script: Script,
        delay: Duration,
    }

    impl Scripted {
        pub fn new(script: impl Fn(u32) -> Result<u32, MediatorError> + Send + Sync + 'static) -> Self {
            Self {
                calls: Arc::new(AtomicU32::new(0)),
                attempts: Arc::new(Mutex::new(Vec::new())),
                script: Arc::new(script),
                delay: Duration::ZERO,
            }
        }

        pub fn ok() -> Self {
            Self::new(Ok)
        }

        pub fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Service<Dispatch<Charge>> for Scripted {
        type Response = u32;
        type Error = MediatorError;
        type Future = Pin<Box<dyn Future<Output = Result<u32, MediatorError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, dispatch: Dispatch<Charge>) -> Self::Future {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.attempts.lock().push(dispatch.ctx.attempt);
            let result = (self.script)(n);
            let delay = self.delay;
            Box::pin(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                result
            })
        }
    }
}
