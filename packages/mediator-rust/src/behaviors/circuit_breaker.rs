//! Circuit breaker guard.
//!
//! Calls are admitted through the breaker for their key in a shared
//! [`CircuitBreakerRegistry`]. An open circuit rejects with
//! `MediatorError::CircuitOpen` before the inner chain runs. The outcome of
//! an admitted call is recorded through [`MediatorError::counts_as_failure`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use courier_core::{MediatorError, Message};
use tower::{Layer, Service};

use crate::pipeline::Dispatch;
use crate::resilience::CircuitBreakerRegistry;

/// Which breaker a call goes through.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BreakerKey {
    /// One breaker per message type.
    #[default]
    MessageType,
    /// A named resource shared by every message type using this key.
    Fixed(String),
}

impl BreakerKey {
    fn resolve<M: Message>(&self) -> &str {
        match self {
            BreakerKey::MessageType => M::message_type(),
            BreakerKey::Fixed(key) => key,
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakerLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CircuitBreakerLayer {
    registry: Arc<CircuitBreakerRegistry>,
    key: BreakerKey,
}

impl CircuitBreakerLayer {
    #[must_use]
    pub fn new(registry: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            registry,
            key: BreakerKey::MessageType,
        }
    }

    #[must_use]
    pub fn with_key(mut self, key: BreakerKey) -> Self {
        self.key = key;
        self
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreakerService {
            inner,
            registry: Arc::clone(&self.registry),
            key: self.key.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakerService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CircuitBreakerService<S> {
    inner: S,
    registry: Arc<CircuitBreakerRegistry>,
    key: BreakerKey,
}

impl<S, M> Service<Dispatch<M>> for CircuitBreakerService<S>
where
    S: Service<Dispatch<M>, Error = MediatorError> + Send,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    M: Message,
{
    type Response = S::Response;
    type Error = MediatorError;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, MediatorError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, dispatch: Dispatch<M>) -> Self::Future {
        let breaker = self.registry.breaker(self.key.resolve::<M>());
        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(err) => {
                metrics::counter!("courier_circuit_rejections_total", "key" => breaker.key().to_string())
                    .increment(1);
                return Box::pin(async move { Err(err) });
            }
        };

        let fut = self.inner.call(dispatch);
        Box::pin(async move {
            let result = fut.await;
            permit.record(&result);
            result
        })
    }
}
