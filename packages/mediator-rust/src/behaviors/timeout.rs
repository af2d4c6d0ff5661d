//! Per-call deadline.
//!
//! Fails the call with `MediatorError::Timeout` once the deadline passes.
//! The inner future is dropped at that point, which cancels everything
//! below this layer at its next suspension point.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use courier_core::{MediatorError, Message};
use tower::{Layer, Service};
use tracing::warn;

use crate::pipeline::Dispatch;

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer {
    timeout: Duration,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            timeout: self.timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    timeout: Duration,
}

impl<S, M> Service<Dispatch<M>> for TimeoutService<S>
where
    S: Service<Dispatch<M>, Error = MediatorError> + Send,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    M: Message + 'static,
{
    type Response = S::Response;
    type Error = MediatorError;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, MediatorError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, dispatch: Dispatch<M>) -> Self::Future {
        let timeout = self.timeout;
        let message_type = M::message_type();
        let fut = self.inner.call(dispatch);
        Box::pin(async move {
            match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                    metrics::counter!("courier_timeouts_total", "message_type" => message_type).increment(1);
                    warn!(message_type, timeout_ms, "call timed out");
                    Err(MediatorError::Timeout { timeout_ms })
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::*;
    use crate::behaviors::testing::{dispatch, Scripted};

    #[tokio::test(start_paused = true)]
    async fn completes_within_timeout() {
        let svc = TimeoutLayer::new(Duration::from_millis(100))
            .layer(Scripted::ok().delayed(Duration::from_millis(10)));
        assert_eq!(svc.oneshot(dispatch()).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exceeds_timeout_returns_error() {
        let svc = TimeoutLayer::new(Duration::from_millis(50))
            .layer(Scripted::ok().delayed(Duration::from_millis(200)));
        let err = svc.oneshot(dispatch()).await.unwrap_err();
        assert!(matches!(err, MediatorError::Timeout { timeout_ms: 50 }));
    }
}
