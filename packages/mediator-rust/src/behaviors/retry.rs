//! Retry with backoff.
//!
//! Re-runs the inner chain while the failure matches the predicate
//! (transient failures by default) and the retry budget lasts. Every attempt
//! reuses the same envelope, so the message id never changes; the context's
//! `attempt` counter advances. Backoff sleeps end early on cancellation.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use courier_core::{MediatorError, Message};
use tower::{Layer, Service, ServiceExt};
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::pipeline::Dispatch;

/// Decides whether a failure is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&MediatorError) -> bool + Send + Sync>;

// ---------------------------------------------------------------------------
// RetryLayer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RetryLayer {
    config: Arc<RetryConfig>,
    predicate: RetryPredicate,
}

impl RetryLayer {
    /// Retries transient failures (see [`MediatorError::is_transient`]).
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config: Arc::new(config),
            predicate: Arc::new(MediatorError::is_transient),
        }
    }

    /// Replaces the retry predicate.
    #[must_use]
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&MediatorError) -> bool + Send + Sync + 'static,
    {
        self.predicate = Arc::new(predicate);
        self
    }
}

impl fmt::Debug for RetryLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryLayer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            config: Arc::clone(&self.config),
            predicate: Arc::clone(&self.predicate),
        }
    }
}

// ---------------------------------------------------------------------------
// RetryService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RetryService<S> {
    inner: S,
    config: Arc<RetryConfig>,
    predicate: RetryPredicate,
}

impl<S: fmt::Debug> fmt::Debug for RetryService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryService")
            .field("inner", &self.inner)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S, M> Service<Dispatch<M>> for RetryService<S>
where
    S: Service<Dispatch<M>, Error = MediatorError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    M: Message,
{
    type Response = S::Response;
    type Error = MediatorError;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, MediatorError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness is checked per attempt on a fresh clone of `inner`.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dispatch: Dispatch<M>) -> Self::Future {
        let inner = self.inner.clone();
        let config = Arc::clone(&self.config);
        let predicate = Arc::clone(&self.predicate);
        let message_type = M::message_type();

        Box::pin(async move {
            let mut dispatch = dispatch;
            let mut retry = 0u32;
            loop {
                let err = match inner.clone().oneshot(dispatch.clone()).await {
                    Ok(response) => return Ok(response),
                    Err(err) => err,
                };
                if retry >= config.max_retries || dispatch.ctx.is_cancelled() || !predicate(&err) {
                    if retry > 0 {
                        debug!(message_type, attempts = retry + 1, error = %err, "retries exhausted");
                    }
                    return Err(err);
                }

                let delay = config.backoff.delay(retry);
                metrics::counter!("courier_retries_total", "message_type" => message_type).increment(1);
                warn!(
                    message_type,
                    message_id = %dispatch.envelope.id(),
                    attempt = dispatch.ctx.attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "retrying after failure"
                );

                tokio::select! {
                    biased;
                    () = dispatch.ctx.cancellation.cancelled() => return Err(MediatorError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
                retry += 1;
                dispatch.ctx.attempt += 1;
            }
        })
    }
}
