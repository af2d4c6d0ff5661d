//! Token-bucket admission.
//!
//! Each call takes one token from a shared [`TokenBucket`]. An empty bucket
//! rejects immediately with `MediatorError::CapacityExceeded`; callers are
//! never queued.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use courier_core::{ConfigError, MediatorError, Message, SharedClock};
use tower::{Layer, Service};
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::pipeline::Dispatch;
use crate::resilience::TokenBucket;

// ---------------------------------------------------------------------------
// RateLimitLayer
// ---------------------------------------------------------------------------

/// Layer sharing one bucket across every service it produces.
#[derive(Debug, Clone)]
pub struct RateLimitLayer {
    bucket: Arc<TokenBucket>,
    resource: Arc<str>,
}

impl RateLimitLayer {
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSetting` if the capacity is out of range.
    pub fn new(
        resource: impl Into<String>,
        config: &RateLimitConfig,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        Ok(Self::from_bucket(resource, Arc::new(TokenBucket::new(config, clock)?)))
    }

    /// Uses an existing bucket, for limits shared across message types.
    #[must_use]
    pub fn from_bucket(resource: impl Into<String>, bucket: Arc<TokenBucket>) -> Self {
        Self {
            bucket,
            resource: Arc::from(resource.into()),
        }
    }

    #[must_use]
    pub fn bucket(&self) -> &Arc<TokenBucket> {
        &self.bucket
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            bucket: Arc::clone(&self.bucket),
            resource: Arc::clone(&self.resource),
        }
    }
}

// ---------------------------------------------------------------------------
// RateLimitService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RateLimitService<S> {
    inner: S,
    bucket: Arc<TokenBucket>,
    resource: Arc<str>,
}

impl<S, M> Service<Dispatch<M>> for RateLimitService<S>
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
        if !self.bucket.try_acquire(1) {
            let resource = self.resource.to_string();
            metrics::counter!("courier_rate_limited_total", "resource" => resource.clone()).increment(1);
            debug!(resource = %resource, message_type = M::message_type(), "rate limited");
            return Box::pin(async move { Err(MediatorError::CapacityExceeded { resource }) });
        }
        Box::pin(self.inner.call(dispatch))
    }
}
