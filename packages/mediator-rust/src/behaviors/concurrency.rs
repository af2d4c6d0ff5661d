//! Concurrency limiter.
//!
//! At most `max_in_flight` calls run below this layer at once. A caller that
//! cannot get a slot within `acquire_timeout` (immediately, when zero) is
//! rejected with `MediatorError::CapacityExceeded`. Waiting ends early on
//! cancellation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use courier_core::{ConfigError, MediatorError, Message};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower::{Layer, Service};
use tracing::debug;

use crate::config::ConcurrencyLimitConfig;
use crate::pipeline::Dispatch;

// ---------------------------------------------------------------------------
// ConcurrencyLimitLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConcurrencyLimitLayer {
    semaphore: Arc<Semaphore>,
    acquire_timeout: Duration,
    resource: Arc<str>,
}

impl ConcurrencyLimitLayer {
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSetting` if `max_in_flight` is zero.
    pub fn new(resource: impl Into<String>, config: &ConcurrencyLimitConfig) -> Result<Self, ConfigError> {
        if config.max_in_flight == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "max_in_flight",
                reason: "must be non-zero".into(),
            });
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.max_in_flight as usize)),
            acquire_timeout: config.acquire_timeout,
            resource: Arc::from(resource.into()),
        })
    }

    /// Slots currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl<S> Layer<S> for ConcurrencyLimitLayer {
    type Service = ConcurrencyLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ConcurrencyLimitService {
            inner,
            semaphore: Arc::clone(&self.semaphore),
            acquire_timeout: self.acquire_timeout,
            resource: Arc::clone(&self.resource),
        }
    }
}

// ---------------------------------------------------------------------------
// ConcurrencyLimitService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConcurrencyLimitService<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
    acquire_timeout: Duration,
    resource: Arc<str>,
}

fn rejected(resource: &str, message_type: &'static str) -> MediatorError {
    metrics::counter!("courier_concurrency_rejections_total", "resource" => resource.to_string()).increment(1);
    debug!(resource, message_type, "concurrency limit reached");
    MediatorError::CapacityExceeded {
        resource: resource.to_string(),
    }
}

impl<S, M> Service<Dispatch<M>> for ConcurrencyLimitService<S>
where
    S: Service<Dispatch<M>, Error = MediatorError> + Clone + Send + 'static,
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
        let message_type = M::message_type();

        // Fast path: a free slot, or an immediate rejection when waiting is disabled.
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                let fut = self.inner.call(dispatch);
                return Box::pin(async move {
                    let result = fut.await;
                    drop(permit);
                    result
                });
            }
            Err(_) if self.acquire_timeout.is_zero() => {
                let err = rejected(&self.resource, message_type);
                return Box::pin(async move { Err(err) });
            }
            Err(_) => {}
        }

        // Slow path: wait for a slot. `inner` is cloned since the call happens later.
        let semaphore = Arc::clone(&self.semaphore);
        let timeout = self.acquire_timeout;
        let resource = Arc::clone(&self.resource);
        let mut inner = self.inner.clone();
        std::mem::swap(&mut inner, &mut self.inner);
        Box::pin(async move {
            let cancellation = dispatch.ctx.cancellation.clone();
            let permit: OwnedSemaphorePermit = tokio::select! {
                biased;
                () = cancellation.cancelled() => return Err(MediatorError::Cancelled),
                acquired = tokio::time::timeout(timeout, semaphore.acquire_owned()) => match acquired {
                    Ok(Ok(permit)) => permit,
                    // Timed out, or the semaphore was closed.
                    _ => return Err(rejected(&resource, message_type)),
                },
            };
            let result = inner.call(dispatch).await;
            drop(permit);
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::*;
    use crate::behaviors::testing::{dispatch, Scripted};

    fn layer(max_in_flight: u32, acquire_timeout: Duration) -> ConcurrencyLimitLayer {
        ConcurrencyLimitLayer::new(
            "charges",
            &ConcurrencyLimitConfig {
                max_in_flight,
                acquire_timeout,
            },
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_when_saturated() {
        let layer = layer(1, Duration::ZERO);
        let svc = layer.layer(Scripted::ok().delayed(Duration::from_millis(500)));

        let in_flight = tokio::spawn(svc.clone().oneshot(dispatch()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(layer.available(), 0);

        let err = svc.clone().oneshot(dispatch()).await.unwrap_err();
        assert!(matches!(err, MediatorError::CapacityExceeded { .. }));

        in_flight.await.unwrap().unwrap();
        assert_eq!(layer.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_slot_within_timeout() {
        let layer = layer(1, Duration::from_secs(1));
        let svc = layer.layer(Scripted::ok().delayed(Duration::from_millis(100)));

        let first = tokio::spawn(svc.clone().oneshot(dispatch()));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(svc.clone().oneshot(dispatch()).await.is_ok());
        first.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out() {
        let layer = layer(1, Duration::from_millis(50));
        let svc = layer.layer(Scripted::ok().delayed(Duration::from_secs(10)));

        let _hold = tokio::spawn(svc.clone().oneshot(dispatch()));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = svc.clone().oneshot(dispatch()).await.unwrap_err();
        assert!(matches!(err, MediatorError::CapacityExceeded { resource } if resource == "charges"));
    }

    #[test]
    fn zero_slots_is_invalid() {
        assert!(ConcurrencyLimitLayer::new(
            "charges",
            &ConcurrencyLimitConfig {
                max_in_flight: 0,
                acquire_timeout: Duration::ZERO,
            }
        )
        .is_err());
    }
}
