//! Closure behaviors with an explicit `next` continuation.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::task::{Context, Poll};

use courier_core::MediatorError;
use tower::{Layer, Service, ServiceExt};

use super::{BoxedService, Dispatch, DispatchFuture};

/// The rest of the chain, handed to a closure behavior.
///
/// Not calling [`Next::run`] short-circuits the chain.
pub struct Next<M, Out> {
    inner: BoxedService<M, Out>,
}

impl<M, Out> Next<M, Out> {
    /// Invokes the remaining behaviors and the handler.
    ///
    /// # Errors
    ///
    /// Whatever the rest of the chain fails with.
    pub async fn run(self, dispatch: Dispatch<M>) -> Result<Out, MediatorError> {
        self.inner.oneshot(dispatch).await
    }
}

/// Builds a behavior from `f(dispatch, next)`.
///
/// ```ignore
/// let audit = behavior_fn(|d: Dispatch<PlaceOrder>, next: Next<PlaceOrder, OrderId>| async move {
///     tracing::info!(id = %d.envelope.id(), "placing order");
///     next.run(d).await
/// });
/// ```
pub fn behavior_fn<M, Out, F, Fut>(f: F) -> FnBehavior<F, M, Out>
where
    F: Fn(Dispatch<M>, Next<M, Out>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Out, MediatorError>> + Send + 'static,
{
    FnBehavior {
        f: Arc::new(f),
        _marker: PhantomData,
    }
}

/// Layer produced by [`behavior_fn`].
pub struct FnBehavior<F, M, Out> {
    f: Arc<F>,
    _marker: PhantomData<fn(M) -> Out>,
}

impl<F, M, Out> Clone for FnBehavior<F, M, Out> {
    fn clone(&self) -> Self {
        Self {
            f: Arc::clone(&self.f),
            _marker: PhantomData,
        }
    }
}

impl<F, M, Out, S> Layer<S> for FnBehavior<F, M, Out>
where
    S: Service<Dispatch<M>, Response = Out, Error = MediatorError> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    M: Send + Sync + 'static,
    Out: Send + 'static,
{
    type Service = FnBehaviorService<F, M, Out>;

    fn layer(&self, inner: S) -> Self::Service {
        FnBehaviorService {
            f: Arc::clone(&self.f),
            inner: BoxedService::new(inner),
        }
    }
}

pub struct FnBehaviorService<F, M, Out> {
    f: Arc<F>,
    inner: BoxedService<M, Out>,
}

impl<F, M, Out> Clone for FnBehaviorService<F, M, Out> {
    fn clone(&self) -> Self {
        Self {
            f: Arc::clone(&self.f),
            inner: self.inner.clone(),
        }
    }
}

impl<F, Fut, M, Out> Service<Dispatch<M>> for FnBehaviorService<F, M, Out>
where
    F: Fn(Dispatch<M>, Next<M, Out>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Out, MediatorError>> + Send + 'static,
{
    type Response = Out;
    type Error = MediatorError;
    type Future = DispatchFuture<Out>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dispatch: Dispatch<M>) -> Self::Future {
        let next = Next {
            inner: self.inner.clone(),
        };
        Box::pin((self.f)(dispatch, next))
    }
}
