//! Terminal stage: invokes the handler, observing cancellation and
//! converting panics into failures.

use std::any::Any;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};

use courier_core::{Event, MediatorError, Request};
use futures_util::FutureExt;
use tower::Service;
use tracing::error;

use super::{Dispatch, DispatchFuture};
use crate::handler::{EventHandler, RequestHandler};

/// Object-safe handler invocation shared by request and event handlers.
pub(crate) trait Invoke<M, Out>: Send + Sync {
    fn name(&self) -> &'static str;

    fn invoke(&self, dispatch: Dispatch<M>) -> DispatchFuture<Out>;
}

pub(crate) struct RequestInvoker<R: Request>(pub(crate) Arc<dyn RequestHandler<R>>);

impl<R> Invoke<R, R::Response> for RequestInvoker<R>
where
    R: Request,
{
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn invoke(&self, dispatch: Dispatch<R>) -> DispatchFuture<R::Response> {
        let handler = Arc::clone(&self.0);
        Box::pin(async move { handler.handle(&dispatch.envelope, &dispatch.ctx).await })
    }
}

pub(crate) struct EventInvoker<E: Event>(pub(crate) Arc<dyn EventHandler<E>>);

impl<E> Invoke<E, ()> for EventInvoker<E>
where
    E: Event,
{
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn invoke(&self, dispatch: Dispatch<E>) -> DispatchFuture<()> {
        let handler = Arc::clone(&self.0);
        Box::pin(async move { handler.handle(&dispatch.envelope, &dispatch.ctx).await })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs the handler until it completes or the call is cancelled.
///
/// A panic inside the handler is caught here and nowhere else; it surfaces as
/// `MediatorError::HandlerPanicked`.
pub(crate) fn guarded<M, Out>(
    handler: Arc<dyn Invoke<M, Out>>,
    dispatch: Dispatch<M>,
) -> DispatchFuture<Out>
where
    M: Send + Sync + 'static,
    Out: Send + 'static,
{
    Box::pin(async move {
        let token = dispatch.ctx.cancellation.clone();
        if token.is_cancelled() {
            return Err(MediatorError::Cancelled);
        }
        let name = handler.name();
        let work = AssertUnwindSafe(handler.invoke(dispatch)).catch_unwind();
        tokio::select! {
            biased;
            () = token.cancelled() => Err(MediatorError::Cancelled),
            outcome = work => match outcome {
                Ok(result) => result,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(handler = name, %message, "handler panicked");
                    Err(MediatorError::HandlerPanicked {
                        handler: name.to_string(),
                        message,
                    })
                }
            },
        }
    })
}

// ---------------------------------------------------------------------------
// HandlerService
// ---------------------------------------------------------------------------

/// The innermost service of a layered pipeline.
pub(crate) struct HandlerService<M, Out> {
    handler: Arc<dyn Invoke<M, Out>>,
    _marker: PhantomData<fn(M) -> Out>,
}

impl<M, Out> HandlerService<M, Out> {
    pub(crate) fn new(handler: Arc<dyn Invoke<M, Out>>) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

impl<M, Out> Clone for HandlerService<M, Out> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.handler))
    }
}

impl<M, Out> Service<Dispatch<M>> for HandlerService<M, Out>
where
    M: Send + Sync + 'static,
    Out: Send + 'static,
{
    type Response = Out;
    type Error = MediatorError;
    type Future = DispatchFuture<Out>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dispatch: Dispatch<M>) -> Self::Future {
        guarded(Arc::clone(&self.handler), dispatch)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_core::{Envelope, ManualClock, Message, UuidSupplier};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::pipeline::PipelineContext;

    #[derive(Debug)]
    struct Probe(&'static str);
    impl Message for Probe {}

    struct Behaving;

    impl Invoke<Probe, u32> for Behaving {
        fn name(&self) -> &'static str {
            "behaving"
        }

        fn invoke(&self, dispatch: Dispatch<Probe>) -> DispatchFuture<u32> {
            Box::pin(async move {
                match dispatch.envelope.payload().0 {
                    "panic" => panic!("stock ledger corrupted"),
                    "slow" => {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(0)
                    }
                    _ => Ok(7),
                }
            })
        }
    }

    fn behaving() -> Arc<dyn Invoke<Probe, u32>> {
        Arc::new(Behaving)
    }

    fn dispatch(tag: &'static str, token: CancellationToken) -> Dispatch<Probe> {
        let envelope = Envelope::new(Probe(tag), &UuidSupplier, &ManualClock::new(0));
        let ctx = PipelineContext::new(token, envelope.headers.correlation_id.clone(), "behaving");
        Dispatch::new(envelope, ctx)
    }

    #[tokio::test]
    async fn returns_handler_result() {
        let out = guarded(behaving(), dispatch("ok", CancellationToken::new())).await;
        assert_eq!(out.unwrap(), 7);
    }

    #[tokio::test]
    async fn panic_becomes_failure() {
        let err = guarded(behaving(), dispatch("panic", CancellationToken::new()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MediatorError::HandlerPanicked { handler, message }
                if handler == "behaving" && message == "stock ledger corrupted"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_handler() {
        let token = CancellationToken::new();
        let fut = guarded(behaving(), dispatch("slow", token.clone()));
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        assert!(matches!(fut.await, Err(MediatorError::Cancelled)));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn already_cancelled_never_invokes() {
        let token = CancellationToken::new();
        token.cancel();
        let err = guarded(behaving(), dispatch("panic", token)).await.unwrap_err();
        assert!(matches!(err, MediatorError::Cancelled));
    }
}
