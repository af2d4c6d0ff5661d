//! Pipeline execution: the onion of behaviors around a terminal handler call.
//!
//! A behavior is any `tower::Layer` whose service handles [`Dispatch<M>`].
//! For behaviors `[A, B, C]` registered in that order the composed chain is
//! `A(B(C(handler)))`: `A` runs first on the way in and last on the way out.
//! Each message type's chain is built once, cached by the mediator, and
//! cloned per call.

mod behavior_fn;
mod terminal;

use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use courier_core::{CorrelationId, Envelope, MediatorError};
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service, ServiceExt};

pub use behavior_fn::{behavior_fn, FnBehavior, FnBehaviorService, Next};
pub(crate) use terminal::{EventInvoker, HandlerService, Invoke, RequestInvoker};

/// Boxed `Send` future, as used throughout the pipeline.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Future returned by every stage of a pipeline.
pub type DispatchFuture<Out> = BoxFuture<Result<Out, MediatorError>>;

// ---------------------------------------------------------------------------
// PipelineContext / Dispatch
// ---------------------------------------------------------------------------

/// Per-call ambient state. Each call owns its context; nothing in it is
/// shared with concurrent calls.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    /// Cancellation signal for the whole call. Layers that wait must observe it.
    pub cancellation: CancellationToken,
    pub correlation_id: CorrelationId,
    /// 1-based attempt number, advanced by the retry behavior.
    pub attempt: u32,
    /// Name of the handler at the end of this chain.
    pub handler: &'static str,
}

impl PipelineContext {
    #[must_use]
    pub fn new(
        cancellation: CancellationToken,
        correlation_id: CorrelationId,
        handler: &'static str,
    ) -> Self {
        Self {
            cancellation,
            correlation_id,
            attempt: 1,
            handler,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// What flows through a pipeline: the message envelope and the call context.
#[derive(Debug)]
pub struct Dispatch<M> {
    pub envelope: Envelope<M>,
    pub ctx: PipelineContext,
}

impl<M> Clone for Dispatch<M> {
    fn clone(&self) -> Self {
        Self {
            envelope: self.envelope.clone(),
            ctx: self.ctx.clone(),
        }
    }
}

impl<M> Dispatch<M> {
    #[must_use]
    pub fn new(envelope: Envelope<M>, ctx: PipelineContext) -> Self {
        Self { envelope, ctx }
    }
}

// ---------------------------------------------------------------------------
// BoxedService (type-erased, clonable, shareable)
// ---------------------------------------------------------------------------

trait ErasedService<M, Out>: Send + Sync {
    fn call_erased(&self, dispatch: Dispatch<M>) -> DispatchFuture<Out>;
}

struct ServiceWrapper<S>(S);

impl<S, M, Out> ErasedService<M, Out> for ServiceWrapper<S>
where
    S: Service<Dispatch<M>, Response = Out, Error = MediatorError> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    M: Send + Sync + 'static,
    Out: Send + 'static,
{
    fn call_erased(&self, dispatch: Dispatch<M>) -> DispatchFuture<Out> {
        Box::pin(self.0.clone().oneshot(dispatch))
    }
}

/// A type-erased pipeline stage. Cloning is a reference-count bump.
pub struct BoxedService<M, Out> {
    inner: Arc<dyn ErasedService<M, Out>>,
}

impl<M, Out> BoxedService<M, Out>
where
    M: Send + Sync + 'static,
    Out: Send + 'static,
{
    pub fn new<S>(service: S) -> Self
    where
        S: Service<Dispatch<M>, Response = Out, Error = MediatorError>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        Self {
            inner: Arc::new(ServiceWrapper(service)),
        }
    }
}

impl<M, Out> Clone for BoxedService<M, Out> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M, Out> fmt::Debug for BoxedService<M, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxedService")
            .field("message", &type_name::<M>())
            .finish_non_exhaustive()
    }
}

impl<M, Out> Service<Dispatch<M>> for BoxedService<M, Out> {
    type Response = Out;
    type Error = MediatorError;
    type Future = DispatchFuture<Out>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dispatch: Dispatch<M>) -> Self::Future {
        self.inner.call_erased(dispatch)
    }
}

// ---------------------------------------------------------------------------
// Behaviors
// ---------------------------------------------------------------------------

/// A registered behavior: wraps the rest of the chain.
pub type Behavior<M, Out> = Arc<dyn Fn(BoxedService<M, Out>) -> BoxedService<M, Out> + Send + Sync>;

/// Erases a tower layer into a [`Behavior`].
pub fn layer_behavior<M, Out, L>(layer: L) -> Behavior<M, Out>
where
    M: Send + Sync + 'static,
    Out: Send + 'static,
    L: Layer<BoxedService<M, Out>> + Send + Sync + 'static,
    L::Service: Service<Dispatch<M>, Response = Out, Error = MediatorError>
        + Clone
        + Send
        + Sync
        + 'static,
    <L::Service as Service<Dispatch<M>>>::Future: Send + 'static,
{
    Arc::new(move |inner| BoxedService::new(layer.layer(inner)))
}

/// Behaviors registered for one message type, in registration order.
pub struct BehaviorStack<M, Out> {
    behaviors: Vec<Behavior<M, Out>>,
}

impl<M, Out> Default for BehaviorStack<M, Out> {
    fn default() -> Self {
        Self {
            behaviors: Vec::new(),
        }
    }
}

impl<M, Out> BehaviorStack<M, Out> {
    pub fn push(&mut self, behavior: Behavior<M, Out>) {
        self.behaviors.push(behavior);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.behaviors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.behaviors.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// A composed, ready-to-call chain for one handler.
pub(crate) enum Pipeline<M, Out> {
    /// No behaviors: the handler is invoked directly.
    Direct(Arc<dyn Invoke<M, Out>>),
    Layered(BoxedService<M, Out>),
}

impl<M, Out> Pipeline<M, Out>
where
    M: Send + Sync + 'static,
    Out: Send + 'static,
{
    /// Composes `stack` around `handler`, first-registered outermost.
    pub(crate) fn build(handler: Arc<dyn Invoke<M, Out>>, stack: Option<&BehaviorStack<M, Out>>) -> Self {
        let Some(stack) = stack.filter(|s| !s.is_empty()) else {
            return Pipeline::Direct(handler);
        };
        let mut service = BoxedService::new(HandlerService::new(handler));
        for behavior in stack.behaviors.iter().rev() {
            service = behavior(service);
        }
        Pipeline::Layered(service)
    }

    pub(crate) fn is_direct(&self) -> bool {
        matches!(self, Pipeline::Direct(_))
    }

    pub(crate) fn call(&self, dispatch: Dispatch<M>) -> DispatchFuture<Out> {
        match self {
            Pipeline::Direct(handler) => terminal::guarded(Arc::clone(handler), dispatch),
            Pipeline::Layered(service) => Box::pin(service.clone().oneshot(dispatch)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use courier_core::{ManualClock, Message, UuidSupplier};
    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug)]
    struct Ping;
    impl Message for Ping {}

    struct Recording {
        log: Arc<Mutex<Vec<String>>>,
        calls: Arc<AtomicU32>,
    }

    impl Invoke<Ping, String> for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn invoke(&self, _dispatch: Dispatch<Ping>) -> DispatchFuture<String> {
            let log = Arc::clone(&self.log);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                log.lock().push("handler".into());
                Ok("pong".to_string())
            })
        }
    }

    fn tracing_behavior(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Behavior<Ping, String> {
        let log = Arc::clone(log);
        layer_behavior(behavior_fn(move |dispatch: Dispatch<Ping>, next: Next<Ping, String>| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(format!("{name}.before"));
                let result = next.run(dispatch).await;
                log.lock().push(format!("{name}.after"));
                result
            }
        }))
    }

    fn dispatch() -> Dispatch<Ping> {
        let envelope = Envelope::new(Ping, &UuidSupplier, &ManualClock::new(0));
        let ctx = PipelineContext::new(
            CancellationToken::new(),
            envelope.headers.correlation_id.clone(),
            "recording",
        );
        Dispatch::new(envelope, ctx)
    }

    #[tokio::test]
    async fn onion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(Recording {
            log: Arc::clone(&log),
            calls: Arc::new(AtomicU32::new(0)),
        });
        let mut stack = BehaviorStack::default();
        for name in ["A", "B", "C"] {
            stack.push(tracing_behavior(name, &log));
        }

        let pipeline = Pipeline::build(handler, Some(&stack));
        assert!(!pipeline.is_direct());
        assert_eq!(pipeline.call(dispatch()).await.unwrap(), "pong");

        assert_eq!(
            *log.lock(),
            vec![
                "A.before", "B.before", "C.before", "handler", "C.after", "B.after", "A.after"
            ]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_handler() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = Arc::new(Recording {
            log: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::clone(&calls),
        });
        let mut stack = BehaviorStack::default();
        stack.push(layer_behavior(behavior_fn(
            |_dispatch: Dispatch<Ping>, _next: Next<Ping, String>| async { Ok("cached".to_string()) },
        )));

        let pipeline = Pipeline::build(handler, Some(&stack));
        assert_eq!(pipeline.call(dispatch()).await.unwrap(), "cached");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn layered_pipeline_runs_on_a_spawned_task() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(Recording {
            log: Arc::clone(&log),
            calls: Arc::new(AtomicU32::new(0)),
        });
        let mut stack = BehaviorStack::default();
        stack.push(tracing_behavior("A", &log));
        let Pipeline::Layered(service) = Pipeline::build(handler, Some(&stack)) else {
            panic!("expected a layered pipeline");
        };

        let out = tokio::spawn(service.oneshot(dispatch())).await.unwrap();
        assert_eq!(out.unwrap(), "pong");
        assert_eq!(*log.lock(), vec!["A.before", "handler", "A.after"]);
    }

    #[tokio::test]
    async fn empty_stack_takes_fast_path() {
        let handler = Arc::new(Recording {
            log: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(AtomicU32::new(0)),
        });
        let pipeline = Pipeline::build(handler, Some(&BehaviorStack::default()));
        assert!(pipeline.is_direct());
        assert_eq!(pipeline.call(dispatch()).await.unwrap(), "pong");
    }
}
