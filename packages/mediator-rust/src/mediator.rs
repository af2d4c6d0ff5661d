//! The mediator: typed `send` for requests and fan-out `publish` for events.
//!
//! Each call resolves its route through the [`HandlerCache`] (handler plus
//! composed pipeline, built once per message type), runs it inside a
//! `dispatch` span, and reports start/completion to the configured
//! [`DispatchObserver`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use courier_core::clock::system_clock;
use courier_core::{
    ConfigError, DeliveryMode, Envelope, Event, MediatorError, Message, MessageId, Request,
    SharedClock, SharedIdSupplier, UuidSupplier,
};
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service};
use tracing::{field, info_span, Instrument, Span};

use crate::cache::{CacheStats, HandlerCache};
use crate::config::{MediatorConfig, PublishStrategy};
use crate::handler::{EventHandler, RequestHandler};
use crate::observe::{DispatchInfo, DispatchKind, DispatchObserver, DispatchOutcome, TracingObserver};
use crate::pipeline::{
    layer_behavior, BehaviorStack, BoxedService, Dispatch, EventInvoker, Pipeline, PipelineContext,
    RequestInvoker,
};
use crate::registry::{resolve_event_handlers, resolve_request_handlers, HandlerProvider, HandlerRegistry};

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

enum RequestRoute<R: Request> {
    Missing,
    Ambiguous(usize),
    Ready {
        handler: &'static str,
        pipeline: Pipeline<R, R::Response>,
    },
}

struct EventRoute<E: Event> {
    handlers: Vec<(&'static str, Pipeline<E, ()>)>,
}

// ---------------------------------------------------------------------------
// PublishReport
// ---------------------------------------------------------------------------

/// Outcome of one event handler.
#[derive(Debug)]
pub struct SubscriberOutcome {
    pub handler: &'static str,
    pub result: Result<(), MediatorError>,
}

/// Aggregated outcome of a publish. Never an error itself: one handler's
/// failure is reported alongside the others' successes.
#[derive(Debug)]
pub struct PublishReport {
    pub message_id: MessageId,
    /// One entry per handler, in registration order.
    pub outcomes: Vec<SubscriberOutcome>,
    /// `true` for fire-and-forget publishes, whose outcomes are not awaited.
    pub detached: bool,
}

impl PublishReport {
    fn detached(message_id: MessageId) -> Self {
        Self {
            message_id,
            outcomes: Vec::new(),
            detached: true,
        }
    }

    /// Whether every handler succeeded (vacuously true with no handlers).
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&'static str, &MediatorError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|err| (o.handler, err)))
    }

    fn outcome(&self) -> DispatchOutcome {
        match self.failed() {
            0 => DispatchOutcome::Success,
            failed => DispatchOutcome::Partial {
                failed,
                total: self.outcomes.len(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Mediator
// ---------------------------------------------------------------------------

struct Inner {
    provider: Arc<dyn HandlerProvider>,
    behaviors: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    cache: HandlerCache,
    observer: Arc<dyn DispatchObserver>,
    ids: SharedIdSupplier,
    clock: SharedClock,
    config: MediatorConfig,
}

impl Inner {
    fn stack<M, Out>(&self) -> Option<&BehaviorStack<M, Out>>
    where
        M: 'static,
        Out: 'static,
    {
        self.behaviors
            .get(&TypeId::of::<BehaviorStack<M, Out>>())
            .and_then(|stack| stack.downcast_ref::<BehaviorStack<M, Out>>())
    }

    fn request_route<R: Request>(&self) -> Arc<RequestRoute<R>> {
        self.cache.get_or_resolve(|| {
            let mut handlers = resolve_request_handlers::<R>(self.provider.as_ref());
            match handlers.len() {
                0 => RequestRoute::Missing,
                1 => {
                    let handler = handlers.remove(0);
                    let name = handler.name();
                    RequestRoute::Ready {
                        handler: name,
                        pipeline: Pipeline::build(
                            Arc::new(RequestInvoker(handler)),
                            self.stack::<R, R::Response>(),
                        ),
                    }
                }
                count => RequestRoute::Ambiguous(count),
            }
        })
    }

    fn event_route<E: Event>(&self) -> Arc<EventRoute<E>> {
        self.cache.get_or_resolve(|| {
            let stack = self.stack::<E, ()>();
            let handlers = resolve_event_handlers::<E>(self.provider.as_ref())
                .into_iter()
                .map(|handler| {
                    let name = handler.name();
                    (name, Pipeline::build(Arc::new(EventInvoker(handler)), stack))
                })
                .collect();
            EventRoute { handlers }
        })
    }

    fn finish(&self, info: &DispatchInfo, outcome: DispatchOutcome, started: Instant) {
        let elapsed = started.elapsed();
        let span = Span::current();
        span.record("outcome", outcome.as_str());
        span.record("duration_ms", u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        self.observer.on_complete(info, outcome, elapsed);
    }
}

/// Entry point for dispatching requests and events. Cheap to clone.
#[derive(Clone)]
pub struct Mediator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Mediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mediator")
            .field("cached_routes", &self.inner.cache.len())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Mediator {
    #[must_use]
    pub fn builder() -> MediatorBuilder {
        MediatorBuilder::new()
    }

    /// Wraps `payload` in an envelope with a fresh id and creation stamp.
    pub fn envelope<M: Message>(&self, payload: M) -> Envelope<M> {
        Envelope::new(payload, self.inner.ids.as_ref(), self.inner.clock.as_ref())
    }

    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    /// Sends a request to its single handler.
    ///
    /// # Errors
    ///
    /// `HandlerNotFound` when no handler is registered, otherwise whatever
    /// the pipeline or handler fails with.
    pub async fn send<R: Request>(&self, request: R) -> Result<R::Response, MediatorError> {
        let envelope = self.envelope(request);
        self.send_envelope(envelope, CancellationToken::new()).await
    }

    /// Sends a pre-built envelope under an explicit cancellation signal.
    ///
    /// # Errors
    ///
    /// See [`Mediator::send`]. Cancellation surfaces as `MediatorError::Cancelled`.
    pub async fn send_envelope<R: Request>(
        &self,
        envelope: Envelope<R>,
        cancellation: CancellationToken,
    ) -> Result<R::Response, MediatorError> {
        let info = DispatchInfo {
            kind: DispatchKind::Send,
            message_type: R::message_type(),
            message_id: envelope.id().clone(),
            correlation_id: envelope.headers.correlation_id.clone(),
        };
        let span = info_span!(
            "dispatch",
            kind = "send",
            message_type = info.message_type,
            message_id = %info.message_id,
            correlation_id = %info.correlation_id,
            outcome = field::Empty,
            duration_ms = field::Empty,
        );

        async move {
            let inner = &self.inner;
            inner.observer.on_start(&info);
            let started = Instant::now();

            let route = inner.request_route::<R>();
            let result = match &*route {
                RequestRoute::Missing => Err(MediatorError::HandlerNotFound {
                    message_type: info.message_type.to_string(),
                }),
                RequestRoute::Ambiguous(count) => Err(MediatorError::Validation(format!(
                    "{count} handlers resolved for request {}",
                    info.message_type
                ))),
                RequestRoute::Ready { handler, pipeline } => {
                    let ctx = PipelineContext::new(cancellation, info.correlation_id.clone(), handler);
                    pipeline.call(Dispatch::new(envelope, ctx)).await
                }
            };

            let outcome = match &result {
                Ok(_) => DispatchOutcome::Success,
                Err(err) => DispatchOutcome::Failure(err.kind()),
            };
            inner.finish(&info, outcome, started);
            result
        }
        .instrument(span)
        .await
    }

    /// Publishes an event to every handler registered for it.
    pub async fn publish<E: Event>(&self, event: E) -> PublishReport {
        let envelope = self.envelope(event);
        self.publish_envelope(envelope, CancellationToken::new()).await
    }

    /// Publishes a pre-built envelope.
    ///
    /// With `DeliveryMode::FireAndForget` the fan-out runs on a spawned task
    /// and the returned report is marked `detached` with no outcomes.
    pub async fn publish_envelope<E: Event>(
        &self,
        envelope: Envelope<E>,
        cancellation: CancellationToken,
    ) -> PublishReport {
        if envelope.headers.delivery_mode == DeliveryMode::FireAndForget {
            let message_id = envelope.id().clone();
            let mediator = self.clone();
            tokio::spawn(async move {
                mediator.fan_out(envelope, cancellation).await;
            });
            return PublishReport::detached(message_id);
        }
        self.fan_out(envelope, cancellation).await
    }

    async fn fan_out<E: Event>(&self, envelope: Envelope<E>, cancellation: CancellationToken) -> PublishReport {
        let info = DispatchInfo {
            kind: DispatchKind::Publish,
            message_type: E::message_type(),
            message_id: envelope.id().clone(),
            correlation_id: envelope.headers.correlation_id.clone(),
        };
        let span = info_span!(
            "dispatch",
            kind = "publish",
            message_type = info.message_type,
            message_id = %info.message_id,
            correlation_id = %info.correlation_id,
            handlers = field::Empty,
            outcome = field::Empty,
            duration_ms = field::Empty,
        );

        async move {
            let inner = &self.inner;
            inner.observer.on_start(&info);
            let started = Instant::now();

            let route = inner.event_route::<E>();
            Span::current().record("handlers", route.handlers.len());
            let calls = route.handlers.iter().map(|(handler, pipeline)| {
                let handler = *handler;
                let ctx = PipelineContext::new(cancellation.clone(), info.correlation_id.clone(), handler);
                let call = pipeline.call(Dispatch::new(envelope.clone(), ctx));
                async move {
                    SubscriberOutcome {
                        handler,
                        result: call.await,
                    }
                }
            });

            let outcomes = match inner.config.publish_strategy {
                PublishStrategy::Concurrent => join_all(calls).await,
                PublishStrategy::Sequential => {
                    let mut outcomes = Vec::with_capacity(route.handlers.len());
                    for call in calls {
                        outcomes.push(call.await);
                    }
                    outcomes
                }
            };

            let report = PublishReport {
                message_id: info.message_id.clone(),
                outcomes,
                detached: false,
            };
            inner.finish(&info, report.outcome(), started);
            report
        }
        .instrument(span)
        .await
    }

    /// Drops every cached route. Call after changing what the provider resolves.
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }
}

// ---------------------------------------------------------------------------
// MediatorBuilder
// ---------------------------------------------------------------------------

/// Collects handlers, behaviors and collaborators, then validates them.
pub struct MediatorBuilder {
    registry: HandlerRegistry,
    provider: Option<Arc<dyn HandlerProvider>>,
    behaviors: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    observer: Arc<dyn DispatchObserver>,
    ids: SharedIdSupplier,
    clock: SharedClock,
    config: MediatorConfig,
}

impl MediatorBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            provider: None,
            behaviors: HashMap::new(),
            observer: Arc::new(TracingObserver),
            ids: Arc::new(UuidSupplier),
            clock: system_clock(),
            config: MediatorConfig::default(),
        }
    }

    #[must_use]
    pub fn request_handler<R, H>(self, handler: H) -> Self
    where
        R: Request,
        H: RequestHandler<R>,
    {
        self.registry.register_request(handler);
        self
    }

    #[must_use]
    pub fn request_handler_factory<R, H, F>(self, factory: F) -> Self
    where
        R: Request,
        H: RequestHandler<R>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.registry.register_request_factory(factory);
        self
    }

    #[must_use]
    pub fn event_handler<E, H>(self, handler: H) -> Self
    where
        E: Event,
        H: EventHandler<E>,
    {
        self.registry.register_event(handler);
        self
    }

    #[must_use]
    pub fn event_handler_factory<E, H, F>(self, factory: F) -> Self
    where
        E: Event,
        H: EventHandler<E>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.registry.register_event_factory(factory);
        self
    }

    fn push_behavior<M, Out>(&mut self, behavior: crate::pipeline::Behavior<M, Out>)
    where
        M: Send + Sync + 'static,
        Out: Send + 'static,
    {
        let key = TypeId::of::<BehaviorStack<M, Out>>();
        let mut stack = self
            .behaviors
            .remove(&key)
            .and_then(|boxed| boxed.downcast::<BehaviorStack<M, Out>>().ok())
            .map_or_else(BehaviorStack::default, |boxed| *boxed);
        stack.push(behavior);
        self.behaviors.insert(key, Box::new(stack));
    }

    /// Appends a behavior to `R`'s pipeline. Earlier registrations run outermost.
    #[must_use]
    pub fn request_behavior<R, L>(mut self, layer: L) -> Self
    where
        R: Request,
        L: Layer<BoxedService<R, R::Response>> + Send + Sync + 'static,
        L::Service: Service<Dispatch<R>, Response = R::Response, Error = MediatorError>
            + Clone
            + Send
            + Sync
            + 'static,
        <L::Service as Service<Dispatch<R>>>::Future: Send + 'static,
    {
        self.push_behavior(layer_behavior::<R, R::Response, L>(layer));
        self
    }

    /// Appends a behavior to every handler pipeline of `E`.
    #[must_use]
    pub fn event_behavior<E, L>(mut self, layer: L) -> Self
    where
        E: Event,
        L: Layer<BoxedService<E, ()>> + Send + Sync + 'static,
        L::Service: Service<Dispatch<E>, Response = (), Error = MediatorError>
            + Clone
            + Send
            + Sync
            + 'static,
        <L::Service as Service<Dispatch<E>>>::Future: Send + 'static,
    {
        self.push_behavior(layer_behavior::<E, (), L>(layer));
        self
    }

    /// Resolves handlers through `provider` instead of the built-in registry.
    /// Handlers registered on this builder are then ignored.
    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn HandlerProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn DispatchObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn id_supplier(mut self, ids: SharedIdSupplier) -> Self {
        self.ids = ids;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn config(mut self, config: MediatorConfig) -> Self {
        self.config = config;
        self
    }

    /// # Errors
    ///
    /// Returns `ConfigError::DuplicateRequestHandler` if a request type has
    /// more than one handler in the built-in registry.
    pub fn build(self) -> Result<Mediator, ConfigError> {
        let provider = match self.provider {
            Some(provider) => provider,
            None => {
                self.registry.validate()?;
                Arc::new(self.registry) as Arc<dyn HandlerProvider>
            }
        };
        Ok(Mediator {
            inner: Arc::new(Inner {
                provider,
                behaviors: self.behaviors,
                cache: HandlerCache::new(),
                observer: self.observer,
                ids: self.ids,
                clock: self.clock,
                config: self.config,
            }),
        })
    }
}

impl Default for MediatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use courier_core::ErrorKind;
    use parking_lot::Mutex;

    use super::*;
    use crate::handler::{event_fn, request_fn};
    use crate::pipeline::{behavior_fn, Next};

    #[derive(Debug)]
    struct CreateOrder {
        id: String,
    }
    impl Message for CreateOrder {
        fn message_type() -> &'static str {
            "orders.create"
        }
    }
    impl Request for CreateOrder {
        type Response = String;
    }

    #[derive(Debug)]
    struct OrderPlaced;
    impl Message for OrderPlaced {}
    impl Event for OrderPlaced {}

    fn create_handler() -> impl RequestHandler<CreateOrder> {
        request_fn("create-order", |env: Envelope<CreateOrder>, _| async move {
            Ok(format!("created {}", env.payload().id))
        })
    }

    #[tokio::test]
    async fn send_without_handler_is_not_found() {
        let mediator = Mediator::builder().build().unwrap();
        let err = mediator.send(CreateOrder { id: "X".into() }).await.unwrap_err();
        assert!(matches!(err, MediatorError::HandlerNotFound { message_type } if message_type == "orders.create"));
    }

    #[tokio::test]
    async fn send_reaches_single_handler() {
        let mediator = Mediator::builder()
            .request_handler(create_handler())
            .build()
            .unwrap();
        let out = mediator.send(CreateOrder { id: "X".into() }).await.unwrap();
        assert_eq!(out, "created X");
    }

    #[test]
    fn duplicate_request_handlers_rejected_at_build() {
        let err = Mediator::builder()
            .request_handler(create_handler())
            .request_handler(create_handler())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateRequestHandler { count: 2, .. }));
    }

    #[tokio::test]
    async fn handler_panic_is_reported_not_propagated() {
        let mediator = Mediator::builder()
            .request_handler(request_fn("boom", |_: Envelope<CreateOrder>, _| async move {
                if true {
                    panic!("unexpected state");
                }
                Ok(String::new())
            }))
            .build()
            .unwrap();
        let err = mediator.send(CreateOrder { id: "X".into() }).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HandlerPanicked);
    }

    #[tokio::test]
    async fn route_is_resolved_once() {
        let built = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&built);
        let mediator = Mediator::builder()
            .request_handler_factory(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                create_handler()
            })
            .build()
            .unwrap();

        for _ in 0..5 {
            mediator.send(CreateOrder { id: "X".into() }).await.unwrap();
        }
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(mediator.cache_stats().misses, 1);

        mediator.clear_cache();
        mediator.send(CreateOrder { id: "X".into() }).await.unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn behaviors_wrap_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let tag = |name: &'static str| {
            let log = Arc::clone(&log);
            behavior_fn(move |d: Dispatch<CreateOrder>, next: Next<CreateOrder, String>| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().push(format!("{name}>"));
                    let out = next.run(d).await;
                    log.lock().push(format!("<{name}"));
                    out
                }
            })
        };
        let mediator = Mediator::builder()
            .request_handler(create_handler())
            .request_behavior(tag("outer"))
            .request_behavior(tag("inner"))
            .build()
            .unwrap();

        mediator.send(CreateOrder { id: "X".into() }).await.unwrap();
        assert_eq!(*log.lock(), vec!["outer>", "inner>", "<inner", "<outer"]);
    }

    #[tokio::test]
    async fn publish_without_handlers_is_empty_success() {
        let mediator = Mediator::builder().build().unwrap();
        let report = mediator.publish(OrderPlaced).await;
        assert!(report.is_success());
        assert!(report.outcomes.is_empty());
    }

    #[tokio::test]
    async fn publish_isolates_failing_subscriber() {
        for strategy in [PublishStrategy::Sequential, PublishStrategy::Concurrent] {
            let mediator = Mediator::builder()
                .config(MediatorConfig {
                    publish_strategy: strategy,
                })
                .event_handler(event_fn("first", |_: Envelope<OrderPlaced>, _| async { Ok(()) }))
                .event_handler(event_fn("second", |_: Envelope<OrderPlaced>, _| async {
                    Err(MediatorError::Transient("mailer down".into()))
                }))
                .event_handler(event_fn("third", |_: Envelope<OrderPlaced>, _| async { Ok(()) }))
                .build()
                .unwrap();

            let report = mediator.publish(OrderPlaced).await;
            let handlers: Vec<_> = report.outcomes.iter().map(|o| o.handler).collect();
            assert_eq!(handlers, vec!["first", "second", "third"]);
            assert_eq!(report.succeeded(), 2);
            assert_eq!(report.failures().map(|(h, _)| h).collect::<Vec<_>>(), vec!["second"]);
        }
    }

    #[tokio::test]
    async fn fire_and_forget_publish_is_detached() {
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        let mediator = Mediator::builder()
            .event_handler(event_fn("count", move |_: Envelope<OrderPlaced>, _| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .build()
            .unwrap();

        let envelope = mediator
            .envelope(OrderPlaced)
            .with_delivery_mode(DeliveryMode::FireAndForget);
        let report = mediator.publish_envelope(envelope, CancellationToken::new()).await;
        assert!(report.detached);

        for _ in 0..50 {
            if seen.load(Ordering::SeqCst) == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("detached publish never ran");
    }

    #[tokio::test]
    async fn cancelled_send_never_runs_handler() {
        let mediator = Mediator::builder()
            .request_handler(create_handler())
            .build()
            .unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let envelope = mediator.envelope(CreateOrder { id: "X".into() });
        let err = mediator.send_envelope(envelope, token).await.unwrap_err();
        assert!(matches!(err, MediatorError::Cancelled));
    }
}
