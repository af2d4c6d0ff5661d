//! Handler traits and closure adapters.

use std::any::type_name;
use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use courier_core::{Envelope, Event, MediatorError, Request};

use crate::pipeline::PipelineContext;

/// Handles one request type. Exactly one must be registered per type.
#[async_trait]
pub trait RequestHandler<R: Request>: Send + Sync + 'static {
    async fn handle(
        &self,
        envelope: &Envelope<R>,
        ctx: &PipelineContext,
    ) -> Result<R::Response, MediatorError>;

    /// Name used in logs, reports and idempotency keys.
    fn name(&self) -> &'static str {
        type_name::<Self>()
    }
}

/// Handles one event type. Any number may be registered per type.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync + 'static {
    async fn handle(&self, envelope: &Envelope<E>, ctx: &PipelineContext) -> Result<(), MediatorError>;

    fn name(&self) -> &'static str {
        type_name::<Self>()
    }
}

// ---------------------------------------------------------------------------
// Closure adapters
// ---------------------------------------------------------------------------

/// Request handler backed by an async closure.
pub struct FnRequestHandler<R, F> {
    name: &'static str,
    f: F,
    _marker: PhantomData<fn(R)>,
}

/// Wraps `f(envelope, ctx)` as a request handler called `name`.
pub fn request_fn<R, F, Fut>(name: &'static str, f: F) -> FnRequestHandler<R, F>
where
    R: Request,
    F: Fn(Envelope<R>, PipelineContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R::Response, MediatorError>> + Send + 'static,
{
    FnRequestHandler {
        name,
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<R, F, Fut> RequestHandler<R> for FnRequestHandler<R, F>
where
    R: Request,
    F: Fn(Envelope<R>, PipelineContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R::Response, MediatorError>> + Send + 'static,
{
    async fn handle(
        &self,
        envelope: &Envelope<R>,
        ctx: &PipelineContext,
    ) -> Result<R::Response, MediatorError> {
        (self.f)(envelope.clone(), ctx.clone()).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Event handler backed by an async closure.
pub struct FnEventHandler<E, F> {
    name: &'static str,
    f: F,
    _marker: PhantomData<fn(E)>,
}

/// Wraps `f(envelope, ctx)` as an event handler called `name`.
pub fn event_fn<E, F, Fut>(name: &'static str, f: F) -> FnEventHandler<E, F>
where
    E: Event,
    F: Fn(Envelope<E>, PipelineContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), MediatorError>> + Send + 'static,
{
    FnEventHandler {
        name,
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<E, F, Fut> EventHandler<E> for FnEventHandler<E, F>
where
    E: Event,
    F: Fn(Envelope<E>, PipelineContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), MediatorError>> + Send + 'static,
{
    async fn handle(&self, envelope: &Envelope<E>, ctx: &PipelineContext) -> Result<(), MediatorError> {
        (self.f)(envelope.clone(), ctx.clone()).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
