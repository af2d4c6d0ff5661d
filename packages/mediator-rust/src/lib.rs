//! Courier Mediator: in-process CQRS dispatch with a tower-based behavior
//! pipeline, resilience layers, idempotency/inbox/outbox stores and QoS-aware
//! transports.

pub mod behaviors;
pub mod cache;
pub mod config;
pub mod handler;
pub mod leadership;
pub mod mediator;
pub mod observe;
pub mod outbox;
pub mod pipeline;
pub mod registry;
pub mod resilience;
pub mod storage;
pub mod telemetry;
pub mod transport;
pub mod worker;

pub use courier_core::{
    ConfigError, CorrelationId, DeliveryMode, Envelope, Event, MediatorError, Message, MessageId, Qos, Request,
};
pub use handler::{event_fn, request_fn, EventHandler, RequestHandler};
pub use leadership::{AlwaysLeader, LeadershipSignal, WatchLeadership};
pub use mediator::{Mediator, MediatorBuilder, PublishReport, SubscriberOutcome};
pub use observe::{DispatchObserver, TracingObserver};
pub use pipeline::{behavior_fn, Dispatch, Next, PipelineContext};
pub use registry::{HandlerProvider, HandlerRegistry};
pub use worker::{BackgroundRunnable, BackgroundWorker};
