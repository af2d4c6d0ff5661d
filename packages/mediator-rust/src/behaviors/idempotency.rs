//! Idempotent execution keyed by message id.
//!
//! The first call for a message id (per handler) claims it in the
//! [`IdempotencyStore`] and runs the chain; its outcome, success or
//! permanent failure, is cached and replayed to every later call with the
//! same id. Transient failures, cancellations, panics and backpressure
//! rejections (`CircuitOpen`, `CapacityExceeded`) release the claim instead,
//! so a retry runs the handler again.
//!
//! A call that finds the id in flight polls until the owner completes, the
//! owner's claim is released or lapses, or `in_flight_wait` passes (then it
//! fails with `DuplicateMessage`).

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use courier_core::{JsonSerializer, MediatorError, Message, MessageId, Serializer, StoredOutcome};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tower::{Layer, Service, ServiceExt};
use tracing::{debug, warn};

use crate::config::FailureMode;
use crate::pipeline::Dispatch;
use crate::storage::{Claim, IdempotencyStore};

// ---------------------------------------------------------------------------
// IdempotencyLayer
// ---------------------------------------------------------------------------

pub struct IdempotencyLayer<Ser: Serializer = JsonSerializer> {
    store: Arc<IdempotencyStore<Ser>>,
}

impl<Ser: Serializer> IdempotencyLayer<Ser> {
    #[must_use]
    pub fn new(store: Arc<IdempotencyStore<Ser>>) -> Self {
        Self { store }
    }
}

impl<Ser: Serializer> Clone for IdempotencyLayer<Ser> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<Ser: Serializer> fmt::Debug for IdempotencyLayer<Ser> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyLayer").field("store", &self.store).finish()
    }
}

impl<S, Ser: Serializer> Layer<S> for IdempotencyLayer<Ser> {
    type Service = IdempotencyService<S, Ser>;

    fn layer(&self, inner: S) -> Self::Service {
        IdempotencyService {
            inner,
            store: Arc::clone(&self.store),
        }
    }
}

// ---------------------------------------------------------------------------
// IdempotencyService
// ---------------------------------------------------------------------------

pub struct IdempotencyService<S, Ser: Serializer = JsonSerializer> {
    inner: S,
    store: Arc<IdempotencyStore<Ser>>,
}

impl<S: Clone, Ser: Serializer> Clone for IdempotencyService<S, Ser> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: fmt::Debug, Ser: Serializer> fmt::Debug for IdempotencyService<S, Ser> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyService")
            .field("inner", &self.inner)
            .field("store", &self.store)
            .finish()
    }
}

impl<S, M, Ser> Service<Dispatch<M>> for IdempotencyService<S, Ser>
where
    S: Service<Dispatch<M>, Error = MediatorError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Serialize + DeserializeOwned + Send + 'static,
    M: Message,
    Ser: Serializer,
{
    type Response = S::Response;
    type Error = MediatorError;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, MediatorError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dispatch: Dispatch<M>) -> Self::Future {
        Box::pin(guard(Arc::clone(&self.store), self.inner.clone(), dispatch))
    }
}

/// Failures that say nothing lasting about the message: transient errors,
/// cancellation, panics, and rejections by inner layers that never reached
/// the handler (open circuit, exhausted capacity, an inner dedup guard).
fn releases_claim(err: &MediatorError) -> bool {
    err.is_transient()
        || matches!(
            err,
            MediatorError::Cancelled
                | MediatorError::HandlerPanicked { .. }
                | MediatorError::CircuitOpen { .. }
                | MediatorError::CapacityExceeded { .. }
                | MediatorError::DuplicateMessage { .. }
        )
}

async fn guard<S, M, Ser>(
    store: Arc<IdempotencyStore<Ser>>,
    inner: S,
    dispatch: Dispatch<M>,
) -> Result<S::Response, MediatorError>
where
    S: Service<Dispatch<M>, Error = MediatorError> + Send,
    S::Response: Serialize + DeserializeOwned,
    M: Message,
    Ser: Serializer,
{
    let scope = dispatch.ctx.handler;
    let id = dispatch.envelope.id().clone();
    let config = store.config().clone();
    let deadline = tokio::time::Instant::now() + config.in_flight_wait;

    let mut claim = store.try_claim(scope, &id).await;
    loop {
        let current = match claim {
            Ok(current) => current,
            Err(err) => {
                return match config.failure_mode {
                    FailureMode::Closed => Err(err),
                    FailureMode::Open => {
                        warn!(message_id = %id, error = %err, "idempotency store unavailable; running unguarded");
                        inner.oneshot(dispatch).await
                    }
                };
            }
        };

        match current {
            Claim::Acquired => return execute(&store, scope, &id, inner, dispatch).await,
            Claim::Completed(outcome) => return replay(&store, &id, &outcome, config.surface_duplicates),
            Claim::InProgress { .. } => {
                if tokio::time::Instant::now() >= deadline {
                    debug!(message_id = %id, "gave up waiting for in-flight duplicate");
                    return Err(MediatorError::DuplicateMessage { id });
                }
                tokio::select! {
                    biased;
                    () = dispatch.ctx.cancellation.cancelled() => return Err(MediatorError::Cancelled),
                    () = tokio::time::sleep(config.poll_interval) => {}
                }
                claim = store.try_claim(scope, &id).await;
            }
        }
    }
}

async fn execute<S, M, Ser>(
    store: &IdempotencyStore<Ser>,
    scope: &str,
    id: &MessageId,
    inner: S,
    dispatch: Dispatch<M>,
) -> Result<S::Response, MediatorError>
where
    S: Service<Dispatch<M>, Error = MediatorError>,
    S::Response: Serialize,
    Ser: Serializer,
{
    let result = inner.oneshot(dispatch).await;

    let settled = match &result {
        Err(err) if releases_claim(err) => store.release(scope, id).await,
        _ => match StoredOutcome::capture(&result, store.serializer()) {
            Ok(outcome) => store.complete(scope, id, outcome).await.map(|_| ()),
            Err(err) => {
                warn!(message_id = %id, error = %err, "response not cacheable; releasing claim");
                store.release(scope, id).await
            }
        },
    };
    if let Err(err) = settled {
        // The handler already ran; its result stands. A lapsed lease lets a
        // later caller recover the claim.
        warn!(message_id = %id, error = %err, "could not settle idempotency record");
    }
    result
}

fn replay<T, Ser>(
    store: &IdempotencyStore<Ser>,
    id: &MessageId,
    outcome: &StoredOutcome,
    surface_duplicates: bool,
) -> Result<T, MediatorError>
where
    T: DeserializeOwned,
    Ser: Serializer,
{
    metrics::counter!("courier_idempotency_replays_total").increment(1);
    debug!(message_id = %id, success = outcome.is_success(), "replaying cached outcome");
    if surface_duplicates {
        return Err(MediatorError::DuplicateMessage { id: id.clone() });
    }
    outcome.restore(store.serializer())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use courier_core::{BackendError, ErrorKind, KeyValueBackend, MsgPackSerializer};

    use super::*;
    use crate::behaviors::testing::{clock, dispatch, dispatch_with_id, Scripted};
    use crate::config::IdempotencyConfig;
    use crate::storage::InMemoryBackend;

    fn layer_with(config: IdempotencyConfig) -> IdempotencyLayer<MsgPackSerializer> {
        let clock = clock();
        let store = IdempotencyStore::new(
            Arc::new(InMemoryBackend::with_clock(clock.clone())),
            MsgPackSerializer,
            clock,
            config,
        )
        .unwrap();
        IdempotencyLayer::new(Arc::new(store))
    }

    fn layer() -> IdempotencyLayer<MsgPackSerializer> {
        layer_with(IdempotencyConfig::default())
    }

    #[tokio::test]
    async fn repeat_replays_cached_success() {
        let stub = Scripted::ok();
        let svc = layer().layer(stub.clone());

        assert_eq!(svc.clone().oneshot(dispatch()).await.unwrap(), 1);
        assert_eq!(svc.clone().oneshot(dispatch()).await.unwrap(), 1);
        assert_eq!(stub.call_count(), 1);

        assert_eq!(svc.oneshot(dispatch_with_id("m-2")).await.unwrap(), 2);
        assert_eq!(stub.call_count(), 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_cached() {
        let stub = Scripted::new(|_| Err(MediatorError::Validation("card declined".into())));
        let svc = layer().layer(stub.clone());

        for _ in 0..3 {
            let err = svc.clone().oneshot(dispatch()).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
        assert_eq!(stub.call_count(), 1);
    }

    #[tokio::test]
    async fn transient_failure_releases_claim() {
        let stub = Scripted::new(|n| {
            if n == 1 {
                Err(MediatorError::Transient("gateway timeout".into()))
            } else {
                Ok(n)
            }
        });
        let svc = layer().layer(stub.clone());

        assert!(svc.clone().oneshot(dispatch()).await.is_err());
        assert_eq!(svc.clone().oneshot(dispatch()).await.unwrap(), 2);
        assert_eq!(svc.oneshot(dispatch()).await.unwrap(), 2);
        assert_eq!(stub.call_count(), 2);
    }

    #[tokio::test]
    async fn backpressure_rejection_is_not_cached() {
        let stub = Scripted::new(|n| match n {
            1 => Err(MediatorError::CapacityExceeded {
                resource: "charges".into(),
            }),
            2 => Err(MediatorError::CircuitOpen {
                key: "payments.charge".into(),
            }),
            n => Ok(n),
        });
        let svc = layer().layer(stub.clone());

        let first = svc.clone().oneshot(dispatch()).await.unwrap_err();
        assert_eq!(first.kind(), ErrorKind::CapacityExceeded);
        let second = svc.clone().oneshot(dispatch()).await.unwrap_err();
        assert_eq!(second.kind(), ErrorKind::CircuitOpen);
        assert_eq!(svc.clone().oneshot(dispatch()).await.unwrap(), 3);
        assert_eq!(svc.oneshot(dispatch()).await.unwrap(), 3);
        assert_eq!(stub.call_count(), 3);
    }

    #[tokio::test]
    async fn surfaced_duplicates_are_errors() {
        let svc = layer_with(IdempotencyConfig {
            surface_duplicates: true,
            ..IdempotencyConfig::default()
        })
        .layer(Scripted::ok());

        svc.clone().oneshot(dispatch()).await.unwrap();
        let err = svc.oneshot(dispatch()).await.unwrap_err();
        assert!(matches!(err, MediatorError::DuplicateMessage { id } if id.as_str() == "m-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_duplicate_waits_for_owner() {
        let stub = Scripted::ok().delayed(Duration::from_millis(100));
        let svc = layer().layer(stub.clone());

        let first = tokio::spawn(svc.clone().oneshot(dispatch()));
        let second = tokio::spawn(svc.clone().oneshot(dispatch()));

        assert_eq!(first.await.unwrap().unwrap(), 1);
        assert_eq!(second.await.unwrap().unwrap(), 1);
        assert_eq!(stub.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_wait_is_bounded() {
        let svc = layer_with(IdempotencyConfig {
            in_flight_wait: Duration::from_millis(50),
            ..IdempotencyConfig::default()
        })
        .layer(Scripted::ok().delayed(Duration::from_secs(10)));

        let _owner = tokio::spawn(svc.clone().oneshot(dispatch()));
        tokio::time::sleep(Duration::from_millis(1)).await;

        let err = svc.oneshot(dispatch()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateMessage);
    }

    struct DownBackend;

    #[async_trait]
    impl KeyValueBackend for DownBackend {
        async fn get(&self, _: &str) -> Result<Option<Vec<u8>>, BackendError> {
            Err(BackendError::Unavailable("down".into()))
        }
        async fn set(&self, _: &str, _: Vec<u8>, _: Option<Duration>) -> Result<(), BackendError> {
            Err(BackendError::Unavailable("down".into()))
        }
        async fn set_if_absent(&self, _: &str, _: Vec<u8>, _: Option<Duration>) -> Result<bool, BackendError> {
            Err(BackendError::Unavailable("down".into()))
        }
        async fn compare_and_swap(
            &self,
            _: &str,
            _: &[u8],
            _: Vec<u8>,
            _: Option<Duration>,
        ) -> Result<bool, BackendError> {
            Err(BackendError::Unavailable("down".into()))
        }
        async fn delete(&self, _: &str) -> Result<bool, BackendError> {
            Err(BackendError::Unavailable("down".into()))
        }
        async fn exists(&self, _: &str) -> Result<bool, BackendError> {
            Err(BackendError::Unavailable("down".into()))
        }
        async fn keys_with_prefix(&self, _: &str) -> Result<Vec<String>, BackendError> {
            Err(BackendError::Unavailable("down".into()))
        }
    }

    fn down_layer(failure_mode: FailureMode) -> IdempotencyLayer {
        let store = IdempotencyStore::new(
            Arc::new(DownBackend),
            JsonSerializer,
            clock(),
            IdempotencyConfig {
                failure_mode,
                ..IdempotencyConfig::default()
            },
        )
        .unwrap();
        IdempotencyLayer::new(Arc::new(store))
    }

    #[tokio::test]
    async fn store_outage_fails_closed_by_default() {
        let stub = Scripted::ok();
        let err = down_layer(FailureMode::Closed)
            .layer(stub.clone())
            .oneshot(dispatch())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
        assert_eq!(stub.call_count(), 0);
    }

    #[tokio::test]
    async fn store_outage_fails_open_when_configured() {
        let stub = Scripted::ok();
        let out = down_layer(FailureMode::Open)
            .layer(stub.clone())
            .oneshot(dispatch())
            .await
            .unwrap();
        assert_eq!(out, 1);
    }
}
