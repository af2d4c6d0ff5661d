//! Consuming side: decodes deliveries and publishes them through the mediator.
//!
//! With an inbox, each message id is dispatched at most once to completion:
//! redeliveries of a processed message are acknowledged without dispatch.
//! Exactly-once subscriptions must have an inbox. When some handlers fail,
//! the delivery is rejected and redelivered to all of them, so handlers on
//! redelivering transports should be idempotent (see
//! [`IdempotencyLayer`](crate::behaviors::IdempotencyLayer)).

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{
    ConfigError, DeliveryMode, Envelope, Event, InboxStatus, JsonSerializer, MediatorError, Qos, Serializer,
};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{Delivery, DeliveryHandler, Subscription, Transport};
use crate::mediator::Mediator;
use crate::storage::{InboxClaim, InboxStore};

pub struct EventEndpoint<E, S: Serializer = JsonSerializer> {
    mediator: Mediator,
    destination: String,
    qos: Qos,
    serializer: S,
    inbox: Option<Arc<InboxStore>>,
    _event: PhantomData<fn() -> E>,
}

impl<E, S> EventEndpoint<E, S>
where
    E: Event + DeserializeOwned,
    S: Serializer,
{
    /// # Errors
    ///
    /// Returns `ConfigError::MissingInbox` for an exactly-once endpoint
    /// without an inbox.
    pub fn new(
        mediator: Mediator,
        destination: impl Into<String>,
        qos: Qos,
        serializer: S,
        inbox: Option<Arc<InboxStore>>,
    ) -> Result<Self, ConfigError> {
        let destination = destination.into();
        if qos.requires_dedup() && inbox.is_none() {
            return Err(ConfigError::MissingInbox { destination });
        }
        Ok(Self {
            mediator,
            destination,
            qos,
            serializer,
            inbox,
            _event: PhantomData,
        })
    }

    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Subscribes this endpoint to its destination on `transport`.
    ///
    /// # Errors
    ///
    /// Whatever the transport's `subscribe` fails with.
    pub async fn subscribe(self, transport: &dyn Transport) -> Result<Subscription, MediatorError> {
        let destination = self.destination.clone();
        transport.subscribe(&destination, Arc::new(self)).await
    }

    async fn dispatch(&self, delivery: &Delivery) -> Result<(), MediatorError> {
        let headers = &delivery.message.headers;
        let event: E = match self.serializer.deserialize(&delivery.message.payload) {
            Ok(event) => event,
            Err(err) => {
                // Redelivery cannot fix an undecodable payload.
                metrics::counter!("courier_transport_poison_total", "destination" => self.destination.clone())
                    .increment(1);
                error!(message_id = %headers.id, error = %err, "dropping undecodable delivery");
                return Ok(());
            }
        };

        let envelope = Envelope::from_parts(headers.clone(), event).with_delivery_mode(DeliveryMode::WaitForResult);
        let report = self
            .mediator
            .publish_envelope(envelope, CancellationToken::new())
            .await;
        if report.is_success() {
            return Ok(());
        }
        let failures: Vec<String> = report
            .failures()
            .map(|(handler, err)| format!("{handler}: {err}"))
            .collect();
        Err(MediatorError::Handler(anyhow::anyhow!(
            "{} of {} handlers failed ({})",
            report.failed(),
            report.outcomes.len(),
            failures.join("; ")
        )))
    }
}

impl<E, S: Serializer> std::fmt::Debug for EventEndpoint<E, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEndpoint")
            .field("destination", &self.destination)
            .field("qos", &self.qos)
            .field("inbox", &self.inbox.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<E, S> DeliveryHandler for EventEndpoint<E, S>
where
    E: Event + DeserializeOwned,
    S: Serializer,
{
    async fn on_delivery(&self, delivery: Delivery) -> Result<(), MediatorError> {
        let Some(inbox) = &self.inbox else {
            return self.dispatch(&delivery).await;
        };

        let headers = &delivery.message.headers;
        match inbox.try_claim(headers).await? {
            InboxClaim::Acquired => {}
            InboxClaim::Duplicate(status) => {
                metrics::counter!("courier_inbox_duplicates_total", "destination" => self.destination.clone())
                    .increment(1);
                debug!(message_id = %headers.id, attempt = delivery.attempt, ?status, "duplicate delivery");
                // Still in flight elsewhere: reject so the message comes back
                // if that attempt fails.
                return match status {
                    InboxStatus::Processed => Ok(()),
                    InboxStatus::Claimed => Err(MediatorError::DuplicateMessage {
                        id: headers.id.clone(),
                    }),
                };
            }
        }

        match self.dispatch(&delivery).await {
            Ok(()) => inbox.mark_processed(&headers.id).await,
            Err(err) => {
                if let Err(release_err) = inbox.release(&headers.id).await {
                    warn!(message_id = %headers.id, error = %release_err, "could not release inbox claim");
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use courier_core::{ManualClock, Message, MessageHeaders, MessageId};
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::config::InboxConfig;
    use crate::handler::event_fn;
    use crate::storage::InMemoryBackend;
    use crate::transport::TransportMessage;

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: String,
    }
    impl Message for OrderPlaced {
        fn message_type() -> &'static str {
            "orders.placed"
        }
    }
    impl Event for OrderPlaced {}

    fn inbox() -> Arc<InboxStore> {
        let clock = Arc::new(ManualClock::new(0));
        Arc::new(InboxStore::new(
            Arc::new(InMemoryBackend::with_clock(clock.clone())),
            JsonSerializer,
            clock,
            InboxConfig::default(),
        ))
    }

    fn counting_mediator(fail_first: u32) -> (Mediator, Arc<AtomicU32>) {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let mediator = Mediator::builder()
            .event_handler(event_fn("ship", move |_: Envelope<OrderPlaced>, _| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n <= fail_first {
                        Err(MediatorError::Transient("warehouse offline".into()))
                    } else {
                        Ok(())
                    }
                }
            }))
            .build()
            .unwrap();
        (mediator, runs)
    }

    fn delivery(id: &str, attempt: u32) -> Delivery {
        let mut headers = MessageHeaders::new(MessageId::new(id), "orders.placed", 0);
        headers.qos = Qos::ExactlyOnce;
        let payload = JsonSerializer
            .serialize(&OrderPlaced {
                order_id: "X".into(),
            })
            .unwrap();
        Delivery {
            message: TransportMessage::new(headers, "orders", payload),
            attempt,
        }
    }

    #[test]
    fn exactly_once_requires_inbox() {
        let (mediator, _) = counting_mediator(0);
        let err = EventEndpoint::<OrderPlaced>::new(mediator, "orders", Qos::ExactlyOnce, JsonSerializer, None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingInbox { destination } if destination == "orders"));
    }

    #[tokio::test]
    async fn redelivered_duplicate_is_acked_without_dispatch() {
        let (mediator, runs) = counting_mediator(0);
        let endpoint =
            EventEndpoint::<OrderPlaced>::new(mediator, "orders", Qos::ExactlyOnce, JsonSerializer, Some(inbox()))
                .unwrap();

        endpoint.on_delivery(delivery("e-1", 1)).await.unwrap();
        endpoint.on_delivery(delivery("e-1", 2)).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_dispatch_releases_claim_for_redelivery() {
        let (mediator, runs) = counting_mediator(1);
        let endpoint =
            EventEndpoint::<OrderPlaced>::new(mediator, "orders", Qos::ExactlyOnce, JsonSerializer, Some(inbox()))
                .unwrap();

        assert!(endpoint.on_delivery(delivery("e-1", 1)).await.is_err());
        endpoint.on_delivery(delivery("e-1", 2)).await.unwrap();
        endpoint.on_delivery(delivery("e-1", 3)).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn undecodable_payload_is_dropped() {
        let (mediator, runs) = counting_mediator(0);
        let endpoint =
            EventEndpoint::<OrderPlaced>::new(mediator, "orders", Qos::AtLeastOnce, JsonSerializer, None).unwrap();

        let mut bad = delivery("e-1", 1);
        bad.message.payload = bytes::Bytes::from_static(b"not json");
        endpoint.on_delivery(bad).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn end_to_end_over_in_process_transport() {
        let (mediator, runs) = counting_mediator(1);
        let transport = crate::transport::InProcessTransport::new(crate::config::InProcessTransportConfig {
            redelivery_delay: Duration::from_millis(1),
            ..Default::default()
        })
        .unwrap();
        let _sub = EventEndpoint::<OrderPlaced>::new(
            mediator,
            "orders",
            Qos::ExactlyOnce,
            JsonSerializer,
            Some(inbox()),
        )
        .unwrap()
        .subscribe(&transport)
        .await
        .unwrap();

        let d = delivery("e-1", 1);
        transport.publish(d.message.clone()).await.unwrap();
        transport.publish(d.message).await.unwrap();

        for _ in 0..200 {
            if runs.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        // One failed attempt, one success; the duplicate publish never dispatches again.
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
