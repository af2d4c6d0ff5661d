//! QoS transport contract.
//!
//! A [`Transport`] moves serialized events between processes. The delivery
//! guarantee travels in each message's headers:
//!
//! | QoS           | publish returns after          | nack / failure      |
//! |---------------|--------------------------------|---------------------|
//! | `AtMostOnce`  | hand-off, no confirmation      | message dropped     |
//! | `AtLeastOnce` | the transport accepted it      | redelivered         |
//! | `ExactlyOnce` | same as `AtLeastOnce`          | redelivered, and the consuming [`EventEndpoint`] deduplicates through its inbox |

mod endpoint;
mod in_process;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{MediatorError, MessageHeaders, Qos};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use endpoint::EventEndpoint;
pub use in_process::InProcessTransport;

/// A serialized event on the wire.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    pub headers: MessageHeaders,
    /// Topic, queue or routing key.
    pub destination: String,
    pub payload: Bytes,
}

impl TransportMessage {
    #[must_use]
    pub fn new(headers: MessageHeaders, destination: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            headers,
            destination: destination.into(),
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn qos(&self) -> Qos {
        self.headers.qos
    }
}

/// One delivery attempt of a message to a subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: TransportMessage,
    /// 1 for the first delivery, incremented on each redelivery.
    pub attempt: u32,
}

impl Delivery {
    #[must_use]
    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }
}

/// Consumer side of a subscription. `Ok` acknowledges the delivery; `Err`
/// rejects it, which triggers a redelivery for acknowledged QoS levels.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn on_delivery(&self, delivery: Delivery) -> Result<(), MediatorError>;
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Publishes `message` under the QoS in its headers.
    ///
    /// # Errors
    ///
    /// For acknowledged QoS levels, `MediatorError::Transport` when the
    /// message was not accepted. `AtMostOnce` never fails.
    async fn publish(&self, message: TransportMessage) -> Result<(), MediatorError>;

    /// Starts delivering messages sent to `destination` to `handler` until
    /// the returned subscription is dropped.
    ///
    /// # Errors
    ///
    /// `MediatorError::Transport` if the subscription cannot be set up.
    async fn subscribe(
        &self,
        destination: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Subscription, MediatorError>;
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

type CloseHook = Box<dyn FnOnce() + Send>;

/// Handle to an active subscription. Dropping it stops delivery.
pub struct Subscription {
    destination: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    on_close: Option<CloseHook>,
}

impl Subscription {
    /// Wraps a consumer task. `on_close` runs exactly once, when the
    /// subscription is closed or dropped.
    pub fn new(
        destination: impl Into<String>,
        cancel: CancellationToken,
        task: Option<JoinHandle<()>>,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            destination: destination.into(),
            cancel,
            task,
            on_close: Some(Box::new(on_close)),
        }
    }

    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    fn detach(&mut self) {
        self.cancel.cancel();
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }

    /// Stops delivery and waits for an in-progress delivery to finish.
    pub async fn close(mut self) {
        self.detach();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("destination", &self.destination)
            .field("closed", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
