//! Message model: marker traits, delivery guarantees, headers and envelopes.
//!
//! Payloads are immutable once wrapped in an [`Envelope`]: the envelope holds
//! them behind an `Arc`, so cloning an envelope for a retry or a fan-out never
//! copies the payload.

use std::any::type_name;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::ClockSource;
use crate::id::{CorrelationId, IdSupplier, MessageId};

// ---------------------------------------------------------------------------
// Marker traits
// ---------------------------------------------------------------------------

/// Anything that can travel through the mediator.
pub trait Message: Send + Sync + 'static {
    /// Stable name used for logging, metrics, breaker keys and transport routing.
    ///
    /// Defaults to the Rust type name. Override when the name must survive
    /// refactors (for example when it is used as a transport destination).
    fn message_type() -> &'static str
    where
        Self: Sized,
    {
        type_name::<Self>()
    }
}

/// A command or query: handled by exactly one handler, produces a response.
pub trait Request: Message {
    /// Value produced by the handler on success.
    type Response: Send + 'static;
}

/// A notification: handled by zero or more handlers, produces no value.
pub trait Event: Message {}

// ---------------------------------------------------------------------------
// Delivery semantics
// ---------------------------------------------------------------------------

/// Delivery guarantee requested for a message on a transport.
///
/// `ExactlyOnce` is never a transport primitive: it is at-least-once delivery
/// plus mandatory deduplication on the consuming side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Qos {
    /// Fire-and-forget: no ack, no retry, may be lost.
    AtMostOnce,
    /// Publisher waits for the broker ack; consumers may see redeliveries.
    #[default]
    AtLeastOnce,
    /// At-least-once delivery composed with consumer-side deduplication.
    ExactlyOnce,
}

impl Qos {
    /// Whether the publisher must wait for a broker-level acknowledgement.
    #[must_use]
    pub fn requires_ack(self) -> bool {
        !matches!(self, Qos::AtMostOnce)
    }

    /// Whether a nacked or unacknowledged delivery is redelivered.
    #[must_use]
    pub fn allows_redelivery(self) -> bool {
        self.requires_ack()
    }

    /// Whether the consumer must deduplicate through an inbox or idempotency store.
    #[must_use]
    pub fn requires_dedup(self) -> bool {
        matches!(self, Qos::ExactlyOnce)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Qos::AtMostOnce => "at_most_once",
            Qos::AtLeastOnce => "at_least_once",
            Qos::ExactlyOnce => "exactly_once",
        }
    }
}

/// Whether the caller waits for handler outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Dispatch in the background; the caller gets no handler outcomes.
    FireAndForget,
    /// The caller waits until every handler has produced an outcome.
    #[default]
    WaitForResult,
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Identity and routing metadata carried with every message.
///
/// Serialized alongside the payload on transports, so the receiving side sees
/// the same `id` the sender assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeaders {
    /// Assigned once at creation, never regenerated on retry or redelivery.
    pub id: MessageId,
    /// Groups every message caused by one logical operation.
    pub correlation_id: CorrelationId,
    /// Id of the message whose handling produced this one, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<MessageId>,
    /// Stable message type name (see [`Message::message_type`]).
    pub message_type: String,
    pub qos: Qos,
    pub delivery_mode: DeliveryMode,
    /// Creation time, milliseconds since Unix epoch.
    pub created_at_ms: u64,
}

impl MessageHeaders {
    /// Headers for a brand-new message. The correlation id defaults to `id`.
    #[must_use]
    pub fn new(id: MessageId, message_type: impl Into<String>, created_at_ms: u64) -> Self {
        Self {
            correlation_id: CorrelationId::from(&id),
            id,
            causation_id: None,
            message_type: message_type.into(),
            qos: Qos::default(),
            delivery_mode: DeliveryMode::default(),
            created_at_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// An immutable payload plus its headers.
#[derive(Debug)]
pub struct Envelope<M> {
    pub headers: MessageHeaders,
    payload: Arc<M>,
}

impl<M> Clone for Envelope<M> {
    fn clone(&self) -> Self {
        Self {
            headers: self.headers.clone(),
            payload: Arc::clone(&self.payload),
        }
    }
}

impl<M: Message> Envelope<M> {
    /// Wraps `payload` with a fresh id from `ids` and a creation stamp from `clock`.
    pub fn new(payload: M, ids: &dyn IdSupplier, clock: &dyn ClockSource) -> Self {
        Self::with_id(payload, ids.next_id(), clock.now())
    }

    /// Wraps `payload` under an id assigned elsewhere (for example a
    /// redelivered transport message).
    pub fn with_id(payload: M, id: MessageId, created_at_ms: u64) -> Self {
        Self {
            headers: MessageHeaders::new(id, M::message_type(), created_at_ms),
            payload: Arc::new(payload),
        }
    }

    /// Rebuilds an envelope from headers received over a transport.
    pub fn from_parts(headers: MessageHeaders, payload: M) -> Self {
        Self {
            headers,
            payload: Arc::new(payload),
        }
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.headers.correlation_id = correlation_id;
        self
    }

    #[must_use]
    pub fn with_causation(mut self, causation_id: MessageId) -> Self {
        self.headers.causation_id = Some(causation_id);
        self
    }

    #[must_use]
    pub fn with_qos(mut self, qos: Qos) -> Self {
        self.headers.qos = qos;
        self
    }

    #[must_use]
    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.headers.delivery_mode = mode;
        self
    }
}

impl<M> Envelope<M> {
    #[must_use]
    pub fn id(&self) -> &MessageId {
        &self.headers.id
    }

    #[must_use]
    pub fn payload(&self) -> &M {
        &self.payload
    }

    /// Shared handle to the payload.
    #[must_use]
    pub fn payload_arc(&self) -> Arc<M> {
        Arc::clone(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::id::UuidSupplier;

    #[derive(Debug)]
    struct PlaceOrder {
        sku: String,
    }

    impl Message for PlaceOrder {
        fn message_type() -> &'static str {
            "orders.place"
        }
    }

    #[test]
    fn new_envelope_correlates_to_itself() {
        let clock = ManualClock::new(1_700_000_000_000);
        let env = Envelope::new(PlaceOrder { sku: "A-1".into() }, &UuidSupplier, &clock);

        assert_eq!(env.headers.correlation_id.as_str(), env.id().as_str());
        assert_eq!(env.headers.message_type, "orders.place");
        assert_eq!(env.headers.created_at_ms, 1_700_000_000_000);
        assert_eq!(env.payload().sku, "A-1");
    }

    #[test]
    fn clone_shares_payload() {
        let env = Envelope::with_id(PlaceOrder { sku: "B".into() }, MessageId::new("m1"), 0);
        let copy = env.clone();
        assert!(Arc::ptr_eq(&env.payload_arc(), &copy.payload_arc()));
        assert_eq!(copy.id(), env.id());
    }

    #[test]
    fn qos_semantics() {
        assert!(!Qos::AtMostOnce.requires_ack());
        assert!(!Qos::AtMostOnce.allows_redelivery());
        assert!(Qos::AtLeastOnce.requires_ack());
        assert!(!Qos::AtLeastOnce.requires_dedup());
        assert!(Qos::ExactlyOnce.requires_ack());
        assert!(Qos::ExactlyOnce.requires_dedup());
    }

    #[test]
    fn headers_serialize_camel_case() {
        let headers = MessageHeaders::new(MessageId::new("m1"), "orders.place", 5);
        let json = serde_json::to_value(&headers).unwrap();
        assert_eq!(json["correlationId"], "m1");
        assert_eq!(json["messageType"], "orders.place");
        assert!(json.get("causationId").is_none());
    }
}
