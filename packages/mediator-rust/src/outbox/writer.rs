use std::sync::Arc;

use courier_core::{
    Envelope, Event, JsonSerializer, MediatorError, MessageId, OutboxEntry, Qos, Serializer, SharedClock,
    SharedIdSupplier,
};
use serde::Serialize;
use tracing::debug;

use crate::storage::OutboxStore;

/// Serializes events into `Pending` outbox entries.
pub struct OutboxWriter<S: Serializer = JsonSerializer> {
    store: Arc<dyn OutboxStore>,
    serializer: S,
    ids: SharedIdSupplier,
    clock: SharedClock,
}

impl<S: Serializer> OutboxWriter<S> {
    #[must_use]
    pub fn new(store: Arc<dyn OutboxStore>, serializer: S, ids: SharedIdSupplier, clock: SharedClock) -> Self {
        Self {
            store,
            serializer,
            ids,
            clock,
        }
    }

    /// Stores `envelope` for publication to `destination`, keeping its headers.
    ///
    /// # Errors
    ///
    /// Serialization failures and store errors.
    pub async fn enqueue<E>(&self, envelope: &Envelope<E>, destination: &str) -> Result<MessageId, MediatorError>
    where
        E: Event + Serialize,
    {
        let payload = self.serializer.serialize(envelope.payload())?;
        let entry = OutboxEntry::pending(envelope.headers.clone(), destination, payload);
        self.store.add(entry).await?;
        debug!(
            message_id = %envelope.id(),
            message_type = E::message_type(),
            destination,
            "event written to outbox"
        );
        Ok(envelope.id().clone())
    }

    /// Wraps `event` in a fresh envelope with `qos` and stores it.
    ///
    /// # Errors
    ///
    /// See [`enqueue`](Self::enqueue).
    pub async fn enqueue_event<E>(&self, event: E, destination: &str, qos: Qos) -> Result<MessageId, MediatorError>
    where
        E: Event + Serialize,
    {
        let envelope = Envelope::new(event, self.ids.as_ref(), self.clock.as_ref()).with_qos(qos);
        self.enqueue(&envelope, destination).await
    }
}

impl<S: Serializer> std::fmt::Debug for OutboxWriter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxWriter")
            .field("format", &self.serializer.format())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_core::{ManualClock, Message, OutboxStatus, UuidSupplier};
    use serde::Deserialize;

    use super::*;
    use crate::storage::{InMemoryBackend, KvOutboxStore};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct OrderPlaced {
        order_id: String,
    }
    impl Message for OrderPlaced {
        fn message_type() -> &'static str {
            "orders.placed"
        }
    }
    impl Event for OrderPlaced {}

    fn writer() -> (OutboxWriter, Arc<KvOutboxStore>) {
        let clock = Arc::new(ManualClock::new(5_000));
        let store = Arc::new(KvOutboxStore::new(
            Arc::new(InMemoryBackend::with_clock(clock.clone())),
            JsonSerializer,
            clock.clone(),
            Duration::from_secs(60),
        ));
        let writer = OutboxWriter::new(store.clone(), JsonSerializer, Arc::new(UuidSupplier), clock);
        (writer, store)
    }

    #[tokio::test]
    async fn enqueued_event_is_pending_with_headers() {
        let (writer, store) = writer();
        let id = writer
            .enqueue_event(OrderPlaced { order_id: "X".into() }, "orders", Qos::ExactlyOnce)
            .await
            .unwrap();

        let entry = store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Pending);
        assert_eq!(entry.destination, "orders");
        assert_eq!(entry.qos(), Qos::ExactlyOnce);
        assert_eq!(entry.headers.message_type, "orders.placed");
        assert_eq!(entry.created_at_ms, 5_000);
        let decoded: OrderPlaced = JsonSerializer.deserialize(&entry.payload).unwrap();
        assert_eq!(decoded.order_id, "X");
    }

    #[tokio::test]
    async fn enqueue_keeps_envelope_id() {
        let (writer, store) = writer();
        let envelope = Envelope::with_id(OrderPlaced { order_id: "Y".into() }, MessageId::new("evt-7"), 1);
        let id = writer.enqueue(&envelope, "orders").await.unwrap();
        assert_eq!(id.as_str(), "evt-7");
        assert_eq!(store.counts().await.unwrap().pending, 1);
    }
}
