//! Outbox persistence.
//!
//! Entries are written `Pending` alongside the business change that produced
//! them and move to `Published` once the transport confirms, or to `Failed`
//! when the attempt budget runs out. Terminal states never change again;
//! every transition is a compare-and-swap on the stored bytes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{
    JsonSerializer, KeyValueBackend, MediatorError, MessageId, OutboxEntry, OutboxStatus, Serializer,
    SharedClock,
};
use tracing::warn;

const KEY_PREFIX: &str = "outbox:";

const CAS_ROUNDS: usize = 8;

/// How long `Failed` entries stay around for inspection unless overridden.
pub const DEFAULT_FAILED_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Entry counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxCounts {
    pub pending: usize,
    pub published: usize,
    pub failed: usize,
}

/// Storage contract used by the outbox writer and publisher.
#[async_trait]
pub trait OutboxStore: Send + Sync + 'static {
    /// Persists a new entry. Adding an id that already exists is a no-op.
    async fn add(&self, entry: OutboxEntry) -> Result<(), MediatorError>;

    async fn get(&self, id: &MessageId) -> Result<Option<OutboxEntry>, MediatorError>;

    /// Up to `limit` pending entries, oldest first.
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxEntry>, MediatorError>;

    /// Moves a pending entry to `Published`. Terminal entries are left alone.
    async fn mark_published(&self, id: &MessageId) -> Result<(), MediatorError>;

    /// Counts a failed attempt and returns the resulting status: `Failed`
    /// once `max_attempts` is reached, otherwise `Pending`.
    async fn record_failure(
        &self,
        id: &MessageId,
        error: &str,
        max_attempts: u32,
    ) -> Result<OutboxStatus, MediatorError>;

    async fn counts(&self) -> Result<OutboxCounts, MediatorError>;
}

/// [`OutboxStore`] over any [`KeyValueBackend`].
pub struct KvOutboxStore<S: Serializer = JsonSerializer> {
    backend: Arc<dyn KeyValueBackend>,
    serializer: S,
    clock: SharedClock,
    /// Expiry applied to `Published` entries.
    published_retention: Duration,
    /// Expiry applied to `Failed` entries; `None` keeps them until removed.
    failed_retention: Option<Duration>,
}

impl<S: Serializer> KvOutboxStore<S> {
    #[must_use]
    pub fn new(
        backend: Arc<dyn KeyValueBackend>,
        serializer: S,
        clock: SharedClock,
        published_retention: Duration,
    ) -> Self {
        Self {
            backend,
            serializer,
            clock,
            published_retention,
            failed_retention: Some(DEFAULT_FAILED_RETENTION),
        }
    }

    /// Overrides how long dead-lettered entries are kept. Every pending scan
    /// reads them, so `None` trades drain cost for an unbounded audit trail.
    #[must_use]
    pub fn with_failed_retention(mut self, retention: Option<Duration>) -> Self {
        self.failed_retention = retention;
        self
    }

    fn key(id: &MessageId) -> String {
        format!("{KEY_PREFIX}{id}")
    }

    async fn load(&self, key: &str) -> Result<Option<(Vec<u8>, OutboxEntry)>, MediatorError> {
        match self.backend.get(key).await? {
            Some(bytes) => {
                let entry = self.serializer.deserialize(&bytes)?;
                Ok(Some((bytes, entry)))
            }
            None => Ok(None),
        }
    }

    async fn all(&self) -> Result<Vec<OutboxEntry>, MediatorError> {
        let keys = self.backend.keys_with_prefix(KEY_PREFIX).await?;
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, entry)) = self.load(&key).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Applies `step` to the stored entry until the swap lands. `step`
    /// returns `None` to leave the entry unchanged.
    async fn transition(
        &self,
        id: &MessageId,
        mut step: impl FnMut(&OutboxEntry) -> Option<(OutboxEntry, Option<Duration>)> + Send,
    ) -> Result<Option<OutboxEntry>, MediatorError> {
        let key = Self::key(id);
        for _ in 0..CAS_ROUNDS {
            let Some((current, entry)) = self.load(&key).await? else {
                return Ok(None);
            };
            let Some((next, ttl)) = step(&entry) else {
                return Ok(Some(entry));
            };
            let bytes = self.serializer.serialize(&next)?;
            if self.backend.compare_and_swap(&key, &current, bytes, ttl).await? {
                return Ok(Some(next));
            }
        }
        Err(MediatorError::StoreUnavailable(format!("{key}: too much contention")))
    }
}

impl<S: Serializer> std::fmt::Debug for KvOutboxStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvOutboxStore")
            .field("format", &self.serializer.format())
            .field("published_retention", &self.published_retention)
            .field("failed_retention", &self.failed_retention)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<S: Serializer> OutboxStore for KvOutboxStore<S> {
    async fn add(&self, entry: OutboxEntry) -> Result<(), MediatorError> {
        let key = Self::key(entry.message_id());
        let bytes = self.serializer.serialize(&entry)?;
        if !self.backend.set_if_absent(&key, bytes, None).await? {
            warn!(key = %key, "outbox entry already exists; keeping the stored one");
        }
        Ok(())
    }

    async fn get(&self, id: &MessageId) -> Result<Option<OutboxEntry>, MediatorError> {
        Ok(self.load(&Self::key(id)).await?.map(|(_, entry)| entry))
    }

    async fn pending(&self, limit: usize) -> Result<Vec<OutboxEntry>, MediatorError> {
        let mut pending: Vec<OutboxEntry> = self
            .all()
            .await?
            .into_iter()
            .filter(|entry| entry.status == OutboxStatus::Pending)
            .collect();
        pending.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.message_id().as_str().cmp(b.message_id().as_str()))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_published(&self, id: &MessageId) -> Result<(), MediatorError> {
        let now = self.clock.now();
        let retention = self.published_retention;
        self.transition(id, |entry| {
            if entry.status.is_terminal() {
                return None;
            }
            let mut next = entry.clone();
            next.status = OutboxStatus::Published;
            next.attempts += 1;
            next.published_at_ms = Some(now);
            Some((next, Some(retention)))
        })
        .await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        id: &MessageId,
        error: &str,
        max_attempts: u32,
    ) -> Result<OutboxStatus, MediatorError> {
        let failed_retention = self.failed_retention;
        let updated = self
            .transition(id, |entry| {
                if entry.status.is_terminal() {
                    return None;
                }
                let mut next = entry.clone();
                next.attempts += 1;
                next.last_error = Some(error.to_string());
                let ttl = if next.attempts >= max_attempts {
                    next.status = OutboxStatus::Failed;
                    failed_retention
                } else {
                    None
                };
                Some((next, ttl))
            })
            .await?;
        updated
            .map(|entry| entry.status)
            .ok_or_else(|| MediatorError::Validation(format!("no outbox entry {id}")))
    }

    async fn counts(&self) -> Result<OutboxCounts, MediatorError> {
        let mut counts = OutboxCounts::default();
        for entry in self.all().await? {
            match entry.status {
                OutboxStatus::Pending => counts.pending += 1,
                OutboxStatus::Published => counts.published += 1,
                OutboxStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{ManualClock, MessageHeaders};

    use super::*;
    use crate::storage::InMemoryBackend;

    fn store(clock: &Arc<ManualClock>) -> KvOutboxStore {
        KvOutboxStore::new(
            Arc::new(InMemoryBackend::with_clock(clock.clone())),
            JsonSerializer,
            clock.clone(),
            Duration::from_secs(60),
        )
    }

    fn entry(id: &str, created_at_ms: u64) -> OutboxEntry {
        OutboxEntry::pending(
            MessageHeaders::new(MessageId::new(id), "orders.placed", created_at_ms),
            "orders",
            b"{}".to_vec(),
        )
    }

    #[tokio::test]
    async fn pending_is_oldest_first_and_limited() {
        let clock = Arc::new(ManualClock::new(0));
        let outbox = store(&clock);
        outbox.add(entry("c", 30)).await.unwrap();
        outbox.add(entry("a", 10)).await.unwrap();
        outbox.add(entry("b", 20)).await.unwrap();

        let ids: Vec<_> = outbox
            .pending(2)
            .await
            .unwrap()
            .iter()
            .map(|e| e.message_id().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn published_entry_leaves_pending_and_never_regresses() {
        let clock = Arc::new(ManualClock::new(0));
        let outbox = store(&clock);
        let id = MessageId::new("a");
        outbox.add(entry("a", 0)).await.unwrap();

        outbox.mark_published(&id).await.unwrap();
        assert!(outbox.pending(10).await.unwrap().is_empty());

        let status = outbox.record_failure(&id, "late nack", 1).await.unwrap();
        assert_eq!(status, OutboxStatus::Published);
        let stored = outbox.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert!(stored.published_at_ms.is_some());
    }

    #[tokio::test]
    async fn failure_budget_moves_entry_to_failed() {
        let clock = Arc::new(ManualClock::new(0));
        let outbox = store(&clock);
        let id = MessageId::new("a");
        outbox.add(entry("a", 0)).await.unwrap();

        assert_eq!(outbox.record_failure(&id, "broker down", 2).await.unwrap(), OutboxStatus::Pending);
        assert_eq!(outbox.record_failure(&id, "broker down", 2).await.unwrap(), OutboxStatus::Failed);

        outbox.mark_published(&id).await.unwrap();
        let stored = outbox.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("broker down"));
        assert_eq!(
            outbox.counts().await.unwrap(),
            OutboxCounts {
                pending: 0,
                published: 0,
                failed: 1
            }
        );
    }

    #[tokio::test]
    async fn duplicate_add_keeps_first_entry() {
        let clock = Arc::new(ManualClock::new(0));
        let outbox = store(&clock);
        outbox.add(entry("a", 1)).await.unwrap();
        outbox.add(entry("a", 99)).await.unwrap();
        assert_eq!(outbox.get(&MessageId::new("a")).await.unwrap().unwrap().created_at_ms, 1);
    }

    #[tokio::test]
    async fn failed_entries_expire_after_their_own_retention() {
        let clock = Arc::new(ManualClock::new(0));
        let outbox = store(&clock).with_failed_retention(Some(Duration::from_secs(300)));
        outbox.add(entry("dead", 0)).await.unwrap();
        outbox.add(entry("live", 1)).await.unwrap();
        let dead = MessageId::new("dead");

        assert_eq!(outbox.record_failure(&dead, "rejected", 1).await.unwrap(), OutboxStatus::Failed);
        clock.advance(Duration::from_secs(299));
        assert_eq!(outbox.counts().await.unwrap().failed, 1);

        clock.advance(Duration::from_secs(2));
        assert!(outbox.get(&dead).await.unwrap().is_none());
        let counts = outbox.counts().await.unwrap();
        assert_eq!((counts.pending, counts.failed), (1, 0));
    }

    #[tokio::test]
    async fn failed_entries_can_be_kept_indefinitely() {
        let clock = Arc::new(ManualClock::new(0));
        let outbox = store(&clock).with_failed_retention(None);
        let id = MessageId::new("a");
        outbox.add(entry("a", 0)).await.unwrap();
        outbox.record_failure(&id, "rejected", 1).await.unwrap();

        clock.advance(DEFAULT_FAILED_RETENTION * 2);
        assert_eq!(outbox.get(&id).await.unwrap().unwrap().status, OutboxStatus::Failed);
    }

    #[tokio::test]
    async fn published_entries_expire() {
        let clock = Arc::new(ManualClock::new(0));
        let outbox = store(&clock);
        let id = MessageId::new("a");
        outbox.add(entry("a", 0)).await.unwrap();
        outbox.mark_published(&id).await.unwrap();

        clock.advance(Duration::from_secs(61));
        assert!(outbox.get(&id).await.unwrap().is_none());
    }
}
