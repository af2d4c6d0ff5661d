//! Inbox: consumer-side deduplication of transport deliveries.
//!
//! An entry moves `absent -> Claimed -> Processed`. A redelivery that finds
//! `Processed` is a duplicate and is acknowledged without dispatch. A
//! `Claimed` entry whose lease has lapsed (the consumer died mid-flight) is
//! taken over by the next delivery.

use std::sync::Arc;
use std::time::Duration;

use courier_core::{
    InboxEntry, InboxStatus, JsonSerializer, KeyValueBackend, MediatorError, MessageHeaders, MessageId,
    Serializer, SharedClock,
};

use crate::config::InboxConfig;

const KEY_PREFIX: &str = "inbox:";

const CAS_ROUNDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxClaim {
    /// The caller processes the message and must mark it processed or release it.
    Acquired,
    /// Already seen; `status` tells whether it is still in flight elsewhere.
    Duplicate(InboxStatus),
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub struct InboxStore<S: Serializer = JsonSerializer> {
    backend: Arc<dyn KeyValueBackend>,
    serializer: S,
    clock: SharedClock,
    config: InboxConfig,
}

impl<S: Serializer> InboxStore<S> {
    #[must_use]
    pub fn new(backend: Arc<dyn KeyValueBackend>, serializer: S, clock: SharedClock, config: InboxConfig) -> Self {
        Self {
            backend,
            serializer,
            clock,
            config,
        }
    }

    fn key(id: &MessageId) -> String {
        format!("{KEY_PREFIX}{id}")
    }

    fn claimed(&self, headers: &MessageHeaders, now: u64) -> InboxEntry {
        InboxEntry {
            message_id: headers.id.clone(),
            message_type: headers.message_type.clone(),
            status: InboxStatus::Claimed,
            claimed_at_ms: now,
            lease_expires_at_ms: now.saturating_add(millis(self.config.claim_lease)),
            processed_at_ms: None,
        }
    }

    /// Claims `headers.id` for processing.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` or `Serialization` on backend failure.
    pub async fn try_claim(&self, headers: &MessageHeaders) -> Result<InboxClaim, MediatorError> {
        let key = Self::key(&headers.id);
        let ttl = Some(self.config.retention);
        for _ in 0..CAS_ROUNDS {
            let now = self.clock.now();
            let fresh = self.serializer.serialize(&self.claimed(headers, now))?;
            if self.backend.set_if_absent(&key, fresh.clone(), ttl).await? {
                return Ok(InboxClaim::Acquired);
            }
            let Some(current) = self.backend.get(&key).await? else {
                continue;
            };
            let entry: InboxEntry = self.serializer.deserialize(&current)?;
            match entry.status {
                InboxStatus::Processed => return Ok(InboxClaim::Duplicate(InboxStatus::Processed)),
                InboxStatus::Claimed if now < entry.lease_expires_at_ms => {
                    return Ok(InboxClaim::Duplicate(InboxStatus::Claimed));
                }
                InboxStatus::Claimed => {
                    if self.backend.compare_and_swap(&key, &current, fresh, ttl).await? {
                        return Ok(InboxClaim::Acquired);
                    }
                }
            }
        }
        Ok(InboxClaim::Duplicate(InboxStatus::Claimed))
    }

    /// Marks `id` processed. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` or `Serialization` on backend failure.
    pub async fn mark_processed(&self, id: &MessageId) -> Result<(), MediatorError> {
        let key = Self::key(id);
        let ttl = Some(self.config.retention);
        for _ in 0..CAS_ROUNDS {
            let now = self.clock.now();
            let current = self.backend.get(&key).await?;
            let mut entry = match &current {
                Some(bytes) => self.serializer.deserialize::<InboxEntry>(bytes)?,
                None => InboxEntry {
                    message_id: id.clone(),
                    message_type: String::new(),
                    status: InboxStatus::Claimed,
                    claimed_at_ms: now,
                    lease_expires_at_ms: now,
                    processed_at_ms: None,
                },
            };
            if entry.status == InboxStatus::Processed {
                return Ok(());
            }
            entry.status = InboxStatus::Processed;
            entry.processed_at_ms = Some(now);
            let bytes = self.serializer.serialize(&entry)?;
            let written = match &current {
                Some(expected) => self.backend.compare_and_swap(&key, expected, bytes, ttl).await?,
                None => self.backend.set_if_absent(&key, bytes, ttl).await?,
            };
            if written {
                return Ok(());
            }
        }
        Err(MediatorError::StoreUnavailable(format!("{key}: too much contention")))
    }

    /// Drops a claim after a failed dispatch so a redelivery can run.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` or `Serialization` on backend failure.
    pub async fn release(&self, id: &MessageId) -> Result<(), MediatorError> {
        let key = Self::key(id);
        let Some(current) = self.backend.get(&key).await? else {
            return Ok(());
        };
        let mut entry: InboxEntry = self.serializer.deserialize(&current)?;
        if entry.status == InboxStatus::Processed {
            return Ok(());
        }
        entry.lease_expires_at_ms = 0;
        let bytes = self.serializer.serialize(&entry)?;
        self.backend
            .compare_and_swap(&key, &current, bytes, Some(self.config.retention))
            .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `StoreUnavailable` or `Serialization` on backend failure.
    pub async fn get(&self, id: &MessageId) -> Result<Option<InboxEntry>, MediatorError> {
        match self.backend.get(&Self::key(id)).await? {
            Some(bytes) => Ok(Some(self.serializer.deserialize(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl<S: Serializer> std::fmt::Debug for InboxStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboxStore")
            .field("format", &self.serializer.format())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
