//! Idempotency store: one record per (scope, message id).
//!
//! A record moves `absent -> Processing -> Completed`. The first caller to
//! write `Processing` owns execution; everyone else either waits for the
//! outcome or, once the owner's lease has lapsed, takes the claim over.
//! `Completed` is write-once: a second `complete` returns the outcome that
//! is already stored. TTL is the only eviction policy.

use std::sync::Arc;
use std::time::Duration;

use courier_core::{
    ConfigError, IdempotencyRecord, IdempotencyState, JsonSerializer, KeyValueBackend, MediatorError,
    MessageId, Serializer, SharedClock, StoredOutcome,
};
use tracing::debug;

use crate::config::IdempotencyConfig;

const KEY_PREFIX: &str = "idem:";

/// Bound on read-then-swap rounds lost to concurrent writers.
const CAS_ROUNDS: usize = 8;

/// Result of [`IdempotencyStore::try_claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns execution and must `complete` or `release`.
    Acquired,
    /// Another caller is processing; its lease runs until the given time.
    InProgress { lease_expires_at_ms: u64 },
    /// Processing already finished with this outcome.
    Completed(StoredOutcome),
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub struct IdempotencyStore<S: Serializer = JsonSerializer> {
    backend: Arc<dyn KeyValueBackend>,
    serializer: S,
    clock: SharedClock,
    config: IdempotencyConfig,
}

impl<S: Serializer> IdempotencyStore<S> {
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSetting` if `config` does not validate.
    pub fn new(
        backend: Arc<dyn KeyValueBackend>,
        serializer: S,
        clock: SharedClock,
        config: IdempotencyConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            backend,
            serializer,
            clock,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    #[must_use]
    pub fn serializer(&self) -> &S {
        &self.serializer
    }

    fn key(scope: &str, id: &MessageId) -> String {
        format!("{KEY_PREFIX}{scope}:{id}")
    }

    fn decode(&self, key: &str, bytes: &[u8]) -> Result<IdempotencyRecord, MediatorError> {
        self.serializer
            .deserialize(bytes)
            .map_err(|err| MediatorError::Serialization(format!("{key}: {err}")))
    }

    fn processing(&self, id: &MessageId, now: u64) -> IdempotencyRecord {
        IdempotencyRecord {
            message_id: id.clone(),
            state: IdempotencyState::Processing {
                lease_expires_at_ms: now.saturating_add(millis(self.config.processing_lease)),
            },
            claimed_at_ms: now,
            processed_at_ms: None,
            expires_at_ms: now.saturating_add(millis(self.config.ttl)),
        }
    }

    /// Attempts to take ownership of processing `id` within `scope`.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` or `Serialization` when the backend fails
    /// or holds an unreadable record.
    pub async fn try_claim(&self, scope: &str, id: &MessageId) -> Result<Claim, MediatorError> {
        let key = Self::key(scope, id);
        for _ in 0..CAS_ROUNDS {
            let now = self.clock.now();
            let fresh = self.serializer.serialize(&self.processing(id, now))?;
            if self
                .backend
                .set_if_absent(&key, fresh.clone(), Some(self.config.ttl))
                .await?
            {
                metrics::counter!("courier_idempotency_claims_total", "result" => "acquired").increment(1);
                return Ok(Claim::Acquired);
            }

            // Expired between the two calls: try to claim again.
            let Some(current) = self.backend.get(&key).await? else {
                continue;
            };
            let record = self.decode(&key, &current)?;
            match record.state {
                IdempotencyState::Completed { outcome } => {
                    metrics::counter!("courier_idempotency_claims_total", "result" => "completed")
                        .increment(1);
                    return Ok(Claim::Completed(outcome));
                }
                IdempotencyState::Processing { lease_expires_at_ms } if now < lease_expires_at_ms => {
                    return Ok(Claim::InProgress { lease_expires_at_ms });
                }
                IdempotencyState::Processing { .. } => {
                    if self
                        .backend
                        .compare_and_swap(&key, &current, fresh, Some(self.config.ttl))
                        .await?
                    {
                        debug!(key = %key, "took over lapsed idempotency claim");
                        metrics::counter!("courier_idempotency_claims_total", "result" => "taken_over")
                            .increment(1);
                        return Ok(Claim::Acquired);
                    }
                }
            }
        }
        Ok(Claim::InProgress {
            lease_expires_at_ms: self.clock.now(),
        })
    }

    /// Stores the outcome for `id`. The first completion wins; the stored
    /// outcome is returned either way.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` or `Serialization` on backend failure, or
    /// `StoreUnavailable` if concurrent writers keep winning.
    pub async fn complete(
        &self,
        scope: &str,
        id: &MessageId,
        outcome: StoredOutcome,
    ) -> Result<StoredOutcome, MediatorError> {
        let key = Self::key(scope, id);
        for _ in 0..CAS_ROUNDS {
            let now = self.clock.now();
            let current = self.backend.get(&key).await?;
            let (claimed_at_ms, expires_at_ms) = match &current {
                Some(bytes) => {
                    let record = self.decode(&key, bytes)?;
                    if let IdempotencyState::Completed { outcome } = record.state {
                        return Ok(outcome);
                    }
                    (record.claimed_at_ms, record.expires_at_ms)
                }
                None => (now, now.saturating_add(millis(self.config.ttl))),
            };

            let completed = IdempotencyRecord {
                message_id: id.clone(),
                state: IdempotencyState::Completed {
                    outcome: outcome.clone(),
                },
                claimed_at_ms,
                processed_at_ms: Some(now),
                expires_at_ms,
            };
            let bytes = self.serializer.serialize(&completed)?;
            let ttl = Some(Duration::from_millis(expires_at_ms.saturating_sub(now).max(1)));
            let written = match &current {
                Some(expected) => self.backend.compare_and_swap(&key, expected, bytes, ttl).await?,
                None => self.backend.set_if_absent(&key, bytes, ttl).await?,
            };
            if written {
                return Ok(outcome);
            }
        }
        Err(MediatorError::StoreUnavailable(format!("{key}: too much contention")))
    }

    /// Gives up a claim so the next caller can run immediately.
    ///
    /// The record is kept with a lapsed lease rather than deleted, so the
    /// release is a single atomic swap.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` or `Serialization` on backend failure.
    pub async fn release(&self, scope: &str, id: &MessageId) -> Result<(), MediatorError> {
        let key = Self::key(scope, id);
        let Some(current) = self.backend.get(&key).await? else {
            return Ok(());
        };
        let mut record = self.decode(&key, &current)?;
        if record.is_completed() {
            return Ok(());
        }
        record.state = IdempotencyState::Processing { lease_expires_at_ms: 0 };
        let bytes = self.serializer.serialize(&record)?;
        let ttl = Some(Duration::from_millis(
            record.expires_at_ms.saturating_sub(self.clock.now()).max(1),
        ));
        // Losing the swap means someone else already moved the record on.
        self.backend.compare_and_swap(&key, &current, bytes, ttl).await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `StoreUnavailable` or `Serialization` on backend failure.
    pub async fn lookup(&self, scope: &str, id: &MessageId) -> Result<Option<IdempotencyRecord>, MediatorError> {
        let key = Self::key(scope, id);
        match self.backend.get(&key).await? {
            Some(bytes) => Ok(Some(self.decode(&key, &bytes)?)),
            None => Ok(None),
        }
    }
}

impl<S: Serializer> std::fmt::Debug for IdempotencyStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyStore")
            .field("format", &self.serializer.format())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{ErrorKind, ManualClock, MsgPackSerializer};

    use super::*;
    use crate::storage::InMemoryBackend;

    fn store(clock: &Arc<ManualClock>) -> IdempotencyStore<MsgPackSerializer> {
        let config = IdempotencyConfig {
            ttl: Duration::from_secs(60),
            processing_lease: Duration::from_secs(5),
            ..IdempotencyConfig::default()
        };
        IdempotencyStore::new(
            Arc::new(InMemoryBackend::with_clock(clock.clone())),
            MsgPackSerializer,
            clock.clone(),
            config,
        )
        .unwrap()
    }

    fn ok(value: u32) -> StoredOutcome {
        StoredOutcome::capture(&Ok::<_, MediatorError>(value), &MsgPackSerializer).unwrap()
    }

    #[tokio::test]
    async fn first_claim_wins_then_in_progress() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(&clock);
        let id = MessageId::new("m-1");

        assert_eq!(store.try_claim("h", &id).await.unwrap(), Claim::Acquired);
        assert_eq!(
            store.try_claim("h", &id).await.unwrap(),
            Claim::InProgress {
                lease_expires_at_ms: 5_000
            }
        );
        // Scopes are independent.
        assert_eq!(store.try_claim("other", &id).await.unwrap(), Claim::Acquired);
    }

    #[tokio::test]
    async fn completed_outcome_is_returned_to_later_claims() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(&clock);
        let id = MessageId::new("m-1");

        store.try_claim("h", &id).await.unwrap();
        store.complete("h", &id, ok(42)).await.unwrap();

        let Claim::Completed(outcome) = store.try_claim("h", &id).await.unwrap() else {
            panic!("expected completed claim");
        };
        assert_eq!(outcome.restore::<u32, _>(&MsgPackSerializer).unwrap(), 42);
    }

    #[tokio::test]
    async fn completion_is_write_once() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(&clock);
        let id = MessageId::new("m-1");

        store.try_claim("h", &id).await.unwrap();
        store.complete("h", &id, ok(1)).await.unwrap();
        let kept = store.complete("h", &id, ok(2)).await.unwrap();
        assert_eq!(kept, ok(1));
    }

    #[tokio::test]
    async fn lapsed_lease_can_be_taken_over() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(&clock);
        let id = MessageId::new("m-1");

        store.try_claim("h", &id).await.unwrap();
        clock.advance(Duration::from_secs(6));
        assert_eq!(store.try_claim("h", &id).await.unwrap(), Claim::Acquired);
    }

    #[tokio::test]
    async fn release_frees_claim_immediately() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(&clock);
        let id = MessageId::new("m-1");

        store.try_claim("h", &id).await.unwrap();
        store.release("h", &id).await.unwrap();
        assert_eq!(store.try_claim("h", &id).await.unwrap(), Claim::Acquired);
    }

    #[tokio::test]
    async fn record_expires_after_ttl() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(&clock);
        let id = MessageId::new("m-1");

        store.try_claim("h", &id).await.unwrap();
        store.complete("h", &id, ok(7)).await.unwrap();
        clock.advance(Duration::from_secs(61));

        assert!(store.lookup("h", &id).await.unwrap().is_none());
        assert_eq!(store.try_claim("h", &id).await.unwrap(), Claim::Acquired);
    }

    #[tokio::test]
    async fn failures_are_cached_too() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(&clock);
        let id = MessageId::new("m-1");

        let failed = StoredOutcome::capture(
            &Err::<u32, _>(MediatorError::Validation("card declined".into())),
            &MsgPackSerializer,
        )
        .unwrap();
        store.try_claim("h", &id).await.unwrap();
        store.complete("h", &id, failed).await.unwrap();

        let record = store.lookup("h", &id).await.unwrap().unwrap();
        assert!(record.is_completed());
        assert!(record.processed_at_ms.is_some());
        let err = record.outcome().unwrap().restore::<u32, _>(&MsgPackSerializer).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
