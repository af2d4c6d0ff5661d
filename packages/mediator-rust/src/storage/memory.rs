//! In-memory [`KeyValueBackend`] backed by [`DashMap`].
//!
//! Conditional writes run under the key's shard lock, which makes
//! `set_if_absent` and `compare_and_swap` atomic per key. Expired entries
//! are invisible immediately and physically removed on access or by
//! [`KeyValueBackend::purge_expired`].

use std::time::Duration;

use async_trait::async_trait;
use courier_core::clock::system_clock;
use courier_core::{BackendError, KeyValueBackend, SharedClock};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Debug, Clone)]
struct Slot {
    value: Vec<u8>,
    expires_at_ms: Option<u64>,
}

impl Slot {
    fn live(&self, now_ms: u64) -> bool {
        !matches!(self.expires_at_ms, Some(at) if now_ms >= at)
    }
}

/// Process-local storage. Suitable for tests, single-node deployments and
/// as the reference for backend implementors.
pub struct InMemoryBackend {
    entries: DashMap<String, Slot>,
    clock: SharedClock,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Uses `clock` for expiry decisions.
    #[must_use]
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Stored entries, expired ones included until purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn slot(&self, value: Vec<u8>, ttl: Option<Duration>, now_ms: u64) -> Slot {
        Slot {
            value,
            expires_at_ms: ttl.map(|ttl| {
                now_ms.saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
            }),
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl KeyValueBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let now = self.clock.now();
        if let Some(slot) = self.entries.get(key) {
            if slot.live(now) {
                return Ok(Some(slot.value.clone()));
            }
        } else {
            return Ok(None);
        }
        self.entries.remove_if(key, |_, slot| !slot.live(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), BackendError> {
        let slot = self.slot(value, ttl, self.clock.now());
        self.entries.insert(key.to_string(), slot);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, BackendError> {
        let now = self.clock.now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().live(now) {
                    return Ok(false);
                }
                occupied.insert(self.slot(value, ttl, now));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.slot(value, ttl, now));
                Ok(true)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, BackendError> {
        let now = self.clock.now();
        let Some(mut slot) = self.entries.get_mut(key) else {
            return Ok(false);
        };
        if !slot.live(now) || slot.value != expected {
            return Ok(false);
        }
        *slot = self.slot(value, ttl, now);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, slot)| slot.live(now)))
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        let now = self.clock.now();
        Ok(self.entries.get(key).is_some_and(|slot| slot.live(now)))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().live(now))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn purge_expired(&self) -> Result<usize, BackendError> {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| slot.live(now));
        Ok(before.saturating_sub(self.entries.len()))
    }
}
