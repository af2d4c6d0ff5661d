//! Two-tier cache of resolved routes (handlers plus their composed pipelines).
//!
//! Lookup order:
//! 1. a per-thread map, free of any cross-thread synchronization;
//! 2. a process-wide sharded map;
//! 3. the resolver, run outside any lock. Concurrent first lookups may each
//!    resolve, but only the first value stored is kept and returned to all of
//!    them. Resolvers may therefore use the cache themselves.
//!
//! [`HandlerCache::clear`] bumps a generation counter; per-thread entries from
//! an older generation are ignored and overwritten on next use.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

type Shared = Arc<dyn Any + Send + Sync>;

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static LOCAL: RefCell<HashMap<(u64, TypeId), (u64, Shared)>> = RefCell::new(HashMap::new());
}

/// Hit and miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub local_hits: u64,
    pub shared_hits: u64,
    pub misses: u64,
}

/// Process-wide route cache with a per-thread front tier.
#[derive(Debug)]
pub struct HandlerCache {
    id: u64,
    generation: AtomicU64,
    shared: DashMap<TypeId, Shared>,
    local_hits: AtomicU64,
    shared_hits: AtomicU64,
    misses: AtomicU64,
}

impl HandlerCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            generation: AtomicU64::new(0),
            shared: DashMap::new(),
            local_hits: AtomicU64::new(0),
            shared_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached `T`, resolving it on first use.
    pub fn get_or_resolve<T, F>(&self, resolve: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let key = TypeId::of::<T>();
        let generation = self.generation.load(Ordering::Acquire);

        let local = LOCAL.with(|cell| {
            cell.borrow()
                .get(&(self.id, key))
                .filter(|(seen, _)| *seen == generation)
                .map(|(_, value)| Arc::clone(value))
        });
        if let Some(hit) = local.and_then(|value| value.downcast::<T>().ok()) {
            self.local_hits.fetch_add(1, Ordering::Relaxed);
            return hit;
        }

        let value = if let Some(existing) = self.shared.get(&key) {
            self.shared_hits.fetch_add(1, Ordering::Relaxed);
            Arc::clone(existing.value())
        } else {
            let candidate: Shared = Arc::new(resolve());
            match self.shared.entry(key) {
                Entry::Occupied(winner) => {
                    self.shared_hits.fetch_add(1, Ordering::Relaxed);
                    Arc::clone(winner.get())
                }
                Entry::Vacant(slot) => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    Arc::clone(slot.insert(candidate).value())
                }
            }
        };

        LOCAL.with(|cell| {
            cell.borrow_mut()
                .insert((self.id, key), (generation, Arc::clone(&value)));
        });

        // Entries under `TypeId::of::<T>()` are always `T`.
        value
            .downcast::<T>()
            .unwrap_or_else(|_| unreachable!("route cache entry stored under a foreign TypeId"))
    }

    /// Invalidates both tiers. Routes resolve again on next use.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.shared.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            local_hits: self.local_hits.load(Ordering::Relaxed),
            shared_hits: self.shared_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Default for HandlerCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HandlerCache {
    fn drop(&mut self) {
        let id = self.id;
        // Only this thread's tier is reachable; other threads' stale entries
        // are keyed by an id that is never reused.
        let _ = LOCAL.try_with(|cell| {
            if let Ok(mut map) = cell.try_borrow_mut() {
                map.retain(|(cache, _), _| *cache != id);
            }
        });
    }
}
