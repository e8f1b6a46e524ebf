//! Bounded, time-limited cache of recently seen envelope ids.
//!
//! Guarantees at-most-once handler invocation per envelope id within the
//! window: an [`LruCache`] caps the id set at `max_entries` (oldest ids
//! evicted first) and each entry carries an expiry checked on lookup, so
//! the cache never grows unbounded and duplicates stop being duplicates
//! once `ttl` has passed.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

/// Concurrency-safe dedup cache with TTL and capacity eviction.
pub struct DedupCache {
    cache: Mutex<LruCache<String, Instant>>,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Record `id` if it has not been seen within the window.
    ///
    /// Returns `true` when the id is fresh (handlers should run) and
    /// `false` when it is a duplicate.
    pub fn insert_if_fresh(&self, id: &str) -> bool {
        self.insert_if_fresh_at(id, Instant::now())
    }

    /// [`Self::insert_if_fresh`] with an explicit clock, for tests.
    pub fn insert_if_fresh_at(&self, id: &str, now: Instant) -> bool {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(expiry) = cache.get(id) {
            if *expiry > now {
                return false;
            }
        }

        // Fresh id, or an expired entry refreshed in place; `put` evicts
        // the least-recently-used id once the capacity is reached.
        cache.put(id.to_string(), now + self.ttl);
        true
    }

    /// Number of ids currently tracked (expired entries included until
    /// they are refreshed or evicted).
    pub fn len(&self) -> usize {
        match self.cache.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
