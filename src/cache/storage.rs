//! In-memory keyed store with per-entry TTL and bounded retention
//!
//! Entries carry their insertion instant and TTL. A background sweep drops
//! anything older than the retention ceiling, and the entry count is capped
//! by evicting the oldest insertion first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::debug;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::cache::CacheTtl;
use crate::clock::SharedClock;

/// A cached value with its insertion time and TTL
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub key: String,
    pub value: T,
    pub inserted_at: Instant,
    pub ttl: Duration,
    /// Insertion order; breaks ties between equal instants
    seq: u64,
}

impl<T> CacheEntry<T> {
    /// Valid iff `now - inserted_at < ttl`
    pub fn is_valid_at(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.inserted_at) < ttl
    }

    fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.inserted_at)
    }

    fn insertion_order(&self) -> (Instant, u64) {
        (self.inserted_at, self.seq)
    }
}

/// Limits applied to a cache instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    /// TTL used by `set` when none is given
    pub default_ttl: Duration,
    /// Hard ceiling; entries older than this are swept regardless of TTL
    pub retention: Duration,
    /// Maximum entry count before oldest-first eviction
    pub max_entries: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            default_ttl: CacheTtl::DEFAULT,
            retention: CacheTtl::RETENTION_CEILING,
            max_entries: 500,
        }
    }
}

/// Hit/miss/eviction counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Statistics about a clear operation
#[derive(Debug)]
pub struct ClearStats {
    pub entries_removed: usize,
}

struct CacheInner<T> {
    entries: HashMap<String, CacheEntry<T>>,
    stats: CacheStats,
    next_seq: u64,
}

/// Key-value cache with TTL validity checks.
///
/// All operations take `&self`; the map sits behind a `Mutex` that is never
/// held across an await point.
pub struct AsyncCache<T> {
    inner: Mutex<CacheInner<T>>,
    limits: CacheLimits,
    clock: SharedClock,
}

impl<T: Clone> AsyncCache<T> {
    pub fn new(limits: CacheLimits, clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                stats: CacheStats::default(),
                next_seq: 0,
            }),
            limits,
            clock,
        }
    }

    pub fn limits(&self) -> &CacheLimits {
        &self.limits
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Raw entry lookup, valid or not
    pub fn get(&self, key: &str) -> Option<CacheEntry<T>> {
        self.lock().entries.get(key).cloned()
    }

    /// Check an entry against an explicit TTL
    pub fn is_valid(&self, entry: &CacheEntry<T>, ttl: Duration) -> bool {
        entry.is_valid_at(self.clock.now(), ttl)
    }

    /// Get the cached value if it is still within its TTL.
    ///
    /// A stale entry counts as a miss and is dropped.
    pub fn get_valid(&self, key: &str) -> Option<T> {
        let now = self.clock.now();
        let mut inner = self.lock();

        let fresh = match inner.entries.get(key) {
            Some(entry) if entry.is_valid_at(now, entry.ttl) => Some(entry.value.clone()),
            Some(_) => {
                inner.entries.remove(key);
                None
            }
            None => None,
        };

        match fresh {
            Some(value) => {
                inner.stats.hits += 1;
                Some(value)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Store a value with the default TTL
    pub fn set(&self, key: &str, value: T) {
        self.set_with_ttl(key, value, self.limits.default_ttl);
    }

    /// Store a value, overwriting any previous entry and its timestamp
    pub fn set_with_ttl(&self, key: &str, value: T, ttl: Duration) {
        let now = self.clock.now();
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                value,
                inserted_at: now,
                ttl,
                seq,
            },
        );
        Self::evict_overflow(&mut inner, self.limits.max_entries);
    }

    fn evict_overflow(inner: &mut CacheInner<T>, max_entries: usize) {
        while inner.entries.len() > max_entries {
            let oldest = inner
                .entries
                .values()
                .min_by_key(|e| e.insertion_order())
                .map(|e| e.key.clone());

            match oldest {
                Some(key) => {
                    debug!("Evicting oldest cache entry {}", key);
                    inner.entries.remove(&key);
                    inner.stats.evictions += 1;
                }
                None => break,
            }
        }
    }

    /// Delete a specific entry by key
    pub fn delete_by_key(&self, key: &str) -> bool {
        self.lock().entries.remove(key).is_some()
    }

    /// Delete every entry whose key matches the predicate.
    ///
    /// Used to invalidate a whole resource after a mutation, e.g. every
    /// cached "students" page for a school.
    pub fn delete_matching<F>(&self, predicate: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !predicate(key));
        before - inner.entries.len()
    }

    /// Clear all entries
    pub fn clear_all(&self) -> ClearStats {
        let mut inner = self.lock();
        let entries_removed = inner.entries.len();
        inner.entries.clear();
        ClearStats { entries_removed }
    }

    /// Remove entries past the retention ceiling, regardless of their TTL
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let retention = self.limits.retention;
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.age_at(now) < retention);
        let removed = before - inner.entries.len();
        inner.stats.evictions += removed as u64;
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.entries.len(),
            ..inner.stats
        }
    }
}

/// Background sweep task; aborted when the handle is dropped
#[derive(Debug)]
pub struct SweeperHandle(JoinHandle<()>);

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run `sweep` on a fixed interval for as long as the cache is alive
pub fn spawn_sweeper<T>(cache: &Arc<AsyncCache<T>>, interval: Duration) -> SweeperHandle
where
    T: Clone + Send + 'static,
{
    let weak: Weak<AsyncCache<T>> = Arc::downgrade(cache);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(cache) = weak.upgrade() else {
                break;
            };
            let removed = cache.sweep();
            if removed > 0 {
                debug!("Cache sweep removed {} entries", removed);
            }
        }
    });
    SweeperHandle(handle)
}
