//! Bounded in-process memory tier.
//!
//! A fixed-capacity map with per-entry TTL and FIFO eviction. Reads never
//! refresh an entry's TTL or its position in the eviction order.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use metrics::counter;
use tokio::time::Instant;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::memory";

const METRIC_MEMORY_HIT: &str = "vellum_cache_memory_hit_total";
const METRIC_MEMORY_MISS: &str = "vellum_cache_memory_miss_total";
const METRIC_MEMORY_EVICT: &str = "vellum_cache_memory_evict_total";
const METRIC_MEMORY_EXPIRED: &str = "vellum_cache_memory_expired_total";

// About thirty years.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// `now + ttl`, saturating to a far-future instant instead of overflowing.
pub(crate) fn expiry_after(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// A stored value and the instant after which it must not be served.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired_at(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

struct Slot<V> {
    seq: u64,
    entry: CacheEntry<V>,
}

struct State<V> {
    entries: HashMap<String, Slot<V>>,
    // Insertion sequence -> key; the first entry is the oldest insertion.
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl<V> State<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
        }
    }

    fn remove(&mut self, key: &str) -> Option<Slot<V>> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.seq);
        Some(slot)
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, slot)| slot.entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let (_, key) = self.order.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }
}

/// Fixed-capacity key/value cache with TTL and FIFO eviction.
///
/// All operations run under one mutex so "sweep, check capacity, evict,
/// insert" is atomic with respect to concurrent writers.
pub struct BoundedTtlCache<V> {
    capacity: NonZeroUsize,
    state: Mutex<State<V>>,
}

impl<V: Clone> BoundedTtlCache<V> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            state: Mutex::new(State::new()),
        }
    }

    /// Store `value` under `key` for `ttl`.
    ///
    /// Expired entries are swept first. If the cache is still full, the
    /// earliest inserted entry is evicted. Overwriting a key replaces its
    /// entry and moves it to the back of the eviction order.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let now = Instant::now();
        let entry = CacheEntry {
            value,
            expires_at: expiry_after(now, ttl),
        };

        let mut state = mutex_lock(&self.state, SOURCE, "set");
        let expired = state.sweep(now);
        if expired > 0 {
            counter!(METRIC_MEMORY_EXPIRED).increment(expired as u64);
        }

        state.remove(&key);
        if state.entries.len() >= self.capacity.get()
            && let Some(evicted) = state.evict_oldest()
        {
            counter!(METRIC_MEMORY_EVICT).increment(1);
            tracing::debug!(cache = "memory", key = %evicted, "evicted oldest entry");
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.order.insert(seq, key.clone());
        state.entries.insert(key, Slot { seq, entry });
    }

    /// Return the live value for `key`, removing it if it has expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, SOURCE, "get");

        match state.entries.get(key) {
            None => {
                counter!(METRIC_MEMORY_MISS).increment(1);
                return None;
            }
            Some(slot) if !slot.entry.is_expired_at(now) => {
                counter!(METRIC_MEMORY_HIT).increment(1);
                return Some(slot.entry.value.clone());
            }
            Some(_) => {}
        }

        // Same lock as `set`, so this cannot remove a fresher concurrent write.
        state.remove(key);
        counter!(METRIC_MEMORY_EXPIRED).increment(1);
        counter!(METRIC_MEMORY_MISS).increment(1);
        None
    }

    pub fn delete(&self, key: &str) {
        mutex_lock(&self.state, SOURCE, "delete").remove(key);
    }

    pub fn clear(&self) {
        let mut state = mutex_lock(&self.state, SOURCE, "clear");
        state.entries.clear();
        state.order.clear();
    }

    /// Whether `key` holds a live entry. Never removes or refreshes anything.
    pub fn peek_live(&self, key: &str) -> bool {
        let now = Instant::now();
        mutex_lock(&self.state, SOURCE, "peek_live")
            .entries
            .get(key)
            .is_some_and(|slot| !slot.entry.is_expired_at(now))
    }

    /// Live keys in insertion order. Never removes or refreshes anything.
    pub fn live_keys(&self) -> Vec<String> {
        let now = Instant::now();
        let state = mutex_lock(&self.state, SOURCE, "live_keys");
        state
            .order
            .values()
            .filter(|key| {
                state
                    .entries
                    .get(key.as_str())
                    .is_some_and(|slot| !slot.entry.is_expired_at(now))
            })
            .cloned()
            .collect()
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::Arc;

    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn cache(capacity: usize) -> BoundedTtlCache<u32> {
        BoundedTtlCache::new(NonZeroUsize::new(capacity).expect("non-zero capacity"))
    }

    #[test]
    fn roundtrip_returns_stored_value() {
        let cache = cache(4);
        cache.set("a", 1, TTL);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn oversized_ttl_saturates_instead_of_panicking() {
        let cache = cache(2);
        cache.set("forever", 1, Duration::from_secs(u64::MAX));
        cache.set("max", 2, Duration::MAX);
        assert_eq!(cache.get("forever"), Some(1));
        assert_eq!(cache.get("max"), Some(2));
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let cache = cache(3);
        for i in 0..50 {
            cache.set(format!("key-{i}"), i, TTL);
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn eviction_is_fifo_regardless_of_reads() {
        let cache = cache(2);
        cache.set("a", 1, TTL);
        cache.set("b", 2, TTL);

        for _ in 0..5 {
            assert_eq!(cache.get("a"), Some(1));
            assert_eq!(cache.get("b"), Some(2));
        }

        cache.set("c", 3, TTL);

        assert_eq!(cache.get("a"), None); // Evicted despite being read
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn overwrite_does_not_evict_and_moves_to_back() {
        let cache = cache(2);
        cache.set("a", 1, TTL);
        cache.set("b", 2, TTL);
        cache.set("a", 10, TTL);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(10));

        cache.set("c", 3, TTL);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(10));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn delete_and_clear() {
        let cache = cache(4);
        cache.set("a", 1, TTL);
        cache.set("b", 2, TTL);

        cache.delete("a");
        cache.delete("never-stored");
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get("b"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_stays_absent() {
        let cache = cache(4);
        cache.set("a", 1, Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("a"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn set_sweeps_expired_entries_before_evicting() {
        let cache = cache(2);
        cache.set("short", 1, Duration::from_secs(1));
        cache.set("long", 2, Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(2)).await;
        cache.set("new", 3, TTL);

        // The expired entry made room; nothing live was evicted.
        assert_eq!(cache.get("long"), Some(2));
        assert_eq!(cache.get("new"), Some(3));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn inspection_does_not_remove_expired_entries() {
        let cache = cache(4);
        cache.set("a", 1, Duration::from_secs(1));
        cache.set("b", 2, TTL);

        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(!cache.peek_live("a"));
        assert!(cache.peek_live("b"));
        assert_eq!(cache.live_keys(), vec!["b".to_string()]);
        // Still stored until a read or a sweep removes it.
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn concurrent_writers_respect_capacity() {
        let cache = Arc::new(cache(8));

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let cache = Arc::clone(&cache);
                scope.spawn(move || {
                    for i in 0..200 {
                        cache.set(format!("w{worker}-{i}"), i, TTL);
                        assert!(cache.len() <= 8);
                    }
                });
            }
        });

        assert_eq!(cache.len(), 8);
    }

    #[test]
    fn recovers_from_poisoned_lock() {
        let cache = cache(2);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = cache.state.lock().expect("state lock should be acquired");
            panic!("poison memory cache lock");
        }));

        cache.set("a", 1, TTL);
        assert_eq!(cache.get("a"), Some(1));
    }
}
