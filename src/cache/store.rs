//! In-process durable store.
//!
//! Stands in for a shared platform cache: an LRU of keyed entries plus a
//! generation counter per tag. Invalidating a tag bumps its generation; an
//! entry is live only while every tag it was stored with is still at the
//! generation observed when its computation started.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use metrics::counter;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use super::durable::{ComputeFuture, DurableStore};
use super::error::CacheError;
use super::keys::{CacheKey, Tag};
use super::lock::mutex_lock;
use super::memory::expiry_after;

const SOURCE: &str = "cache::store";

const METRIC_DURABLE_HIT: &str = "vellum_cache_durable_hit_total";
const METRIC_DURABLE_MISS: &str = "vellum_cache_durable_miss_total";
const METRIC_DURABLE_EVICT: &str = "vellum_cache_durable_evict_total";

struct StoredEntry {
    value: Value,
    expires_at: Instant,
    // Generation of each tag when the computation began.
    tags: Vec<(Tag, u64)>,
}

struct Inner {
    entries: LruCache<CacheKey, StoredEntry>,
    generations: HashMap<Tag, u64>,
}

impl Inner {
    fn generation(&self, tag: &Tag) -> u64 {
        self.generations.get(tag).copied().unwrap_or(0)
    }
}

fn is_current(generations: &HashMap<Tag, u64>, tags: &[(Tag, u64)]) -> bool {
    tags.iter()
        .all(|(tag, seen)| generations.get(tag).copied().unwrap_or(0) == *seen)
}

/// LRU-bounded durable store with generation-based tag invalidation.
pub struct InMemoryDurableStore {
    inner: Mutex<Inner>,
}

impl InMemoryDurableStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                generations: HashMap::new(),
            }),
        }
    }

    /// Live value for `key`, if any. Stale entries are dropped.
    fn lookup(&self, key: &CacheKey) -> Option<Value> {
        let now = Instant::now();
        let mut inner = mutex_lock(&self.inner, SOURCE, "lookup");
        let Inner {
            entries,
            generations,
        } = &mut *inner;

        let live = match entries.get(key) {
            Some(entry) if entry.expires_at > now && is_current(generations, &entry.tags) => {
                Some(entry.value.clone())
            }
            Some(_) => None,
            None => return None,
        };
        if live.is_none() {
            entries.pop(key);
        }
        live
    }

    fn snapshot(&self, tags: &[Tag]) -> Vec<(Tag, u64)> {
        let inner = mutex_lock(&self.inner, SOURCE, "snapshot");
        tags.iter()
            .map(|tag| (tag.clone(), inner.generation(tag)))
            .collect()
    }

    fn store(&self, key: &CacheKey, value: Value, tags: Vec<(Tag, u64)>, ttl: Duration) {
        let entry = StoredEntry {
            value,
            expires_at: expiry_after(Instant::now(), ttl),
            tags,
        };
        let mut inner = mutex_lock(&self.inner, SOURCE, "store");
        if let Some((evicted, _)) = inner.entries.push(key.clone(), entry)
            && &evicted != key
        {
            counter!(METRIC_DURABLE_EVICT).increment(1);
            debug!(cache = "durable", key = %evicted, "evicted least recently used entry");
        }
    }

    /// Number of stored entries, including stale ones not yet dropped.
    pub fn len(&self) -> usize {
        mutex_lock(&self.inner, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry. Tag generations survive so a computation that began
    /// before an earlier invalidation still lands stale.
    pub fn clear(&self) {
        mutex_lock(&self.inner, SOURCE, "clear").entries.clear();
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn get_or_compute<'a>(
        &'a self,
        key: &'a CacheKey,
        compute: ComputeFuture<'a>,
        tags: &'a [Tag],
        ttl: Duration,
    ) -> Result<Value, CacheError> {
        if let Some(value) = self.lookup(key) {
            counter!(METRIC_DURABLE_HIT).increment(1);
            return Ok(value);
        }
        counter!(METRIC_DURABLE_MISS).increment(1);

        // Taken before computing: an invalidation that lands mid-fetch leaves
        // the stored result already stale.
        let snapshot = self.snapshot(tags);
        let value = compute.await?;
        self.store(key, value.clone(), snapshot, ttl);
        Ok(value)
    }

    async fn invalidate_tag(&self, tag: &Tag) -> Result<(), CacheError> {
        let mut inner = mutex_lock(&self.inner, SOURCE, "invalidate_tag");
        *inner.generations.entry(tag.clone()).or_insert(0) += 1;
        debug!(cache = "durable", tag = %tag, "tag invalidated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::cache::error::FetchError;

    const TTL: Duration = Duration::from_secs(60);

    fn store(capacity: usize) -> InMemoryDurableStore {
        InMemoryDurableStore::new(NonZeroUsize::new(capacity).expect("non-zero capacity"))
    }

    async fn put(store: &InMemoryDurableStore, key: &CacheKey, value: Value, tags: &[Tag]) -> Value {
        store
            .get_or_compute(key, Box::pin(async move { Ok::<_, FetchError>(value) }), tags, TTL)
            .await
            .expect("compute succeeds")
    }

    #[tokio::test]
    async fn hit_skips_compute() {
        let store = store(4);
        let key = CacheKey::derive("op", &json!({}));
        put(&store, &key, json!(1), &[Tag::from("posts")]).await;

        let value = store
            .get_or_compute(
                &key,
                Box::pin(async {
                    Err::<Value, _>(FetchError::other("compute must not run on a hit"))
                }),
                &[Tag::from("posts")],
                TTL,
            )
            .await
            .expect("hit");
        assert_eq!(value, json!(1));
    }

    #[tokio::test]
    async fn invalidation_only_affects_matching_tags() {
        let store = store(4);
        let posts = CacheKey::derive("posts", &json!({}));
        let globals = CacheKey::derive("globals", &json!({}));
        put(&store, &posts, json!("p1"), &[Tag::from("posts")]).await;
        put(&store, &globals, json!("g1"), &[Tag::from("globals")]).await;

        store
            .invalidate_tag(&Tag::from("posts"))
            .await
            .expect("invalidate");

        assert_eq!(put(&store, &posts, json!("p2"), &[Tag::from("posts")]).await, json!("p2"));
        assert_eq!(
            put(&store, &globals, json!("g2"), &[Tag::from("globals")]).await,
            json!("g1")
        );
    }

    #[tokio::test]
    async fn entry_is_stale_if_any_tag_was_invalidated() {
        let store = store(4);
        let key = CacheKey::derive("bundle", &json!({}));
        let tags = [Tag::from("posts"), Tag::from("pages")];
        put(&store, &key, json!("old"), &tags).await;

        store
            .invalidate_tag(&Tag::from("pages"))
            .await
            .expect("invalidate");

        assert_eq!(put(&store, &key, json!("new"), &tags).await, json!("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_recomputed() {
        let store = store(4);
        let key = CacheKey::derive("op", &json!({}));
        put(&store, &key, json!("old"), &[]).await;

        tokio::time::advance(TTL + Duration::from_secs(1)).await;

        assert_eq!(put(&store, &key, json!("new"), &[]).await, json!("new"));
    }

    #[tokio::test]
    async fn clear_keeps_invalidations_of_in_flight_computes() {
        let store = store(4);
        let key = CacheKey::derive("op", &json!({}));
        let tags = [Tag::from("posts")];
        let started = Notify::new();
        let release = Notify::new();

        let in_flight = store.get_or_compute(
            &key,
            Box::pin(async {
                started.notify_one();
                release.notified().await;
                Ok::<_, FetchError>(json!("old"))
            }),
            &tags,
            TTL,
        );
        let writer = async {
            started.notified().await;
            store.invalidate_tag(&tags[0]).await.expect("invalidate");
            store.clear();
            release.notify_one();
        };
        let (old, ()) = tokio::join!(in_flight, writer);

        assert_eq!(old.expect("in-flight compute"), json!("old"));
        assert_eq!(put(&store, &key, json!("new"), &tags).await, json!("new"));
    }

    #[tokio::test]
    async fn oversized_ttl_saturates_instead_of_panicking() {
        let store = store(2);
        let key = CacheKey::derive("op", &json!({}));
        let value = store
            .get_or_compute(
                &key,
                Box::pin(async { Ok::<_, FetchError>(json!(1)) }),
                &[],
                Duration::MAX,
            )
            .await
            .expect("stored");

        assert_eq!(value, json!(1));
        assert_eq!(put(&store, &key, json!(2), &[]).await, json!(1));
    }

    #[tokio::test]
    async fn least_recently_used_entry_is_evicted() {
        let store = store(2);
        let a = CacheKey::derive("a", &json!({}));
        let b = CacheKey::derive("b", &json!({}));
        let c = CacheKey::derive("c", &json!({}));
        put(&store, &a, json!("a"), &[]).await;
        put(&store, &b, json!("b"), &[]).await;
        put(&store, &a, json!("ignored"), &[]).await; // touch a
        put(&store, &c, json!("c"), &[]).await;

        assert_eq!(store.len(), 2);
        assert_eq!(put(&store, &a, json!("a2"), &[]).await, json!("a"));
        assert_eq!(put(&store, &b, json!("b2"), &[]).await, json!("b2"));
    }

    #[tokio::test]
    async fn recovers_from_poisoned_lock() {
        let store = store(2);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store.inner.lock().expect("store lock should be acquired");
            panic!("poison durable store lock");
        }));

        let key = CacheKey::derive("op", &json!({}));
        assert_eq!(put(&store, &key, json!(1), &[]).await, json!(1));
    }
}
