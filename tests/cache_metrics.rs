use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use metrics_util::debugging::DebuggingRecorder;
use serde_json::{Value, json};
use vellum::cache::{
    BoundedTtlCache, CacheConfig, CacheKey, DurableStore, FetchError, InMemoryDurableStore,
    OperationId, Tag,
};
use vellum::content::ContentSource;
use vellum::infra::cache::ContentCache;

struct EmptySource;

#[async_trait]
impl ContentSource for EmptySource {
    async fn query(&self, _operation: OperationId, _args: Value) -> Result<Value, FetchError> {
        Ok(Value::Array(Vec::new()))
    }
}

#[tokio::test(start_paused = true)]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    // Memory tier: miss, hit, expiry, eviction.
    let memory: BoundedTtlCache<Value> = BoundedTtlCache::new(NonZeroUsize::MIN);
    assert_eq!(memory.get("a"), None);
    memory.set("a", json!(1), Duration::from_secs(1));
    assert_eq!(memory.get("a"), Some(json!(1)));
    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(memory.get("a"), None);
    memory.set("b", json!(2), Duration::from_secs(60));
    memory.set("c", json!(3), Duration::from_secs(60));

    // Durable tier: miss, hit, eviction.
    let store = InMemoryDurableStore::new(NonZeroUsize::MIN);
    let tags = [Tag::from_static("posts")];
    let first = CacheKey::derive("posts.get_all", &json!({}));
    let second = CacheKey::derive("posts.get_all", &json!({"limit": 1}));
    for key in [&first, &first, &second] {
        store
            .get_or_compute(
                key,
                async { Ok::<_, FetchError>(json!([])) }.boxed(),
                &tags,
                Duration::from_secs(60),
            )
            .await
            .expect("store read");
    }

    // Fetch latency, invalidation, and warming through the full stack.
    let cache = ContentCache::in_process(&CacheConfig::default(), Arc::new(EmptySource));
    let report = cache.manager().warm_critical_caches().await;
    assert!(report.failed.is_empty());
    cache.manager().invalidate("posts", None).await;

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "vellum_cache_memory_hit_total",
        "vellum_cache_memory_miss_total",
        "vellum_cache_memory_evict_total",
        "vellum_cache_memory_expired_total",
        "vellum_cache_durable_hit_total",
        "vellum_cache_durable_miss_total",
        "vellum_cache_durable_evict_total",
        "vellum_cache_invalidate_total",
        "vellum_cache_fetch_ms",
        "vellum_cache_warm_ms",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
