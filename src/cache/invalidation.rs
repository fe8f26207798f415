//! Invalidation, warming, and inspection across both tiers.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use metrics::{counter, histogram};
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{info, instrument, warn};

use super::hot::{HotQueries, HotQuery};
use super::keys::EntityType;

const METRIC_INVALIDATE: &str = "vellum_cache_invalidate_total";
const METRIC_WARM_MS: &str = "vellum_cache_warm_ms";

/// Outcome of a warm pass, by memory key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarmReport {
    pub warmed: Vec<String>,
    pub failed: Vec<String>,
}

/// Snapshot of the memory-key namespace.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub known_keys: Vec<String>,
    pub active_keys: Vec<String>,
    pub active_count: usize,
    /// RFC 3339, UTC.
    pub timestamp: String,
}

fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_default()
}

/// Keeps the durable and memory tiers consistent with content mutations.
pub struct CacheInvalidationManager {
    hot: Arc<HotQueries>,
}

impl CacheInvalidationManager {
    pub fn new(hot: Arc<HotQueries>) -> Self {
        Self { hot }
    }

    pub fn hot(&self) -> &Arc<HotQueries> {
        &self.hot
    }

    /// Invalidate everything derived from the named entity type.
    ///
    /// Unknown names are logged and ignored. Never fails.
    pub async fn invalidate(&self, entity: &str, id: Option<&str>) {
        match entity.parse::<EntityType>() {
            Ok(entity) => self.invalidate_entity(entity, id).await,
            Err(_) => {
                warn!(entity, "invalidation requested for unknown entity type");
            }
        }
    }

    /// Drop the entity's durable tags (plus the record tag when `id` is given),
    /// then the memory keys derived from it. Store failures are logged.
    #[instrument(skip(self), fields(entity = %entity))]
    pub async fn invalidate_entity(&self, entity: EntityType, id: Option<&str>) {
        let registry = self.hot.registry();
        for tag in registry.invalidation_tags(entity, id) {
            if let Err(err) = registry.store().invalidate_tag(&tag).await {
                warn!(tag = %tag, error = %err, "durable tag invalidation failed");
            }
        }

        let memory_keys = self.hot.invalidate_memory(entity);

        counter!(METRIC_INVALIDATE, "entity" => entity.as_str()).increment(1);
        info!(
            id = id.unwrap_or_default(),
            memory_keys,
            "cache invalidated"
        );
    }

    /// Run every critical hot query concurrently. Individual failures are
    /// logged and reported, never raised.
    #[instrument(skip(self))]
    pub async fn warm_critical_caches(&self) -> WarmReport {
        let started_at = Instant::now();

        let outcomes = join_all(HotQuery::CRITICAL.into_iter().map(|query| async move {
            (query.memory_key(), self.hot.get(query).await)
        }))
        .await;

        let mut report = WarmReport::default();
        for (key, outcome) in outcomes {
            match outcome {
                Ok(_) => report.warmed.push(key),
                Err(err) => {
                    warn!(key = %key, error = %err, "cache warm failed");
                    report.failed.push(key);
                }
            }
        }

        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_WARM_MS).record(elapsed_ms);
        info!(
            warmed = report.warmed.len(),
            failed = report.failed.len(),
            elapsed_ms,
            "critical caches warmed"
        );
        report
    }

    /// Delete every key in the memory namespace. The durable tier is untouched.
    pub fn clear_all_memory_caches(&self) {
        let memory = self.hot.memory();
        for key in self.hot.namespace().known_keys() {
            memory.delete(key);
        }
        info!("memory caches cleared");
    }

    /// Read-only view of which namespace keys hold live entries.
    pub fn get_cache_stats(&self) -> CacheStats {
        let memory = self.hot.memory();
        let known_keys = self.hot.namespace().known_keys().to_vec();
        let active_keys: Vec<String> = known_keys
            .iter()
            .filter(|key| memory.peek_live(key))
            .cloned()
            .collect();

        CacheStats {
            active_count: active_keys.len(),
            known_keys,
            active_keys,
            timestamp: format_timestamp(OffsetDateTime::now_utc()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::{Value, json};
    use tokio::sync::Notify;

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::durable::Fetcher;
    use crate::cache::error::FetchError;
    use crate::cache::keys::{OperationId, OperationKind};
    use crate::cache::memory::BoundedTtlCache;
    use crate::cache::registry::QueryCacheRegistry;
    use crate::cache::retention::RetentionPolicy;
    use crate::cache::store::InMemoryDurableStore;
    use crate::content::stub::StubSource;

    fn manager(source: Arc<StubSource>) -> CacheInvalidationManager {
        let config = CacheConfig::default();
        let store = Arc::new(InMemoryDurableStore::new(config.durable_capacity_non_zero()));
        let registry = Arc::new(QueryCacheRegistry::from_source(
            source,
            store,
            RetentionPolicy::new(config.retention_ladder()),
        ));
        let memory = Arc::new(BoundedTtlCache::new(config.memory_capacity_non_zero()));
        CacheInvalidationManager::new(Arc::new(HotQueries::new(registry, memory, &config)))
    }

    #[tokio::test]
    async fn posts_invalidation_keeps_unrelated_keys() {
        let manager = manager(Arc::new(StubSource::echo()));
        let memory = manager.hot().memory();
        for key in ["popular-posts", "recent-posts-5", "homepage-bundle", "global-settings"] {
            memory.set(key, json!(key), Duration::from_secs(60));
        }

        manager.invalidate("posts", None).await;

        assert_eq!(memory.get("popular-posts"), None);
        assert_eq!(memory.get("recent-posts-5"), None);
        assert_eq!(memory.get("homepage-bundle"), None);
        assert_eq!(memory.get("global-settings"), Some(json!("global-settings")));
    }

    #[tokio::test]
    async fn unknown_entity_is_a_no_op() {
        let manager = manager(Arc::new(StubSource::echo()));
        let memory = manager.hot().memory();
        memory.set("global-settings", json!(1), Duration::from_secs(60));
        memory.set("homepage-bundle", json!(2), Duration::from_secs(60));

        manager.invalidate("widgets", None).await;

        assert_eq!(memory.len(), 2);
    }

    #[tokio::test]
    async fn invalidation_forces_durable_refetch() {
        let source = Arc::new(StubSource::echo());
        let manager = manager(Arc::clone(&source));
        let globals = OperationId::new(EntityType::Globals, OperationKind::Get);

        manager.hot().global_settings().await.expect("first");
        manager.hot().global_settings().await.expect("cached");
        assert_eq!(source.call_count(globals), 1);

        manager.invalidate("globals", None).await;
        manager.hot().global_settings().await.expect("refetch");
        assert_eq!(source.call_count(globals), 2);
    }

    #[tokio::test]
    async fn load_overlapping_invalidation_does_not_repopulate_memory() {
        let config = CacheConfig::default();
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher: Arc<dyn Fetcher> = {
            let (started, release, calls) =
                (Arc::clone(&started), Arc::clone(&release), Arc::clone(&calls));
            Arc::new(move |_args: Value| {
                let (started, release, calls) =
                    (Arc::clone(&started), Arc::clone(&release), Arc::clone(&calls));
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        started.notify_one();
                        release.notified().await;
                        Ok::<_, FetchError>(json!("old"))
                    } else {
                        Ok(json!("new"))
                    }
                }
            })
        };
        let store = Arc::new(InMemoryDurableStore::new(config.durable_capacity_non_zero()));
        let registry = Arc::new(
            QueryCacheRegistry::builder(store, RetentionPolicy::new(config.retention_ladder()))
                .register(OperationId::new(EntityType::Globals, OperationKind::Get), fetcher)
                .build(),
        );
        let memory = Arc::new(BoundedTtlCache::new(config.memory_capacity_non_zero()));
        let manager =
            CacheInvalidationManager::new(Arc::new(HotQueries::new(registry, memory, &config)));

        let in_flight = {
            let hot = Arc::clone(manager.hot());
            tokio::spawn(async move { hot.global_settings().await })
        };
        started.notified().await;
        manager.invalidate("globals", None).await;
        release.notify_one();

        let before = in_flight.await.expect("join").expect("in-flight read");
        assert_eq!(before, json!("old"));
        assert!(!manager.hot().memory().peek_live("global-settings"));

        let after = manager.hot().global_settings().await.expect("read after invalidation");
        assert_eq!(after, json!("new"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn warm_reports_each_critical_path() {
        let manager = manager(Arc::new(StubSource::echo()));

        let report = manager.warm_critical_caches().await;

        assert!(report.failed.is_empty());
        assert_eq!(
            report.warmed,
            vec![
                "global-settings",
                "site-navigation",
                "popular-posts-5",
                "homepage-bundle",
                "published-forms",
                "recent-posts-10",
            ]
        );
        assert_eq!(manager.get_cache_stats().active_count, 6);
    }

    #[tokio::test]
    async fn warm_survives_a_failing_path() {
        let source = Arc::new(StubSource::new(|operation, _| {
            if operation.entity == EntityType::Forms {
                Err(FetchError::other("forms down"))
            } else {
                Ok(Value::Array(Vec::new()))
            }
        }));
        let manager = manager(source);

        let report = manager.warm_critical_caches().await;

        assert_eq!(report.failed, vec!["published-forms"]);
        assert_eq!(report.warmed.len(), 5);
        let memory = manager.hot().memory();
        assert!(memory.peek_live("global-settings"));
        assert!(memory.peek_live("recent-posts-10"));
        assert!(!memory.peek_live("published-forms"));
    }

    #[tokio::test]
    async fn clear_removes_namespace_keys_only() {
        let manager = manager(Arc::new(StubSource::echo()));
        let memory = manager.hot().memory();
        memory.set("popular-posts-17", json!(1), Duration::from_secs(60));
        memory.set("site-navigation", json!(2), Duration::from_secs(60));
        memory.set("someone-else", json!(3), Duration::from_secs(60));

        manager.clear_all_memory_caches();

        assert_eq!(memory.live_keys(), vec!["someone-else".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_are_read_only() {
        let manager = manager(Arc::new(StubSource::echo()));
        let memory = manager.hot().memory();
        memory.set("global-settings", json!(1), Duration::from_secs(1));
        memory.set("site-navigation", json!(2), Duration::from_secs(600));

        tokio::time::advance(Duration::from_secs(5)).await;

        let stats = manager.get_cache_stats();
        assert_eq!(stats.active_keys, vec!["site-navigation".to_string()]);
        assert_eq!(stats.active_count, 1);
        assert_eq!(stats.known_keys.len(), 46);
        // The expired entry is still stored.
        assert_eq!(memory.len(), 2);
    }

    #[test]
    fn timestamps_are_rfc3339_utc() {
        let at = time::macros::datetime!(2024-05-01 12:30:00 UTC);
        assert_eq!(format_timestamp(at), "2024-05-01T12:30:00Z");
    }

    #[test]
    fn stats_serialize_flat() {
        let manager = manager(Arc::new(StubSource::echo()));
        let value = serde_json::to_value(manager.get_cache_stats()).expect("serialize");
        assert_eq!(value["active_count"], json!(0));
        assert_eq!(value["active_keys"], json!([]));
        assert!(value["timestamp"].as_str().is_some_and(|ts| ts.ends_with('Z')));
    }
}
