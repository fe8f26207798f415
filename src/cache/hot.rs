//! Hot query paths.
//!
//! A handful of read paths that nearly every page render needs are served
//! from the memory tier under fixed keys. A memory miss always falls through
//! to the durable tier, never straight to the upstream source.
//!
//! Each hot key declares the entity types it is derived from; that table is
//! the only source for "which memory keys does a change to X drop".

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tracing::{debug, instrument};

use super::config::CacheConfig;
use super::error::CacheError;
use super::keys::{EntityType, OperationKind};
use super::lock::mutex_lock;
use super::memory::BoundedTtlCache;
use super::registry::QueryCacheRegistry;
use super::retention::RetentionTier;

const SOURCE: &str = "cache::hot";

const POPULAR_POSTS: &str = "popular-posts";
const RECENT_POSTS: &str = "recent-posts";
const SITE_NAVIGATION: &str = "site-navigation";
const GLOBAL_SETTINGS: &str = "global-settings";
const HOMEPAGE_BUNDLE: &str = "homepage-bundle";
const PUBLISHED_FORMS: &str = "published-forms";

const HOMEPAGE_POST_LIMIT: u32 = 5;
const HOME_SLUGS: [&str; 2] = ["home", "/"];

struct HotKey {
    base: &'static str,
    /// Stored as `<base>-<limit>`.
    limited: bool,
    tier: RetentionTier,
    depends_on: &'static [EntityType],
}

const HOT_KEYS: [HotKey; 6] = [
    HotKey {
        base: POPULAR_POSTS,
        limited: true,
        tier: RetentionTier::Medium,
        depends_on: &[EntityType::Posts],
    },
    HotKey {
        base: RECENT_POSTS,
        limited: true,
        tier: RetentionTier::Medium,
        depends_on: &[EntityType::Posts],
    },
    HotKey {
        base: SITE_NAVIGATION,
        limited: false,
        tier: RetentionTier::VeryLong,
        depends_on: &[EntityType::Navigation],
    },
    HotKey {
        base: GLOBAL_SETTINGS,
        limited: false,
        tier: RetentionTier::VeryLong,
        depends_on: &[EntityType::Globals],
    },
    HotKey {
        base: HOMEPAGE_BUNDLE,
        limited: false,
        tier: RetentionTier::Long,
        depends_on: &[
            EntityType::Posts,
            EntityType::Pages,
            EntityType::Navigation,
            EntityType::Globals,
        ],
    },
    HotKey {
        base: PUBLISHED_FORMS,
        limited: false,
        tier: RetentionTier::Long,
        depends_on: &[EntityType::Forms],
    },
];

/// A hot read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotQuery {
    /// Published posts, newest first.
    PopularPosts { limit: u32 },
    /// Published posts by publish date, summary fields only.
    RecentPosts { limit: u32 },
    SiteNavigation,
    GlobalSettings,
    /// Globals, navigation, recent posts, and the home page in one payload.
    HomepageBundle,
    PublishedForms,
}

impl HotQuery {
    pub const DEFAULT_POPULAR_LIMIT: u32 = 10;
    pub const DEFAULT_RECENT_LIMIT: u32 = 5;

    /// Paths warmed at startup and on demand.
    pub const CRITICAL: [HotQuery; 6] = [
        HotQuery::GlobalSettings,
        HotQuery::SiteNavigation,
        HotQuery::PopularPosts { limit: 5 },
        HotQuery::HomepageBundle,
        HotQuery::PublishedForms,
        HotQuery::RecentPosts { limit: 10 },
    ];

    fn entry(&self) -> &'static HotKey {
        let index = match self {
            HotQuery::PopularPosts { .. } => 0,
            HotQuery::RecentPosts { .. } => 1,
            HotQuery::SiteNavigation => 2,
            HotQuery::GlobalSettings => 3,
            HotQuery::HomepageBundle => 4,
            HotQuery::PublishedForms => 5,
        };
        &HOT_KEYS[index]
    }

    /// Memory key this query is stored under.
    pub fn memory_key(&self) -> String {
        match self {
            HotQuery::PopularPosts { limit } | HotQuery::RecentPosts { limit } => {
                format!("{}-{limit}", self.entry().base)
            }
            _ => self.entry().base.to_string(),
        }
    }

    pub fn tier(&self) -> RetentionTier {
        self.entry().tier
    }

    pub fn depends_on(&self) -> &'static [EntityType] {
        self.entry().depends_on
    }
}

/// Every memory key the hot paths can produce, indexed by source entity.
#[derive(Debug, Clone)]
pub struct KeyNamespace {
    known: Vec<String>,
    by_entity: BTreeMap<EntityType, Vec<String>>,
}

impl KeyNamespace {
    /// Bare keys plus numeric variants `1..=limit_variants` for limited keys.
    pub fn new(limit_variants: u32) -> Self {
        let mut known = Vec::new();
        let mut by_entity: BTreeMap<EntityType, Vec<String>> = BTreeMap::new();

        for hot in &HOT_KEYS {
            let mut keys = vec![hot.base.to_string()];
            if hot.limited {
                keys.extend((1..=limit_variants).map(|limit| format!("{}-{limit}", hot.base)));
            }
            for entity in hot.depends_on {
                by_entity.entry(*entity).or_default().extend(keys.iter().cloned());
            }
            known.extend(keys);
        }

        Self { known, by_entity }
    }

    pub fn known_keys(&self) -> &[String] {
        &self.known
    }

    /// Memory keys derived from `entity`. Empty for entities no hot path reads.
    pub fn keys_for(&self, entity: EntityType) -> &[String] {
        self.by_entity
            .get(&entity)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.known.iter().any(|known| known == key)
    }
}

/// Memory-first access to the hot paths.
pub struct HotQueries {
    registry: Arc<QueryCacheRegistry>,
    memory: Arc<BoundedTtlCache<Value>>,
    namespace: KeyNamespace,
    memory_enabled: bool,
    // Bumped on every invalidation of the entity. A load that saw an older
    // epoch for any entity it depends on must not populate memory.
    epochs: Mutex<BTreeMap<EntityType, u64>>,
}

impl HotQueries {
    pub fn new(
        registry: Arc<QueryCacheRegistry>,
        memory: Arc<BoundedTtlCache<Value>>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            registry,
            memory,
            namespace: KeyNamespace::new(config.limit_variants),
            memory_enabled: config.enable_memory_cache,
            epochs: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<QueryCacheRegistry> {
        &self.registry
    }

    pub fn memory(&self) -> &BoundedTtlCache<Value> {
        &self.memory
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    /// Serve `query` from memory, falling back to the durable tier.
    ///
    /// Keys outside the namespace (a limit above the tracked variants) skip
    /// the memory tier entirely, since invalidation could never reach them.
    #[instrument(skip(self), fields(key = %query.memory_key()))]
    pub async fn get(&self, query: HotQuery) -> Result<Value, CacheError> {
        let key = query.memory_key();
        let use_memory = self.memory_enabled && self.namespace.contains(&key);

        if use_memory && let Some(value) = self.memory.get(&key) {
            return Ok(value);
        }

        if !use_memory {
            debug!("memory tier bypassed");
            return self.load(query).await;
        }

        let seen = self.epochs_of(query.depends_on());
        let value = self.load(query).await?;

        let ttl = self.registry.policy().ladder().duration(query.tier());
        let epochs = mutex_lock(&self.epochs, SOURCE, "populate");
        let unchanged = query
            .depends_on()
            .iter()
            .zip(&seen)
            .all(|(entity, seen)| epochs.get(entity).copied().unwrap_or(0) == *seen);
        if unchanged {
            self.memory.set(key, value.clone(), ttl);
        } else {
            debug!("invalidated during load; memory not populated");
        }
        drop(epochs);

        Ok(value)
    }

    /// Drop every memory key derived from `entity` and fence out loads that
    /// started before this call. Returns the number of keys dropped.
    pub fn invalidate_memory(&self, entity: EntityType) -> usize {
        let mut epochs = mutex_lock(&self.epochs, SOURCE, "invalidate");
        *epochs.entry(entity).or_insert(0) += 1;

        let keys = self.namespace.keys_for(entity);
        for key in keys {
            self.memory.delete(key);
        }
        keys.len()
    }

    fn epochs_of(&self, entities: &[EntityType]) -> Vec<u64> {
        let epochs = mutex_lock(&self.epochs, SOURCE, "snapshot");
        entities
            .iter()
            .map(|entity| epochs.get(entity).copied().unwrap_or(0))
            .collect()
    }

    pub async fn popular_posts(&self, limit: Option<u32>) -> Result<Value, CacheError> {
        self.get(HotQuery::PopularPosts {
            limit: limit.unwrap_or(HotQuery::DEFAULT_POPULAR_LIMIT),
        })
        .await
    }

    pub async fn recent_posts(&self, limit: Option<u32>) -> Result<Value, CacheError> {
        self.get(HotQuery::RecentPosts {
            limit: limit.unwrap_or(HotQuery::DEFAULT_RECENT_LIMIT),
        })
        .await
    }

    pub async fn site_navigation(&self) -> Result<Value, CacheError> {
        self.get(HotQuery::SiteNavigation).await
    }

    pub async fn global_settings(&self) -> Result<Value, CacheError> {
        self.get(HotQuery::GlobalSettings).await
    }

    pub async fn homepage_bundle(&self) -> Result<Value, CacheError> {
        self.get(HotQuery::HomepageBundle).await
    }

    pub async fn published_forms(&self) -> Result<Value, CacheError> {
        self.get(HotQuery::PublishedForms).await
    }

    async fn load(&self, query: HotQuery) -> Result<Value, CacheError> {
        let registry = &self.registry;
        match query {
            HotQuery::PopularPosts { limit } => {
                registry
                    .cached_query(
                        EntityType::Posts,
                        OperationKind::GetAll,
                        json!({
                            "limit": limit,
                            "filter": published_filter(),
                            "sort": ["-date_created"],
                        }),
                    )
                    .await
            }
            HotQuery::RecentPosts { limit } => {
                registry
                    .cached_query(
                        EntityType::Posts,
                        OperationKind::GetAll,
                        json!({
                            "limit": limit,
                            "filter": published_filter(),
                            "sort": ["-published_at", "-date_created"],
                            "fields": ["id", "title", "slug", "description", "image", "published_at"],
                        }),
                    )
                    .await
            }
            HotQuery::SiteNavigation => {
                registry
                    .cached_query(EntityType::Navigation, OperationKind::GetActive, json!({}))
                    .await
            }
            HotQuery::GlobalSettings => {
                registry
                    .cached_query(EntityType::Globals, OperationKind::Get, json!({}))
                    .await
            }
            HotQuery::PublishedForms => {
                registry
                    .cached_query(
                        EntityType::Forms,
                        OperationKind::GetAll,
                        json!({"filter": {"is_active": {"_eq": true}}}),
                    )
                    .await
            }
            HotQuery::HomepageBundle => self.load_homepage().await,
        }
    }

    async fn load_homepage(&self) -> Result<Value, CacheError> {
        let registry = &self.registry;
        let (globals, navigation, posts, page) = tokio::try_join!(
            registry.cached_query(EntityType::Globals, OperationKind::Get, json!({})),
            registry.cached_query(EntityType::Navigation, OperationKind::GetActive, json!({})),
            registry.cached_query(
                EntityType::Posts,
                OperationKind::GetAll,
                json!({
                    "limit": HOMEPAGE_POST_LIMIT,
                    "filter": published_filter(),
                    "sort": ["-published_at", "-date_created"],
                }),
            ),
            self.home_page(),
        )?;

        Ok(json!({
            "globals": globals,
            "navigation": navigation,
            "posts": posts,
            "page": page,
        }))
    }

    async fn home_page(&self) -> Result<Value, CacheError> {
        for slug in HOME_SLUGS {
            let page = self
                .registry
                .cached_query(EntityType::Pages, OperationKind::GetBySlug, json!({"slug": slug}))
                .await?;
            if !page.is_null() {
                return Ok(page);
            }
        }
        Ok(Value::Null)
    }
}

fn published_filter() -> Value {
    json!({"status": {"_eq": "published"}})
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::cache::error::FetchError;
    use crate::cache::keys::OperationId;
    use crate::cache::retention::RetentionPolicy;
    use crate::cache::store::InMemoryDurableStore;
    use crate::content::stub::StubSource;

    const POSTS_GET_ALL: OperationId = OperationId::new(EntityType::Posts, OperationKind::GetAll);

    fn hot(source: Arc<StubSource>, config: &CacheConfig) -> HotQueries {
        let store = Arc::new(InMemoryDurableStore::new(config.durable_capacity_non_zero()));
        let registry = Arc::new(QueryCacheRegistry::from_source(
            source,
            store,
            RetentionPolicy::new(config.retention_ladder()),
        ));
        let memory = Arc::new(BoundedTtlCache::new(config.memory_capacity_non_zero()));
        HotQueries::new(registry, memory, config)
    }

    #[test]
    fn namespace_tracks_suffix_variants_per_entity() {
        let namespace = KeyNamespace::new(20);
        assert_eq!(namespace.known_keys().len(), 6 + 2 * 20);

        let posts = namespace.keys_for(EntityType::Posts);
        for key in ["popular-posts", "popular-posts-1", "recent-posts-20", "homepage-bundle"] {
            assert!(posts.iter().any(|k| k == key), "missing {key}");
        }
        assert!(!posts.iter().any(|k| k == "global-settings"));
        assert!(!posts.iter().any(|k| k == "recent-posts-21"));

        assert_eq!(
            namespace.keys_for(EntityType::Forms),
            ["published-forms".to_string()]
        );
        assert!(namespace.keys_for(EntityType::Redirects).is_empty());
    }

    #[test]
    fn memory_keys() {
        assert_eq!(HotQuery::PopularPosts { limit: 5 }.memory_key(), "popular-posts-5");
        assert_eq!(HotQuery::RecentPosts { limit: 10 }.memory_key(), "recent-posts-10");
        assert_eq!(HotQuery::HomepageBundle.memory_key(), "homepage-bundle");
        assert_eq!(HotQuery::GlobalSettings.tier(), RetentionTier::VeryLong);
    }

    #[tokio::test]
    async fn memory_hit_skips_durable_tier() {
        let source = Arc::new(StubSource::echo());
        let hot = hot(Arc::clone(&source), &CacheConfig::default());

        let first = hot.popular_posts(Some(5)).await.expect("first");

        // Drop the durable entry; only the memory tier can answer now.
        for tag in hot.registry().invalidation_tags(EntityType::Posts, None) {
            hot.registry().store().invalidate_tag(&tag).await.expect("invalidate");
        }

        let second = hot.popular_posts(Some(5)).await.expect("second");
        assert_eq!(first, second);
        assert_eq!(source.call_count(POSTS_GET_ALL), 1);
        assert!(hot.memory().peek_live("popular-posts-5"));
    }

    #[tokio::test]
    async fn memory_miss_falls_through_to_durable_tier() {
        let source = Arc::new(StubSource::echo());
        let hot = hot(Arc::clone(&source), &CacheConfig::default());

        hot.global_settings().await.expect("first");
        hot.memory().clear();
        hot.global_settings().await.expect("second");

        let globals = OperationId::new(EntityType::Globals, OperationKind::Get);
        assert_eq!(source.call_count(globals), 1);
    }

    #[tokio::test]
    async fn untracked_limits_bypass_memory() {
        let source = Arc::new(StubSource::echo());
        let hot = hot(Arc::clone(&source), &CacheConfig::default());

        hot.recent_posts(Some(50)).await.expect("recent");
        assert!(hot.memory().is_empty());
    }

    #[tokio::test]
    async fn disabled_memory_tier_stores_nothing() {
        let source = Arc::new(StubSource::echo());
        let config = CacheConfig {
            enable_memory_cache: false,
            ..CacheConfig::default()
        };
        let hot = hot(Arc::clone(&source), &config);

        hot.site_navigation().await.expect("first");
        hot.site_navigation().await.expect("second");

        assert!(hot.memory().is_empty());
        let nav = OperationId::new(EntityType::Navigation, OperationKind::GetActive);
        assert_eq!(source.call_count(nav), 1);
    }

    #[tokio::test]
    async fn recent_posts_request_summary_fields() {
        let source = Arc::new(StubSource::echo());
        let hot = hot(Arc::clone(&source), &CacheConfig::default());

        hot.recent_posts(None).await.expect("recent");

        let (_, args) = source.calls().pop().expect("one call");
        assert_eq!(args["limit"], json!(5));
        assert_eq!(args["sort"], json!(["-published_at", "-date_created"]));
        assert_eq!(args["filter"], published_filter());
        assert!(hot.memory().peek_live("recent-posts-5"));
    }

    #[tokio::test]
    async fn homepage_falls_back_to_root_page() {
        let source = Arc::new(StubSource::new(|operation, args| {
            if operation.entity == EntityType::Pages {
                return Ok(match args["slug"].as_str() {
                    Some("/") => json!({"title": "Root"}),
                    _ => Value::Null,
                });
            }
            Ok(json!(operation.name()))
        }));
        let hot = hot(Arc::clone(&source), &CacheConfig::default());

        let bundle = hot.homepage_bundle().await.expect("bundle");

        assert_eq!(bundle["page"], json!({"title": "Root"}));
        assert_eq!(bundle["globals"], json!("globals.get"));
        assert_eq!(bundle["navigation"], json!("navigation.get_active"));
        assert_eq!(bundle["posts"], json!("posts.get_all"));
        assert!(hot.memory().peek_live("homepage-bundle"));
    }

    #[tokio::test]
    async fn homepage_propagates_constituent_failure() {
        let source = Arc::new(StubSource::new(|operation, _| {
            if operation.entity == EntityType::Navigation {
                Err(FetchError::Upstream {
                    status: 503,
                    message: "unavailable".to_string(),
                })
            } else {
                Ok(json!([]))
            }
        }));
        let hot = hot(source, &CacheConfig::default());

        let err = hot.homepage_bundle().await.expect_err("navigation fails");
        assert!(matches!(err, CacheError::Fetch(FetchError::Upstream { status: 503, .. })));
        assert!(!hot.memory().peek_live("homepage-bundle"));
    }
}
