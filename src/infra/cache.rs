//! Wiring for the two-tier content cache.

use std::sync::Arc;

use serde_json::Value;

use crate::cache::{
    BoundedTtlCache, CacheConfig, CacheError, CacheInvalidationManager, DurableStore, EntityType,
    HotQueries, InMemoryDurableStore, OperationKind, QueryCacheRegistry, RetentionPolicy,
};
use crate::content::ContentSource;

/// Registry, hot paths, and invalidation manager built over one store and one
/// memory tier. Cheap to share behind an `Arc`.
pub struct ContentCache {
    registry: Arc<QueryCacheRegistry>,
    hot: Arc<HotQueries>,
    manager: CacheInvalidationManager,
}

impl ContentCache {
    pub fn new(
        config: &CacheConfig,
        source: Arc<dyn ContentSource>,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        let policy = RetentionPolicy::new(config.retention_ladder());
        let registry = Arc::new(QueryCacheRegistry::from_source(source, store, policy));
        let memory = Arc::new(BoundedTtlCache::new(config.memory_capacity_non_zero()));
        let hot = Arc::new(HotQueries::new(Arc::clone(&registry), memory, config));
        let manager = CacheInvalidationManager::new(Arc::clone(&hot));
        Self {
            registry,
            hot,
            manager,
        }
    }

    /// Build over the in-process durable store.
    pub fn in_process(config: &CacheConfig, source: Arc<dyn ContentSource>) -> Self {
        let store = Arc::new(InMemoryDurableStore::new(config.durable_capacity_non_zero()));
        Self::new(config, source, store)
    }

    pub fn registry(&self) -> &Arc<QueryCacheRegistry> {
        &self.registry
    }

    pub fn hot(&self) -> &Arc<HotQueries> {
        &self.hot
    }

    pub fn manager(&self) -> &CacheInvalidationManager {
        &self.manager
    }

    pub async fn cached_query(
        &self,
        entity: EntityType,
        kind: OperationKind,
        args: Value,
    ) -> Result<Value, CacheError> {
        self.registry.cached_query(entity, kind, args).await
    }
}
