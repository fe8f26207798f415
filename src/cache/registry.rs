//! Query cache registry.
//!
//! Binds each named read operation to its fetcher, its tag rule, and its TTL
//! rule once at startup. Also owns the static entity → durable tags table used
//! by invalidation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, instrument};

use crate::content::ContentSource;

use super::durable::{DurableStore, DurableTaggedCache, Fetcher, TagRule};
use super::error::{CacheError, FetchError};
use super::keys::{EntityType, OperationId, OperationKind, Tag};
use super::retention::{RetentionPolicy, TtlRule, default_rule};

use super::keys::{EntityType as E, OperationKind as K};

/// Operations bound by [`QueryCacheRegistry::from_source`].
pub const STANDARD_OPERATIONS: [OperationId; 21] = [
    OperationId::new(E::Posts, K::GetAll),
    OperationId::new(E::Posts, K::GetBySlug),
    OperationId::new(E::Posts, K::GetById),
    OperationId::new(E::Pages, K::GetAll),
    OperationId::new(E::Pages, K::GetBySlug),
    OperationId::new(E::Pages, K::GetById),
    OperationId::new(E::Globals, K::Get),
    OperationId::new(E::Navigation, K::GetActive),
    OperationId::new(E::Navigation, K::GetAll),
    OperationId::new(E::Navigation, K::GetById),
    OperationId::new(E::Forms, K::GetAll),
    OperationId::new(E::Forms, K::GetById),
    OperationId::new(E::AiPrompts, K::GetAll),
    OperationId::new(E::AiPrompts, K::GetPublished),
    OperationId::new(E::AiPrompts, K::GetById),
    OperationId::new(E::Redirects, K::GetAll),
    OperationId::new(E::Redirects, K::GetByFromUrl),
    OperationId::new(E::Redirects, K::GetById),
    OperationId::new(E::FormSubmissions, K::GetAll),
    OperationId::new(E::FormSubmissions, K::GetById),
    OperationId::new(E::FormSubmissions, K::GetByForm),
];

/// Tags an operation's results carry: the entity tag, plus a narrow tag for
/// single-record lookups.
pub fn standard_tag_rule(operation: OperationId) -> TagRule {
    match operation.kind {
        K::GetById => TagRule::entity_lookup(operation.entity, "id"),
        K::GetBySlug => TagRule::entity_lookup(operation.entity, "slug"),
        K::GetByFromUrl => TagRule::entity_lookup(operation.entity, "from_url"),
        K::GetByForm => TagRule::entity_lookup(operation.entity, "form_id"),
        _ => TagRule::entity(operation.entity),
    }
}

/// Adapts one operation of a [`ContentSource`] to the fetcher seam.
struct SourceFetcher {
    source: Arc<dyn ContentSource>,
    operation: OperationId,
}

#[async_trait]
impl Fetcher for SourceFetcher {
    async fn fetch(&self, args: Value) -> Result<Value, FetchError> {
        self.source.query(self.operation, args).await
    }
}

/// Builder for [`QueryCacheRegistry`].
pub struct QueryCacheRegistryBuilder {
    store: Arc<dyn DurableStore>,
    policy: RetentionPolicy,
    operations: HashMap<OperationId, DurableTaggedCache>,
}

impl QueryCacheRegistryBuilder {
    /// Bind `operation` with its standard tag and TTL rules.
    pub fn register(self, operation: OperationId, fetcher: Arc<dyn Fetcher>) -> Self {
        self.register_with(
            operation,
            fetcher,
            standard_tag_rule(operation),
            default_rule(operation),
        )
    }

    /// Bind `operation` with explicit rules. Re-registering replaces the binding.
    pub fn register_with(
        mut self,
        operation: OperationId,
        fetcher: Arc<dyn Fetcher>,
        tags: TagRule,
        ttl: TtlRule,
    ) -> Self {
        let cached = DurableTaggedCache::new(
            operation.name(),
            fetcher,
            tags,
            ttl,
            self.policy,
            Arc::clone(&self.store),
        );
        self.operations.insert(operation, cached);
        self
    }

    pub fn build(self) -> QueryCacheRegistry {
        let mut invalidation_tags: BTreeMap<EntityType, Vec<Tag>> = EntityType::ALL
            .into_iter()
            .map(|entity| (entity, vec![entity.tag()]))
            .collect();

        for (operation, cached) in &self.operations {
            let static_tags = match cached.tag_rule() {
                TagRule::Static(tags) => tags,
                TagRule::WithLookup { tags, .. } => tags,
            };
            let entry = invalidation_tags.entry(operation.entity).or_default();
            for tag in static_tags {
                if !entry.contains(tag) {
                    entry.push(tag.clone());
                }
            }
        }

        QueryCacheRegistry {
            operations: self.operations,
            invalidation_tags,
            store: self.store,
            policy: self.policy,
        }
    }
}

/// Immutable table of cached read operations.
pub struct QueryCacheRegistry {
    operations: HashMap<OperationId, DurableTaggedCache>,
    invalidation_tags: BTreeMap<EntityType, Vec<Tag>>,
    store: Arc<dyn DurableStore>,
    policy: RetentionPolicy,
}

impl QueryCacheRegistry {
    pub fn builder(store: Arc<dyn DurableStore>, policy: RetentionPolicy) -> QueryCacheRegistryBuilder {
        QueryCacheRegistryBuilder {
            store,
            policy,
            operations: HashMap::new(),
        }
    }

    /// Bind every standard operation to `source`.
    pub fn from_source(
        source: Arc<dyn ContentSource>,
        store: Arc<dyn DurableStore>,
        policy: RetentionPolicy,
    ) -> Self {
        STANDARD_OPERATIONS
            .into_iter()
            .fold(Self::builder(store, policy), |builder, operation| {
                let fetcher = Arc::new(SourceFetcher {
                    source: Arc::clone(&source),
                    operation,
                });
                builder.register(operation, fetcher)
            })
            .build()
    }

    /// The cached operation bound to `(entity, kind)`.
    pub fn lookup(
        &self,
        entity: EntityType,
        kind: OperationKind,
    ) -> Result<&DurableTaggedCache, CacheError> {
        self.operations
            .get(&OperationId::new(entity, kind))
            .ok_or_else(|| {
                error!(
                    entity = %entity,
                    kind = %kind,
                    "cached query requested for an unregistered operation"
                );
                CacheError::Unregistered { entity, kind }
            })
    }

    /// Run a registered operation through the durable tier.
    #[instrument(skip(self, args), fields(entity = %entity, kind = %kind))]
    pub async fn cached_query(
        &self,
        entity: EntityType,
        kind: OperationKind,
        args: Value,
    ) -> Result<Value, CacheError> {
        self.lookup(entity, kind)?.fetch(args).await
    }

    /// Durable tags to invalidate when `entity` (optionally one record) changes.
    pub fn invalidation_tags(&self, entity: EntityType, id: Option<&str>) -> Vec<Tag> {
        let mut tags = self
            .invalidation_tags
            .get(&entity)
            .cloned()
            .unwrap_or_else(|| vec![entity.tag()]);
        if let Some(id) = id {
            tags.push(entity.id_tag(id));
        }
        tags
    }

    pub fn operations(&self) -> impl Iterator<Item = OperationId> + '_ {
        self.operations.keys().copied()
    }

    pub fn store(&self) -> &dyn DurableStore {
        self.store.as_ref()
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }
}
