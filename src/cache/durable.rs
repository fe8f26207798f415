//! Durable, tag-addressable cache tier.
//!
//! `DurableTaggedCache` memoizes an opaque fetcher behind an injected
//! [`DurableStore`]. The wrapper holds no index of which keys carry which tags;
//! it only passes the same tags through on every store so the provider can
//! invalidate them in bulk.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use metrics::histogram;
use serde_json::Value;
use tracing::{instrument, warn};

use super::error::{CacheError, FetchError};
use super::keys::{CacheKey, EntityType, Tag};
use super::retention::{RetentionPolicy, TtlRule};

const METRIC_FETCH_MS: &str = "vellum_cache_fetch_ms";

/// Pending upstream computation handed to a durable store on a miss.
pub type ComputeFuture<'a> = BoxFuture<'a, Result<Value, FetchError>>;

/// An upstream read operation. The cache treats its result as opaque.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, args: Value) -> Result<Value, FetchError>;
}

#[async_trait]
impl<F, Fut> Fetcher for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
{
    async fn fetch(&self, args: Value) -> Result<Value, FetchError> {
        (self)(args).await
    }
}

/// Durable cache provider: get-or-compute plus tag invalidation.
///
/// Implementations own the mapping from tags back to entries. `compute` must
/// not be polled while holding any internal lock.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Return the live entry for `key`, or run `compute` and store its result
    /// with `tags` for `ttl`. A failed compute stores nothing.
    async fn get_or_compute<'a>(
        &'a self,
        key: &'a CacheKey,
        compute: ComputeFuture<'a>,
        tags: &'a [Tag],
        ttl: Duration,
    ) -> Result<Value, CacheError>;

    /// Make every entry carrying `tag` unavailable to later reads.
    async fn invalidate_tag(&self, tag: &Tag) -> Result<(), CacheError>;
}

/// Invalidate each tag in turn. Every tag is attempted; the last failure is
/// returned.
pub async fn invalidate_tags(store: &dyn DurableStore, tags: &[Tag]) -> Result<(), CacheError> {
    let mut outcome = Ok(());
    for tag in tags {
        if let Err(err) = store.invalidate_tag(tag).await {
            warn!(tag = %tag, error = %err, "durable tag invalidation failed");
            outcome = Err(err);
        }
    }
    outcome
}

/// Which tags a stored result carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagRule {
    Static(Vec<Tag>),
    /// Static tags plus a narrow one derived from an argument, e.g.
    /// `posts:slug:<slug>` for `{"slug": ...}`.
    WithLookup {
        tags: Vec<Tag>,
        entity: EntityType,
        field: &'static str,
    },
}

impl TagRule {
    pub fn entity(entity: EntityType) -> Self {
        Self::Static(vec![entity.tag()])
    }

    pub fn entity_lookup(entity: EntityType, field: &'static str) -> Self {
        Self::WithLookup {
            tags: vec![entity.tag()],
            entity,
            field,
        }
    }

    pub fn tags_for(&self, args: &Value) -> Vec<Tag> {
        match self {
            TagRule::Static(tags) => tags.clone(),
            TagRule::WithLookup {
                tags,
                entity,
                field,
            } => {
                let mut all = tags.clone();
                if let Some(value) = lookup_value(args, field) {
                    all.push(entity.lookup_tag(field, &value));
                }
                all
            }
        }
    }
}

fn lookup_value(args: &Value, field: &str) -> Option<String> {
    match args.get(field)? {
        Value::String(value) => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

/// A fetcher memoized in a durable store under one operation name.
pub struct DurableTaggedCache {
    name: String,
    fetcher: Arc<dyn Fetcher>,
    tags: TagRule,
    ttl: TtlRule,
    policy: RetentionPolicy,
    store: Arc<dyn DurableStore>,
}

impl DurableTaggedCache {
    pub fn new(
        name: impl Into<String>,
        fetcher: Arc<dyn Fetcher>,
        tags: TagRule,
        ttl: TtlRule,
        policy: RetentionPolicy,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        Self {
            name: name.into(),
            fetcher,
            tags,
            ttl,
            policy,
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag_rule(&self) -> &TagRule {
        &self.tags
    }

    pub fn ttl_rule(&self) -> TtlRule {
        self.ttl
    }

    /// Key this operation would use for `args`.
    pub fn key_for(&self, args: &Value) -> CacheKey {
        CacheKey::derive(&self.name, args)
    }

    /// Serve `args` from the durable store, fetching upstream on a miss.
    #[instrument(skip(self, args), fields(op = %self.name))]
    pub async fn fetch(&self, args: Value) -> Result<Value, CacheError> {
        let key = self.key_for(&args);
        let tags = self.tags.tags_for(&args);
        let ttl = self.policy.resolve_rule(self.ttl, &args);

        let fetcher = Arc::clone(&self.fetcher);
        let name = self.name.clone();
        let compute: ComputeFuture<'_> = Box::pin(async move {
            let started_at = Instant::now();
            let result = fetcher.fetch(args).await;
            histogram!(
                METRIC_FETCH_MS,
                "operation" => name,
                "outcome" => if result.is_ok() { "ok" } else { "error" }
            )
            .record(started_at.elapsed().as_secs_f64() * 1000.0);
            result
        });

        self.store.get_or_compute(&key, compute, &tags, ttl).await
    }

    pub async fn invalidate(&self, tags: &[Tag]) -> Result<(), CacheError> {
        invalidate_tags(self.store.as_ref(), tags).await
    }
}
