//! Vellum cache system
//!
//! Two tiers sit between request handlers and the upstream content API:
//!
//! - **Durable tier**: every registered read operation is memoized in a
//!   [`DurableStore`] under a canonical key and tagged by entity type, so a
//!   write to one collection invalidates exactly the queries that read it.
//! - **Memory tier**: a small FIFO/TTL map in front of the durable tier for
//!   the hot paths every page render needs.
//!
//! [`CacheInvalidationManager`] keeps the tiers consistent when content
//! mutates, warms the critical paths, and reports what is resident.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enable_memory_cache = true
//! memory_capacity = 100
//! ttl_medium_secs = 300
//! # ... see config.rs for all options
//! ```

mod config;
mod durable;
mod error;
mod hot;
mod invalidation;
mod keys;
mod lock;
mod memory;
mod registry;
mod retention;
mod store;

pub use config::CacheConfig;
pub use durable::{ComputeFuture, DurableStore, DurableTaggedCache, Fetcher, TagRule, invalidate_tags};
pub use error::{CacheError, FetchError};
pub use hot::{HotQueries, HotQuery, KeyNamespace};
pub use invalidation::{CacheInvalidationManager, CacheStats, WarmReport};
pub use keys::{CacheKey, EntityType, OperationId, OperationKind, Tag, UnknownName, canonical_json};
pub use memory::{BoundedTtlCache, CacheEntry};
pub use registry::{QueryCacheRegistry, QueryCacheRegistryBuilder, STANDARD_OPERATIONS, standard_tag_rule};
pub use retention::{
    FilterClass, RetentionLadder, RetentionPolicy, RetentionTier, TtlRule, classify_filter,
    default_rule,
};
pub use store::InMemoryDurableStore;
