//! Upstream content sources.
//!
//! The cache treats every source as an opaque fetcher; this module only maps
//! named read operations onto a concrete backend.

mod directus;
#[cfg(test)]
pub(crate) mod stub;

use async_trait::async_trait;
use serde_json::Value;

use crate::cache::{FetchError, OperationId};

pub use directus::{DirectusClient, RequestPlan};

/// A backend that can execute named read operations.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn query(&self, operation: OperationId, args: Value) -> Result<Value, FetchError>;
}
