use thiserror::Error;

use super::keys::{EntityType, OperationKind};

/// Failure reported by an upstream fetcher.
///
/// The cache never retries or inspects these; they travel back to the caller
/// of the cached query untouched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("upstream responded with status {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("failed to decode upstream payload: {0}")]
    Decode(String),
    #[error("invalid query arguments: {0}")]
    InvalidArgs(String),
    #[error("fetch failed: {0}")]
    Other(String),
}

impl FetchError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::InvalidArgs(message.into())
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    /// The wrapped fetcher failed. Nothing was cached.
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// No operation is registered for the pair; a wiring bug, not a runtime condition.
    #[error("no cached operation registered for `{entity}.{kind}`")]
    Unregistered {
        entity: EntityType,
        kind: OperationKind,
    },
    /// The durable store provider failed.
    #[error("durable store error: {0}")]
    Store(String),
}

impl CacheError {
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    pub fn is_unregistered(&self) -> bool {
        matches!(self, Self::Unregistered { .. })
    }
}
