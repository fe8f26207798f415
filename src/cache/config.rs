//! Cache configuration.
//!
//! Controls the memory tier, the in-process durable tier, and the retention
//! ladder via `vellum.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

use super::retention::RetentionLadder;

// Default values for cache configuration
const DEFAULT_MEMORY_CAPACITY: usize = 100;
const DEFAULT_DURABLE_CAPACITY: usize = 1000;
const DEFAULT_TTL_SHORT_SECS: u64 = 60;
const DEFAULT_TTL_MEDIUM_SECS: u64 = 300;
const DEFAULT_TTL_LONG_SECS: u64 = 3600;
const DEFAULT_TTL_VERY_LONG_SECS: u64 = 86400;
const DEFAULT_LIMIT_VARIANTS: u32 = 20;

/// Cache configuration from `vellum.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable the in-process memory tier for hot queries.
    pub enable_memory_cache: bool,
    /// Maximum entries held by the memory tier.
    pub memory_capacity: usize,
    /// Maximum entries held by the in-process durable store.
    pub durable_capacity: usize,
    /// Short retention tier, in seconds.
    pub ttl_short_secs: u64,
    /// Medium retention tier, in seconds.
    pub ttl_medium_secs: u64,
    /// Long retention tier, in seconds.
    pub ttl_long_secs: u64,
    /// Very long retention tier, in seconds.
    pub ttl_very_long_secs: u64,
    /// Highest numeric suffix cleared for `top-N` style memory keys.
    pub limit_variants: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_memory_cache: true,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            durable_capacity: DEFAULT_DURABLE_CAPACITY,
            ttl_short_secs: DEFAULT_TTL_SHORT_SECS,
            ttl_medium_secs: DEFAULT_TTL_MEDIUM_SECS,
            ttl_long_secs: DEFAULT_TTL_LONG_SECS,
            ttl_very_long_secs: DEFAULT_TTL_VERY_LONG_SECS,
            limit_variants: DEFAULT_LIMIT_VARIANTS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enable_memory_cache: settings.enable_memory_cache,
            memory_capacity: settings.memory_capacity.get(),
            durable_capacity: settings.durable_capacity.get(),
            ttl_short_secs: settings.ttl_short.as_secs(),
            ttl_medium_secs: settings.ttl_medium.as_secs(),
            ttl_long_secs: settings.ttl_long.as_secs(),
            ttl_very_long_secs: settings.ttl_very_long.as_secs(),
            limit_variants: settings.limit_variants,
        }
    }
}

impl CacheConfig {
    /// Returns the memory capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn memory_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the durable capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn durable_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.durable_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    /// Build the retention ladder. Zero-second tiers are clamped to one second.
    pub fn retention_ladder(&self) -> RetentionLadder {
        let secs = |value: u64| Duration::from_secs(value.max(1));
        RetentionLadder {
            short: secs(self.ttl_short_secs),
            medium: secs(self.ttl_medium_secs),
            long: secs(self.ttl_long_secs),
            very_long: secs(self.ttl_very_long_secs),
        }
    }
}
