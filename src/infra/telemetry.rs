use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every cache metric. Safe to call repeatedly.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "vellum_cache_memory_hit_total",
            Unit::Count,
            "Total number of memory-tier hits."
        );
        describe_counter!(
            "vellum_cache_memory_miss_total",
            Unit::Count,
            "Total number of memory-tier misses, including expired entries."
        );
        describe_counter!(
            "vellum_cache_memory_evict_total",
            Unit::Count,
            "Total number of memory-tier evictions due to capacity."
        );
        describe_counter!(
            "vellum_cache_memory_expired_total",
            Unit::Count,
            "Total number of memory-tier entries dropped after their TTL."
        );
        describe_counter!(
            "vellum_cache_durable_hit_total",
            Unit::Count,
            "Total number of durable-tier hits."
        );
        describe_counter!(
            "vellum_cache_durable_miss_total",
            Unit::Count,
            "Total number of durable-tier misses that ran the upstream fetch."
        );
        describe_counter!(
            "vellum_cache_durable_evict_total",
            Unit::Count,
            "Total number of in-process durable entries evicted due to capacity."
        );
        describe_counter!(
            "vellum_cache_invalidate_total",
            Unit::Count,
            "Total number of entity invalidations, labelled by entity."
        );
        describe_histogram!(
            "vellum_cache_fetch_ms",
            Unit::Milliseconds,
            "Upstream fetch latency in milliseconds."
        );
        describe_histogram!(
            "vellum_cache_warm_ms",
            Unit::Milliseconds,
            "Critical cache warm latency in milliseconds."
        );
    });
}
