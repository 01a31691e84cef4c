use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
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

/// Register descriptions for every freshcache metric with the installed recorder.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "freshcache_store_hit_total",
            Unit::Count,
            "Total number of cache store hits."
        );
        describe_counter!(
            "freshcache_store_miss_total",
            Unit::Count,
            "Total number of cache store misses, including expired entries."
        );
        describe_counter!(
            "freshcache_store_error_total",
            Unit::Count,
            "Total number of backend failures absorbed by the cache store."
        );
        describe_counter!(
            "freshcache_invalidated_keys_total",
            Unit::Count,
            "Total number of data keys removed by invalidation."
        );
        describe_counter!(
            "freshcache_fetch_total",
            Unit::Count,
            "Total number of origin fetches, labelled by outcome."
        );
        describe_histogram!(
            "freshcache_fetch_ms",
            Unit::Milliseconds,
            "Origin fetch latency in milliseconds."
        );
        describe_counter!(
            "freshcache_singleflight_join_total",
            Unit::Count,
            "Total number of callers that joined an in-flight fetch."
        );
        describe_counter!(
            "freshcache_stale_served_total",
            Unit::Count,
            "Total number of expired values served after an origin failure."
        );
        describe_counter!(
            "freshcache_retry_scheduled_total",
            Unit::Count,
            "Total number of background revalidations scheduled."
        );
        describe_gauge!(
            "freshcache_event_queue_len",
            Unit::Count,
            "Current number of pending invalidation events in the queue."
        );
        describe_counter!(
            "freshcache_event_dropped_total",
            Unit::Count,
            "Total number of invalidation events dropped due to queue overflow."
        );
        describe_histogram!(
            "freshcache_consume_ms",
            Unit::Milliseconds,
            "Invalidation batch consumption latency in milliseconds."
        );
    });
}
