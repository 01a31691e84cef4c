//! Cache configuration.
//!
//! Controls the store, the fetch coordinator and the invalidation bus via the
//! `[cache]` section of `freshcache.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_MEMORY_CAPACITY: usize = 10_000;
const DEFAULT_STALE_CAPACITY: usize = 2_000;
const DEFAULT_STALE_WINDOW_SECS: u64 = 3_600;
const DEFAULT_FETCH_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
const DEFAULT_AUTO_CONSUME_INTERVAL_MS: u64 = 5_000;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;
const DEFAULT_MAX_EVENT_QUEUE_LEN: usize = 2_048;
const DEFAULT_AGGREGATE_PREFIXES: [&str; 6] =
    ["home", "latest", "featured", "smart", "popular", "trending"];

/// Cache configuration from `freshcache.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch. When off, every read misses and every write is dropped.
    pub enabled: bool,
    /// Maximum entries held by the in-process backend.
    pub memory_capacity: usize,
    /// Maximum keys whose last value is retained for stale serving.
    pub stale_capacity: usize,
    /// How long past its TTL a value may still be served when origin fails.
    pub stale_window_seconds: u64,
    /// Upper bound for a single origin fetch.
    pub fetch_timeout_ms: u64,
    /// Delay before a background retry after a stale value was served.
    pub retry_delay_ms: u64,
    /// Interval (ms) of the background invalidation consumer.
    pub auto_consume_interval_ms: u64,
    /// Maximum invalidation events per consumption batch.
    pub consume_batch_limit: usize,
    /// Pending invalidation events kept before the oldest is dropped.
    pub max_event_queue_len: usize,
    /// Key namespaces holding aggregate listings, purged on every content change.
    pub aggregate_prefixes: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            stale_capacity: DEFAULT_STALE_CAPACITY,
            stale_window_seconds: DEFAULT_STALE_WINDOW_SECS,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            auto_consume_interval_ms: DEFAULT_AUTO_CONSUME_INTERVAL_MS,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
            max_event_queue_len: DEFAULT_MAX_EVENT_QUEUE_LEN,
            aggregate_prefixes: DEFAULT_AGGREGATE_PREFIXES
                .iter()
                .map(|prefix| prefix.to_string())
                .collect(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            memory_capacity: settings.memory_capacity.get(),
            stale_capacity: settings.stale_capacity.get(),
            stale_window_seconds: settings.stale_window.as_secs(),
            fetch_timeout_ms: duration_millis(settings.fetch_timeout),
            retry_delay_ms: duration_millis(settings.retry_delay),
            auto_consume_interval_ms: duration_millis(settings.auto_consume_interval),
            consume_batch_limit: settings.consume_batch_limit.get(),
            max_event_queue_len: settings.max_event_queue_len.get(),
            aggregate_prefixes: settings.aggregate_prefixes.clone(),
        }
    }
}

impl CacheConfig {
    /// Returns the memory capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn memory_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the stale capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn stale_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.stale_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn stale_window(&self) -> Duration {
        Duration::from_secs(self.stale_window_seconds)
    }

    /// Fetch timeout, never shorter than one millisecond.
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms.max(1))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Consumer interval, never shorter than one millisecond.
    pub fn auto_consume_interval(&self) -> Duration {
        Duration::from_millis(self.auto_consume_interval_ms.max(1))
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.memory_capacity, 10_000);
        assert_eq!(config.stale_capacity, 2_000);
        assert_eq!(config.stale_window_seconds, 3_600);
        assert_eq!(config.fetch_timeout_ms, 5_000);
        assert_eq!(config.retry_delay_ms, 1_000);
        assert_eq!(config.consume_batch_limit, 100);
        assert_eq!(config.max_event_queue_len, 2_048);
        assert_eq!(
            config.aggregate_prefixes,
            vec!["home", "latest", "featured", "smart", "popular", "trending"]
        );
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            memory_capacity: 0,
            stale_capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.memory_capacity_non_zero().get(), 1);
        assert_eq!(config.stale_capacity_non_zero().get(), 1);
    }

    #[test]
    fn zero_timeout_is_clamped() {
        let config = CacheConfig {
            fetch_timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.fetch_timeout(), Duration::from_millis(1));
    }
}
