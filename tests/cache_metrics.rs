use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use freshcache::cache::{
    CacheBackend, CacheConfig, CacheStore, EventQueue, FetchCoordinator, FetchRequest, Fetched,
    InvalidationBus, InvalidationTarget, StoreError, TtlPolicy,
};
use freshcache::domain::content::ContentFeed;
use freshcache::infra::telemetry;
use freshcache_types::{ContentDescriptor, ContentType};
use futures::future::join;
use metrics_util::debugging::DebuggingRecorder;
use time::OffsetDateTime;

struct UnreachableBackend;

#[async_trait]
impl CacheBackend for UnreachableBackend {
    fn name(&self) -> &'static str {
        "unreachable"
    }

    async fn get(&self, _key: &str) -> Result<Option<Bytes>, StoreError> {
        Err(StoreError::unavailable("unreachable", "get", "connection refused"))
    }

    async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<(), StoreError> {
        Err(StoreError::unavailable("unreachable", "set", "connection refused"))
    }

    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::unavailable("unreachable", "delete", "connection refused"))
    }

    async fn keys_with_prefix(&self, _prefix: &str) -> Result<Vec<String>, StoreError> {
        Err(StoreError::unavailable("unreachable", "list", "connection refused"))
    }
}

fn home_feed() -> Result<Fetched<ContentFeed>, String> {
    Ok(Fetched::new(
        ContentFeed::new(Vec::new(), OffsetDateTime::UNIX_EPOCH),
        ContentDescriptor::new(ContentType::Home),
    ))
}

#[tokio::test(start_paused = true)]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    let config = CacheConfig {
        fetch_timeout_ms: 100,
        retry_delay_ms: 1_000,
        ..CacheConfig::default()
    };
    let store = Arc::new(CacheStore::in_memory(&config));
    let coordinator: FetchCoordinator<ContentFeed> =
        FetchCoordinator::new(Arc::clone(&store), TtlPolicy::default(), &config);

    // Miss, fetch and hit
    coordinator
        .get(FetchRequest::new("home"), || async { home_feed() })
        .await
        .expect("origin");
    coordinator
        .get(FetchRequest::new("home"), || async { home_feed() })
        .await
        .expect("hit");

    // Two concurrent misses share one flight
    let slow = || async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        home_feed()
    };
    let (first, second) = join(
        coordinator.get(FetchRequest::new("latest"), slow),
        coordinator.get(FetchRequest::new("latest"), slow),
    )
    .await;
    first.expect("first waiter");
    second.expect("second waiter");

    // Expired value plus failing origin: stale served, retry scheduled
    tokio::time::sleep(Duration::from_secs(61)).await;
    let stale = coordinator
        .get(FetchRequest::new("home"), || async {
            Err::<Fetched<ContentFeed>, _>("origin down")
        })
        .await
        .expect("stale value");
    assert_eq!(stale.meta.source, freshcache_types::CacheSource::Stale);

    // Absorbed backend failure
    let broken = CacheStore::new(Arc::new(UnreachableBackend), &config);
    assert_eq!(broken.get::<String>("home").await, None);

    // Queue overflow, consumption and key invalidation
    let queue = Arc::new(EventQueue::new(1));
    let bus = InvalidationBus::new(config.clone(), Arc::clone(&store), Arc::clone(&queue));
    queue.publish(InvalidationTarget::pattern("latest*"), "test");
    queue.publish(InvalidationTarget::pattern("home*"), "test");
    let report = bus.consume().await;
    assert_eq!(report.events, 1);

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "freshcache_store_hit_total",
        "freshcache_store_miss_total",
        "freshcache_store_error_total",
        "freshcache_invalidated_keys_total",
        "freshcache_fetch_total",
        "freshcache_fetch_ms",
        "freshcache_singleflight_join_total",
        "freshcache_stale_served_total",
        "freshcache_retry_scheduled_total",
        "freshcache_event_queue_len",
        "freshcache_event_dropped_total",
        "freshcache_consume_ms",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
