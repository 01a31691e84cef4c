//! Fetch coordinator behaviour under concurrency, timeouts and stale fallback.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use freshcache::cache::{
    CacheConfig, CacheError, CacheStore, FetchCoordinator, FetchRequest, Fetched, Projected,
    TtlPolicy,
};
use freshcache::domain::content::{ContentFeed, ContentItem, FeedFull, FeedLite};
use freshcache_types::{CacheSource, ContentDescriptor, ContentType, OutputFormat, ResponseMeta};
use futures::future::{BoxFuture, FutureExt, join_all};
use time::OffsetDateTime;
use time::macros::datetime;
use uuid::Uuid;

type FeedFuture = BoxFuture<'static, Result<Fetched<ContentFeed>, String>>;
type FeedFetcher = Arc<dyn Fn() -> FeedFuture + Send + Sync>;

fn item(n: u128, title: &str) -> ContentItem {
    ContentItem {
        id: Uuid::from_u128(n),
        slug: format!("story-{n}"),
        title: title.to_string(),
        excerpt: "Excerpt".to_string(),
        body_html: "<p>Body</p>".to_string(),
        author: None,
        tags: vec!["world".to_string()],
        hero_image: Some("https://img.example/hero.jpg".to_string()),
        is_breaking: false,
        published_at: Some(datetime!(2020-01-01 08:00 UTC)),
        updated_at: datetime!(2020-01-01 09:00 UTC),
        view_count: 3,
    }
}

fn feed(title: &str) -> ContentFeed {
    ContentFeed::new(vec![item(1, title)], OffsetDateTime::UNIX_EPOCH)
}

fn coordinator_with(config: CacheConfig) -> FetchCoordinator<ContentFeed> {
    let store = Arc::new(CacheStore::in_memory(&config));
    FetchCoordinator::new(store, TtlPolicy::default(), &config)
}

fn short_timeout() -> CacheConfig {
    CacheConfig {
        fetch_timeout_ms: 100,
        retry_delay_ms: 1_000,
        ..CacheConfig::default()
    }
}

/// Fetcher that sleeps for `delay` and then returns a feed titled `title`.
fn slow_fetcher(calls: Arc<AtomicUsize>, delay: Duration, title: &'static str) -> FeedFetcher {
    Arc::new(move || {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            let snapshot = feed(title);
            let descriptor = snapshot.descriptor(ContentType::Home);
            Ok(Fetched::new(snapshot, descriptor))
        }
        .boxed()
    })
}

fn call(fetcher: &FeedFetcher) -> impl Fn() -> FeedFuture + Send + Sync + 'static {
    let fetcher = Arc::clone(fetcher);
    move || fetcher()
}

fn titles(body: &Projected<FeedFull, FeedLite>) -> Vec<String> {
    match body {
        Projected::Full(full) => full.items.iter().map(|item| item.title.clone()).collect(),
        Projected::Lite(lite) => lite.items.iter().map(|item| item.title.clone()).collect(),
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_misses_share_one_fetch() {
    let coordinator = coordinator_with(CacheConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = slow_fetcher(calls.clone(), Duration::from_millis(200), "Shared");

    let requests = (0..5).map(|n| {
        let coordinator = coordinator.clone();
        let format = if n % 2 == 0 {
            OutputFormat::Full
        } else {
            OutputFormat::Lite
        };
        let fetcher = call(&fetcher);
        async move {
            coordinator
                .get(FetchRequest::new("home").format(format), fetcher)
                .await
        }
    });
    let results = join_all(requests).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in &results {
        let served = result.as_ref().expect("every caller is served");
        assert_eq!(served.meta, ResponseMeta::origin(60));
        assert_eq!(titles(&served.body), vec!["Shared"]);
    }
    assert_eq!(coordinator.stats().joins, 4);
    assert_eq!(coordinator.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn abandoned_caller_does_not_cancel_shared_fetch() {
    let coordinator = coordinator_with(CacheConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = slow_fetcher(calls.clone(), Duration::from_millis(200), "Kept");

    let first = tokio::spawn({
        let coordinator = coordinator.clone();
        let fetcher = call(&fetcher);
        async move { coordinator.get(FetchRequest::new("home"), fetcher).await }
    });
    let second = tokio::spawn({
        let coordinator = coordinator.clone();
        let fetcher = call(&fetcher);
        async move { coordinator.get(FetchRequest::new("home"), fetcher).await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(coordinator.in_flight(), 1);
    first.abort();
    assert!(first.await.expect_err("first caller gave up").is_cancelled());

    let served = second
        .await
        .expect("second caller task")
        .expect("second caller served");
    assert_eq!(served.meta, ResponseMeta::origin(60));
    assert_eq!(titles(&served.body), vec!["Kept"]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let stored = coordinator
        .store()
        .get::<ContentFeed>("home")
        .await
        .expect("shared fetch stored its value");
    assert_eq!(stored.items[0].title, "Kept");
}

#[tokio::test(start_paused = true)]
async fn full_and_lite_agree_on_shared_fields() {
    let coordinator = coordinator_with(CacheConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = slow_fetcher(calls.clone(), Duration::from_millis(10), "Same");

    let full = coordinator
        .get(FetchRequest::new("latest"), call(&fetcher))
        .await
        .expect("full");
    let lite = coordinator
        .get(
            FetchRequest::new("latest").format(OutputFormat::Lite),
            call(&fetcher),
        )
        .await
        .expect("lite");

    match (full.body, lite.body) {
        (Projected::Full(full), Projected::Lite(lite)) => {
            assert_eq!(full.items[0].id, lite.items[0].id);
            assert_eq!(full.items[0].title, lite.items[0].title);
            assert_eq!(full.items[0].published_at, lite.items[0].published_at);
        }
        _ => panic!("formats were not honoured"),
    }
    assert_eq!(lite.meta.source, CacheSource::Cache);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_without_prior_value_serves_fallback() {
    let coordinator = coordinator_with(short_timeout());
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = slow_fetcher(calls.clone(), Duration::from_secs(30), "Never");

    let err = coordinator
        .get(FetchRequest::new("smart:q=rust"), call(&fetcher))
        .await
        .expect_err("nothing to fall back on");
    assert!(matches!(err.error, CacheError::Timeout { .. }));
    assert_eq!(err.meta, ResponseMeta::origin_error());

    let fallback = ContentFeed::new(Vec::new(), OffsetDateTime::UNIX_EPOCH);
    let served = coordinator
        .get_or_fallback(FetchRequest::new("smart:q=rust"), call(&fetcher), &fallback)
        .await;
    assert_eq!(served.meta.source, CacheSource::OriginError);
    assert!(!served.meta.cached);
    assert!(titles(&served.body).is_empty());
    assert_eq!(coordinator.stats().retries_scheduled, 0);
}

#[tokio::test(start_paused = true)]
async fn timeout_with_expired_value_serves_stale_and_retries_once() {
    let coordinator = coordinator_with(short_timeout());
    let calls = Arc::new(AtomicUsize::new(0));

    let warm = slow_fetcher(calls.clone(), Duration::from_millis(10), "Yesterday");
    coordinator
        .get(FetchRequest::new("home"), call(&warm))
        .await
        .expect("warm cache");

    tokio::time::sleep(Duration::from_secs(61)).await;

    let hanging = slow_fetcher(calls.clone(), Duration::from_secs(30), "Never");
    let waiters = (0..3).map(|_| {
        let coordinator = coordinator.clone();
        let fetcher = call(&hanging);
        async move { coordinator.get(FetchRequest::new("home"), fetcher).await }
    });
    for result in join_all(waiters).await {
        let served = result.expect("stale value served");
        assert_eq!(served.meta, ResponseMeta::stale());
        assert_eq!(titles(&served.body), vec!["Yesterday"]);
    }

    let again = coordinator
        .get(FetchRequest::new("home"), call(&hanging))
        .await
        .expect("still stale");
    assert_eq!(again.meta.source, CacheSource::Stale);

    assert_eq!(coordinator.stats().retries_scheduled, 1);
    assert_eq!(coordinator.stats().stale_served, 4);
}

#[tokio::test(start_paused = true)]
async fn background_retry_refreshes_the_store() {
    let coordinator = coordinator_with(short_timeout());
    let calls = Arc::new(AtomicUsize::new(0));

    let warm = slow_fetcher(calls.clone(), Duration::ZERO, "Old");
    coordinator
        .get(FetchRequest::new("home"), call(&warm))
        .await
        .expect("warm cache");
    tokio::time::sleep(Duration::from_secs(61)).await;

    let attempts = Arc::new(AtomicUsize::new(0));
    let flaky = {
        let attempts = Arc::clone(&attempts);
        move || {
            let attempts = Arc::clone(&attempts);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err("origin unavailable".to_string());
                }
                let snapshot = feed("New");
                let descriptor = ContentDescriptor::new(ContentType::Home);
                Ok(Fetched::new(snapshot, descriptor))
            }
            .boxed()
        }
    };

    let stale = coordinator
        .get(FetchRequest::new("home"), flaky)
        .await
        .expect("stale served");
    assert_eq!(stale.meta.source, CacheSource::Stale);

    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    let refreshed = coordinator
        .store()
        .get::<ContentFeed>("home")
        .await
        .expect("retry stored a fresh value");
    assert_eq!(refreshed.items[0].title, "New");

    let hit = coordinator
        .get(FetchRequest::new("home"), call(&warm))
        .await
        .expect("hit");
    assert_eq!(hit.meta, ResponseMeta::hit(60));
    assert_eq!(titles(&hit.body), vec!["New"]);
}
