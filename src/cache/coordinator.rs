//! Single-flight fetch coordination.
//!
//! Concurrent misses for one key share a single origin fetch. The fetch runs
//! in its own task so that callers giving up never cancel it for the others;
//! its result is fanned out through a shared future and written to the store
//! once.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use freshcache_types::{ContentDescriptor, OutputFormat, RequestFlags, ResponseMeta};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::{counter, histogram};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::CacheConfig;
use super::error::CacheError;
use super::keys::CacheKey;
use super::policy::TtlPolicy;
use super::projector::{Project, Projected, project};
use super::store::CacheStore;

const METRIC_FETCH: &str = "freshcache_fetch_total";
const METRIC_FETCH_MS: &str = "freshcache_fetch_ms";
const METRIC_JOIN: &str = "freshcache_singleflight_join_total";
const METRIC_STALE_SERVED: &str = "freshcache_stale_served_total";
const METRIC_RETRY_SCHEDULED: &str = "freshcache_retry_scheduled_total";

/// What an origin fetch produces.
#[derive(Debug, Clone)]
pub struct Fetched<S> {
    pub snapshot: S,
    /// Policy input derived from the fetched content.
    pub descriptor: ContentDescriptor,
    /// Invalidation tags recorded with the cache entry.
    pub tags: Vec<String>,
}

impl<S> Fetched<S> {
    pub fn new(snapshot: S, descriptor: ContentDescriptor) -> Self {
        Self {
            snapshot,
            descriptor,
            tags: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags.extend(tags);
        self
    }
}

/// A request for cached content.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub key: CacheKey,
    pub format: OutputFormat,
    pub flags: RequestFlags,
    /// Descriptor known before fetching, if any; only used for bypass decisions.
    pub hint: Option<ContentDescriptor>,
}

impl FetchRequest {
    pub fn new(key: impl Into<CacheKey>) -> Self {
        Self {
            key: key.into(),
            format: OutputFormat::default(),
            flags: RequestFlags::default(),
            hint: None,
        }
    }

    pub fn format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn flags(mut self, flags: RequestFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn hint(mut self, hint: ContentDescriptor) -> Self {
        self.hint = Some(hint);
        self
    }
}

/// A projected value together with its cache metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Served<B> {
    pub body: B,
    pub meta: ResponseMeta,
}

/// Served projection of snapshot type `S`.
pub type ServedProjection<S> = Served<Projected<<S as Project>::Full, <S as Project>::Lite>>;

/// Fetch failure handed to every waiter of a failed flight.
#[derive(Debug, Clone)]
pub struct ServeError {
    pub error: CacheError,
    pub meta: ResponseMeta,
}

impl ServeError {
    fn new(error: CacheError) -> Self {
        Self {
            error,
            meta: ResponseMeta::origin_error(),
        }
    }
}

impl fmt::Display for ServeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for ServeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    /// Origin fetches started, including bypasses and retries.
    pub fetches: u64,
    /// Callers that attached to a flight started by someone else.
    pub joins: u64,
    pub hits: u64,
    pub stale_served: u64,
    pub retries_scheduled: u64,
}

#[derive(Default)]
struct StatCounters {
    fetches: AtomicU64,
    joins: AtomicU64,
    hits: AtomicU64,
    stale_served: AtomicU64,
    retries_scheduled: AtomicU64,
}

type FetchFn<S> = Arc<dyn Fn() -> BoxFuture<'static, Result<Fetched<S>, CacheError>> + Send + Sync>;

enum Flight<S> {
    /// Another flight stored the value while this one was starting.
    Cached { snapshot: Arc<S>, ttl: u64 },
    Fresh { snapshot: Arc<S>, ttl: u64 },
    Stale { snapshot: Arc<S> },
    Failed(CacheError),
}

impl<S> Clone for Flight<S> {
    fn clone(&self) -> Self {
        match self {
            Flight::Cached { snapshot, ttl } => Flight::Cached {
                snapshot: Arc::clone(snapshot),
                ttl: *ttl,
            },
            Flight::Fresh { snapshot, ttl } => Flight::Fresh {
                snapshot: Arc::clone(snapshot),
                ttl: *ttl,
            },
            Flight::Stale { snapshot } => Flight::Stale {
                snapshot: Arc::clone(snapshot),
            },
            Flight::Failed(error) => Flight::Failed(error.clone()),
        }
    }
}

struct InFlightFetch<S> {
    id: u64,
    future: Shared<BoxFuture<'static, Flight<S>>>,
    started_at: Instant,
}

/// Removes its flight from the map however the fetch task ends.
struct FlightGuard<S> {
    key: String,
    id: u64,
    flights: Arc<DashMap<String, InFlightFetch<S>>>,
}

impl<S> Drop for FlightGuard<S> {
    fn drop(&mut self) {
        if let Some((_, flight)) = self.flights.remove_if(&self.key, |_, flight| flight.id == self.id) {
            debug!(
                key = %self.key,
                elapsed_ms = flight.started_at.elapsed().as_millis() as u64,
                "Flight finished"
            );
        }
    }
}

struct RetryGuard {
    key: String,
    pending: Arc<DashMap<String, ()>>,
}

impl Drop for RetryGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}

struct Inner<S> {
    store: Arc<CacheStore>,
    policy: TtlPolicy,
    fetch_timeout: Duration,
    retry_delay: Duration,
    flights: Arc<DashMap<String, InFlightFetch<S>>>,
    pending_retries: Arc<DashMap<String, ()>>,
    next_flight_id: AtomicU64,
    stats: StatCounters,
}

/// Per-process fetch coordinator for snapshots of type `S`.
pub struct FetchCoordinator<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for FetchCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> FetchCoordinator<S>
where
    S: Project + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(store: Arc<CacheStore>, policy: TtlPolicy, config: &CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                policy,
                fetch_timeout: config.fetch_timeout(),
                retry_delay: config.retry_delay(),
                flights: Arc::new(DashMap::new()),
                pending_retries: Arc::new(DashMap::new()),
                next_flight_id: AtomicU64::new(0),
                stats: StatCounters::default(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }

    pub fn policy(&self) -> &TtlPolicy {
        &self.inner.policy
    }

    /// Flights currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.flights.len()
    }

    pub fn stats(&self) -> CoordinatorStats {
        let stats = &self.inner.stats;
        CoordinatorStats {
            fetches: stats.fetches.load(Ordering::Relaxed),
            joins: stats.joins.load(Ordering::Relaxed),
            hits: stats.hits.load(Ordering::Relaxed),
            stale_served: stats.stale_served.load(Ordering::Relaxed),
            retries_scheduled: stats.retries_scheduled.load(Ordering::Relaxed),
        }
    }

    /// Serve `request` from the cache, or through a single shared call to `fetcher`.
    pub async fn get<F, Fut, E>(
        &self,
        request: FetchRequest,
        fetcher: F,
    ) -> Result<ServedProjection<S>, ServeError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Fetched<S>, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let fetch = erase(fetcher);
        let key = request.key.as_str();

        if self
            .inner
            .policy
            .should_bypass(request.hint.as_ref(), &request.flags)
        {
            debug!(key, "Bypassing cache");
            return self.bypass(key, fetch, request.format).await;
        }

        if let Some(entry) = self.inner.store.get_entry::<S>(key).await {
            self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Served {
                body: project(&entry.value, request.format),
                meta: ResponseMeta::hit(entry.ttl_seconds),
            });
        }

        let flight = self.join_or_start(key, fetch).await;
        self.resolve(key, flight, request.format)
    }

    /// Like [`get`](Self::get), but serves `fallback` marked `origin-error`
    /// when the fetch fails with nothing stale to offer.
    pub async fn get_or_fallback<F, Fut, E>(
        &self,
        request: FetchRequest,
        fetcher: F,
        fallback: &S,
    ) -> ServedProjection<S>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Fetched<S>, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let format = request.format;
        match self.get(request, fetcher).await {
            Ok(served) => served,
            Err(err) => Served {
                body: project(fallback, format),
                meta: err.meta,
            },
        }
    }

    async fn bypass(
        &self,
        key: &str,
        fetch: FetchFn<S>,
        format: OutputFormat,
    ) -> Result<ServedProjection<S>, ServeError> {
        self.inner.stats.fetches.fetch_add(1, Ordering::Relaxed);
        match self.inner.fetch_once(key, &fetch, "bypass").await {
            Ok(fetched) => Ok(Served {
                body: project(&fetched.snapshot, format),
                meta: ResponseMeta::origin(0),
            }),
            Err(err) => Err(ServeError::new(err)),
        }
    }

    async fn join_or_start(&self, key: &str, fetch: FetchFn<S>) -> Flight<S> {
        let future = match self.inner.flights.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                self.inner.stats.joins.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_JOIN).increment(1);
                debug!(key, "Joined in-flight fetch");
                occupied.get().future.clone()
            }
            Entry::Vacant(vacant) => {
                let id = self.inner.next_flight_id.fetch_add(1, Ordering::Relaxed);
                let future = Inner::start_flight(&self.inner, key.to_string(), id, fetch);
                vacant.insert(InFlightFetch {
                    id,
                    future: future.clone(),
                    started_at: Instant::now(),
                });
                future
            }
        };

        future.await
    }

    fn resolve(
        &self,
        key: &str,
        flight: Flight<S>,
        format: OutputFormat,
    ) -> Result<ServedProjection<S>, ServeError> {
        match flight {
            Flight::Cached { snapshot, ttl } => Ok(Served {
                body: project(snapshot.as_ref(), format),
                meta: ResponseMeta::hit(ttl),
            }),
            Flight::Fresh { snapshot, ttl } => Ok(Served {
                body: project(snapshot.as_ref(), format),
                meta: ResponseMeta::origin(ttl),
            }),
            Flight::Stale { snapshot } => {
                self.inner.stats.stale_served.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_STALE_SERVED).increment(1);
                debug!(key, "Serving stale value");
                Ok(Served {
                    body: project(snapshot.as_ref(), format),
                    meta: ResponseMeta::stale(),
                })
            }
            Flight::Failed(error) => Err(ServeError::new(error)),
        }
    }
}

impl<S> Inner<S>
where
    S: Project + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Spawn the fetch task. Performs no I/O itself, so it may run while the
    /// in-flight map entry is held.
    fn start_flight(
        inner: &Arc<Self>,
        key: String,
        id: u64,
        fetch: FetchFn<S>,
    ) -> Shared<BoxFuture<'static, Flight<S>>> {
        let task_inner = Arc::clone(inner);
        let guard = FlightGuard {
            key: key.clone(),
            id,
            flights: Arc::clone(&inner.flights),
        };

        let handle = tokio::spawn(async move {
            let _guard = guard;
            task_inner.run_flight(&key, fetch).await
        });

        async move {
            handle.await.unwrap_or_else(|err| {
                warn!(error = %err, "Fetch task ended abnormally");
                Flight::Failed(CacheError::fetch(format!("fetch task failed: {err}")))
            })
        }
        .boxed()
        .shared()
    }

    async fn run_flight(self: &Arc<Self>, key: &str, fetch: FetchFn<S>) -> Flight<S> {
        let generation = self.store.generation();

        if let Some(entry) = self.store.get_entry::<S>(key).await {
            return Flight::Cached {
                snapshot: Arc::new(entry.value),
                ttl: entry.ttl_seconds,
            };
        }

        self.stats.fetches.fetch_add(1, Ordering::Relaxed);
        match self.fetch_once(key, &fetch, "flight").await {
            Ok(fetched) => {
                let ttl = self.write_back(key, &fetched, generation).await;
                Flight::Fresh {
                    snapshot: Arc::new(fetched.snapshot),
                    ttl,
                }
            }
            Err(error) => match self.store.get_stale::<S>(key) {
                Some(entry) => {
                    self.schedule_retry(key, fetch);
                    Flight::Stale {
                        snapshot: Arc::new(entry.value),
                    }
                }
                None => Flight::Failed(error),
            },
        }
    }

    /// Store a fetched value unless it is urgent or an invalidation covering
    /// it overlapped the fetch. Returns the TTL to advertise.
    async fn write_back(&self, key: &str, fetched: &Fetched<S>, generation: u64) -> u64 {
        if self
            .policy
            .should_bypass(Some(&fetched.descriptor), &RequestFlags::default())
        {
            debug!(key, "Urgent content, skipping cache write");
            return 0;
        }

        let ttl = self.policy.ttl_for(&fetched.descriptor);
        if self
            .store
            .invalidated_since(generation, key, &fetched.tags)
        {
            info!(key, "Invalidation overlapped fetch, skipping cache write");
            return ttl;
        }

        self.store
            .set_tagged(key, &fetched.snapshot, ttl, &fetched.tags)
            .await;
        ttl
    }

    async fn fetch_once(
        &self,
        key: &str,
        fetch: &FetchFn<S>,
        mode: &'static str,
    ) -> Result<Fetched<S>, CacheError> {
        let started_at = Instant::now();
        let result = match tokio::time::timeout(self.fetch_timeout, fetch()).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::timeout(self.fetch_timeout)),
        };
        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_FETCH_MS, "mode" => mode).record(elapsed_ms);

        let outcome = match &result {
            Ok(_) => "success",
            Err(err) => err.kind(),
        };
        counter!(METRIC_FETCH, "outcome" => outcome, "mode" => mode).increment(1);

        match &result {
            Ok(_) => info!(key, mode, outcome, elapsed_ms, "Origin fetch completed"),
            Err(err) => warn!(key, mode, outcome, elapsed_ms, error = %err, "Origin fetch failed"),
        }
        result
    }

    /// At most one pending retry per key.
    fn schedule_retry(self: &Arc<Self>, key: &str, fetch: FetchFn<S>) {
        match self.pending_retries.entry(key.to_string()) {
            Entry::Occupied(_) => {
                debug!(key, "Retry already pending");
                return;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(());
            }
        }

        self.stats.retries_scheduled.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_RETRY_SCHEDULED).increment(1);

        let inner = Arc::clone(self);
        let guard = RetryGuard {
            key: key.to_string(),
            pending: Arc::clone(&self.pending_retries),
        };
        tokio::spawn(async move {
            tokio::time::sleep(inner.retry_delay).await;

            let generation = inner.store.generation();
            inner.stats.fetches.fetch_add(1, Ordering::Relaxed);
            if let Ok(fetched) = inner.fetch_once(&guard.key, &fetch, "retry").await {
                inner.write_back(&guard.key, &fetched, generation).await;
            }
        });
    }
}

fn erase<S, F, Fut, E>(fetcher: F) -> FetchFn<S>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Fetched<S>, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    Arc::new(move || {
        fetcher()
            .map(|result| result.map_err(|err| CacheError::fetch(err.to_string())))
            .boxed()
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use freshcache_types::{ContentType, Priority, RequesterRole};

    use super::*;
    use crate::domain::content::ContentFeed;

    fn coordinator() -> FetchCoordinator<ContentFeed> {
        let config = CacheConfig::default();
        let store = Arc::new(CacheStore::in_memory(&config));
        FetchCoordinator::new(store, TtlPolicy::default(), &config)
    }

    fn counting_fetcher(
        calls: Arc<AtomicUsize>,
        descriptor: ContentDescriptor,
    ) -> impl Fn() -> BoxFuture<'static, Result<Fetched<ContentFeed>, String>> + Send + Sync + 'static
    {
        move || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Fetched::new(
                    ContentFeed::new(Vec::new(), time::OffsetDateTime::UNIX_EPOCH),
                    descriptor,
                ))
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn second_request_is_a_hit() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting_fetcher(calls.clone(), ContentDescriptor::new(ContentType::Home));

        let first = coordinator
            .get(FetchRequest::new("home"), fetcher)
            .await
            .expect("first");
        let fetcher = counting_fetcher(calls.clone(), ContentDescriptor::new(ContentType::Home));
        let second = coordinator
            .get(FetchRequest::new("home").format(OutputFormat::Lite), fetcher)
            .await
            .expect("second");

        assert_eq!(first.meta, ResponseMeta::origin(60));
        assert_eq!(second.meta, ResponseMeta::hit(60));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.stats().hits, 1);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn bypass_never_touches_the_store() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let request = FetchRequest::new("home").flags(RequestFlags::with_role(RequesterRole::Editor));

        let served = coordinator
            .get(
                request,
                counting_fetcher(calls.clone(), ContentDescriptor::new(ContentType::Home)),
            )
            .await
            .expect("bypass fetch");

        assert_eq!(served.meta, ResponseMeta::origin(0));
        assert!(
            coordinator
                .store()
                .get::<ContentFeed>("home")
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn urgent_content_is_served_but_not_stored() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let urgent = ContentDescriptor::new(ContentType::Article).priority(Priority::Urgent);

        let served = coordinator
            .get(FetchRequest::new("article:id=1"), counting_fetcher(calls.clone(), urgent))
            .await
            .expect("urgent fetch");

        assert_eq!(served.meta, ResponseMeta::origin(0));
        assert!(
            coordinator
                .store()
                .get::<ContentFeed>("article:id=1")
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let coordinator = coordinator();
        let failing = || async { Err::<Fetched<ContentFeed>, _>("origin down") };

        let err = coordinator
            .get(FetchRequest::new("latest"), failing)
            .await
            .expect_err("no stale value");
        assert_eq!(err.meta, ResponseMeta::origin_error());
        assert!(matches!(err.error, CacheError::Fetch { .. }));

        let calls = Arc::new(AtomicUsize::new(0));
        coordinator
            .get(
                FetchRequest::new("latest"),
                counting_fetcher(calls.clone(), ContentDescriptor::new(ContentType::Latest)),
            )
            .await
            .expect("recovers");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn overlapping_invalidation_skips_the_write() {
        let coordinator = coordinator();
        let store = Arc::clone(coordinator.store());
        let fetcher = move || {
            let store = Arc::clone(&store);
            async move {
                store
                    .invalidate_pattern(&crate::cache::keys::KeyPattern::parse("home*"))
                    .await;
                Ok::<_, String>(Fetched::new(
                    ContentFeed::new(Vec::new(), time::OffsetDateTime::UNIX_EPOCH),
                    ContentDescriptor::new(ContentType::Home),
                ))
            }
        };

        let served = coordinator
            .get(FetchRequest::new("home"), fetcher)
            .await
            .expect("fetch");

        assert_eq!(served.meta, ResponseMeta::origin(60));
        assert!(
            coordinator
                .store()
                .get::<ContentFeed>("home")
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn unrelated_invalidation_still_writes_back() {
        let coordinator = coordinator();
        let store = Arc::clone(coordinator.store());
        let fetcher = move || {
            let store = Arc::clone(&store);
            async move {
                store
                    .invalidate_pattern(&crate::cache::keys::KeyPattern::parse("latest:*"))
                    .await;
                store.invalidate_tags(&["content:other".to_string()]).await;
                Ok::<_, String>(
                    Fetched::new(
                        ContentFeed::new(Vec::new(), time::OffsetDateTime::UNIX_EPOCH),
                        ContentDescriptor::new(ContentType::Home),
                    )
                    .with_tags(["content:home".to_string()]),
                )
            }
        };

        coordinator
            .get(FetchRequest::new("home"), fetcher)
            .await
            .expect("fetch");

        assert!(
            coordinator
                .store()
                .get::<ContentFeed>("home")
                .await
                .is_some()
        );
    }

    #[tokio::test]
    async fn tag_invalidation_during_fetch_skips_the_write() {
        let coordinator = coordinator();
        let store = Arc::clone(coordinator.store());
        let fetcher = move || {
            let store = Arc::clone(&store);
            async move {
                store.invalidate_tags(&["content:1".to_string()]).await;
                Ok::<_, String>(
                    Fetched::new(
                        ContentFeed::new(Vec::new(), time::OffsetDateTime::UNIX_EPOCH),
                        ContentDescriptor::new(ContentType::Article),
                    )
                    .with_tags(["content:1".to_string()]),
                )
            }
        };

        coordinator
            .get(FetchRequest::new("article:id=1"), fetcher)
            .await
            .expect("fetch");

        assert!(
            coordinator
                .store()
                .get::<ContentFeed>("article:id=1")
                .await
                .is_none()
        );
    }
}
