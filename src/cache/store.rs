//! Cache store.
//!
//! One injected store fronts a [`CacheBackend`]. Values are wrapped in a JSON
//! [`CacheEntry`]; backend failures never reach callers and degrade to a miss
//! on read or a logged no-op on write.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use lru::LruCache;
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::backend::{CacheBackend, MemoryBackend, deadline_after};
use super::config::CacheConfig;
use super::error::StoreError;
use super::keys::{KeyPattern, tags};
use super::lock::lock_recovering;

const SOURCE: &str = "cache::store";
const METRIC_STORE_HIT: &str = "freshcache_store_hit_total";
const METRIC_STORE_MISS: &str = "freshcache_store_miss_total";
const METRIC_STORE_ERROR: &str = "freshcache_store_error_total";
const METRIC_INVALIDATED_KEYS: &str = "freshcache_invalidated_keys_total";
/// Invalidations remembered for write-back checks. Older history is treated
/// as overlapping everything.
const PURGE_LOG_LEN: usize = 256;

/// Stored form of a cached value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub value: T,
    /// Informational only; expiry is enforced by the backend.
    #[serde(with = "time::serde::rfc3339")]
    pub stored_at: OffsetDateTime,
    pub ttl_seconds: u64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

/// Result of a purge against the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    /// Data keys removed.
    pub removed: usize,
    /// Deletions the backend rejected.
    pub failed: usize,
}

/// What one invalidation covered.
#[derive(Debug)]
enum PurgeScope {
    Key(String),
    Pattern(KeyPattern),
    Tags(Vec<String>),
}

impl PurgeScope {
    fn covers(&self, key: &str, entry_tags: &[String]) -> bool {
        match self {
            PurgeScope::Key(purged) => purged == key,
            PurgeScope::Pattern(pattern) => pattern.matches(key),
            PurgeScope::Tags(purged) => entry_tags.iter().any(|tag| purged.contains(tag)),
        }
    }
}

struct ShelvedEntry {
    encoded: Bytes,
    tags: BTreeSet<String>,
    retain_until: Instant,
}

/// Key-value cache with tag and pattern invalidation.
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    enabled: bool,
    stale_window: Duration,
    shelf: Mutex<LruCache<String, ShelvedEntry>>,
    generation: AtomicU64,
    purge_log: Mutex<VecDeque<(u64, PurgeScope)>>,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self {
            backend,
            enabled: config.enabled,
            stale_window: config.stale_window(),
            shelf: Mutex::new(LruCache::new(config.stale_capacity_non_zero())),
            generation: AtomicU64::new(0),
            purge_log: Mutex::new(VecDeque::with_capacity(PURGE_LOG_LEN)),
        }
    }

    /// Store backed by a fresh in-process [`MemoryBackend`].
    pub fn in_memory(config: &CacheConfig) -> Self {
        let backend = MemoryBackend::new(config.memory_capacity_non_zero());
        Self::new(Arc::new(backend), config)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Counter bumped by every invalidation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether an invalidation after `generation` covered `key` or any of
    /// `entry_tags`. A value fetched before such an invalidation must not be
    /// written back.
    pub fn invalidated_since(&self, generation: u64, key: &str, entry_tags: &[String]) -> bool {
        let log = lock_recovering(&self.purge_log, SOURCE, "invalidated_since");
        if self.generation() == generation {
            return false;
        }
        match log.front() {
            Some((oldest, _)) if *oldest <= generation + 1 => log
                .iter()
                .filter(|(purged_at, _)| *purged_at > generation)
                .any(|(_, scope)| scope.covers(key, entry_tags)),
            _ => true,
        }
    }

    /// Cached value for `key`, or `None` on absence, expiry or backend error.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_entry(key).await.map(|entry| entry.value)
    }

    /// Like [`get`](Self::get) but keeps the entry metadata.
    pub async fn get_entry<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
        if !self.enabled {
            return None;
        }

        match self.backend.get(key).await {
            Ok(Some(raw)) => match decode::<T>(&raw) {
                Ok(entry) => {
                    counter!(METRIC_STORE_HIT, "backend" => self.backend.name()).increment(1);
                    debug!(key, backend = self.backend.name(), "Cache hit");
                    Some(entry)
                }
                Err(err) => {
                    self.record_error("get", key, &err);
                    None
                }
            },
            Ok(None) => {
                counter!(METRIC_STORE_MISS, "backend" => self.backend.name()).increment(1);
                debug!(key, backend = self.backend.name(), "Cache miss");
                None
            }
            Err(err) => {
                self.record_error("get", key, &err);
                None
            }
        }
    }

    /// Batch read. Every requested key appears in the result.
    pub async fn mget<T: DeserializeOwned>(&self, keys: &[String]) -> HashMap<String, Option<T>> {
        if !self.enabled {
            return keys.iter().map(|key| (key.clone(), None)).collect();
        }

        let results = self.backend.mget(keys).await;
        keys.iter()
            .zip(results)
            .map(|(key, result)| {
                let value = match result {
                    Ok(Some(raw)) => match decode::<T>(&raw) {
                        Ok(entry) => {
                            counter!(METRIC_STORE_HIT, "backend" => self.backend.name())
                                .increment(1);
                            Some(entry.value)
                        }
                        Err(err) => {
                            self.record_error("mget", key, &err);
                            None
                        }
                    },
                    Ok(None) => {
                        counter!(METRIC_STORE_MISS, "backend" => self.backend.name()).increment(1);
                        None
                    }
                    Err(err) => {
                        self.record_error("mget", key, &err);
                        None
                    }
                };
                (key.clone(), value)
            })
            .collect()
    }

    /// Store `value` for `ttl_seconds`. A zero TTL stores nothing.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl_seconds: u64) {
        self.set_tagged(key, value, ttl_seconds, &[]).await;
    }

    /// Store `value` and record its tags as marker keys with the same TTL.
    pub async fn set_tagged<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_seconds: u64,
        entry_tags: &[String],
    ) {
        if !self.enabled || ttl_seconds == 0 {
            return;
        }

        let entry = CacheEntry {
            value,
            stored_at: OffsetDateTime::now_utc(),
            ttl_seconds,
            tags: entry_tags.iter().cloned().collect(),
        };
        let encoded = match serde_json::to_vec(&entry) {
            Ok(encoded) => Bytes::from(encoded),
            Err(err) => {
                self.record_error("set", key, &StoreError::Encode(err.to_string()));
                return;
            }
        };

        let ttl = Duration::from_secs(ttl_seconds);
        if let Err(err) = self.backend.set(key, encoded.clone(), ttl).await {
            self.record_error("set", key, &err);
            return;
        }

        let markers = entry.tags.iter().map(|tag| {
            let marker = tags::marker_key(tag, key);
            async move {
                let result = self.backend.set(&marker, Bytes::new(), ttl).await;
                (marker, result)
            }
        });
        for (marker, result) in join_all(markers).await {
            if let Err(err) = result {
                self.record_error("set_marker", &marker, &err);
            }
        }

        lock_recovering(&self.shelf, SOURCE, "shelve").put(
            key.to_string(),
            ShelvedEntry {
                encoded,
                tags: entry.tags,
                retain_until: deadline_after(Instant::now(), ttl.saturating_add(self.stale_window)),
            },
        );
    }

    pub async fn delete(&self, key: &str) {
        if let Err(err) = self.try_delete(key).await {
            self.record_error("delete", key, &err);
        }
    }

    /// Remove `key` and its stale copy, surfacing backend failures.
    pub async fn try_delete(&self, key: &str) -> Result<(), StoreError> {
        if !self.enabled {
            return Ok(());
        }
        self.bump_generation(PurgeScope::Key(key.to_string()));
        lock_recovering(&self.shelf, SOURCE, "delete").pop(key);
        self.backend.delete(key).await
    }

    /// Remove every key matched by `pattern`; returns how many were removed.
    pub async fn invalidate_pattern(&self, pattern: &KeyPattern) -> usize {
        match self.try_invalidate_pattern(pattern).await {
            Ok(outcome) => outcome.removed,
            Err(err) => {
                self.record_error("invalidate_pattern", &pattern.to_string(), &err);
                0
            }
        }
    }

    /// Pattern purge that reports listing failures and rejected deletions.
    pub async fn try_invalidate_pattern(
        &self,
        pattern: &KeyPattern,
    ) -> Result<PurgeOutcome, StoreError> {
        if !self.enabled {
            return Ok(PurgeOutcome::default());
        }
        self.bump_generation(PurgeScope::Pattern(pattern.clone()));
        self.drop_shelved(|key, _| pattern.matches(key));

        let keys = match pattern.list_prefix() {
            Some(prefix) => self
                .backend
                .keys_with_prefix(prefix)
                .await?
                .into_iter()
                .filter(|key| pattern.matches(key))
                .collect::<Vec<_>>(),
            None => {
                let mut keys = Vec::new();
                if let KeyPattern::Exact(key) = pattern
                    && pattern.matches(key)
                    && self.backend.get(key).await?.is_some()
                {
                    keys.push(key.clone());
                }
                keys
            }
        };

        let outcome = self.delete_all(&keys).await;
        counter!(METRIC_INVALIDATED_KEYS, "kind" => "pattern").increment(outcome.removed as u64);
        info!(
            pattern = %pattern,
            removed = outcome.removed,
            failed = outcome.failed,
            backend = self.backend.name(),
            "Invalidated cache pattern"
        );
        Ok(outcome)
    }

    /// Remove every key carrying any of `entry_tags`; returns how many were removed.
    pub async fn invalidate_tags(&self, entry_tags: &[String]) -> usize {
        match self.try_invalidate_tags(entry_tags).await {
            Ok(outcome) => outcome.removed,
            Err(err) => {
                self.record_error("invalidate_tags", &entry_tags.join(","), &err);
                0
            }
        }
    }

    /// Tag purge that reports listing failures and rejected deletions.
    pub async fn try_invalidate_tags(
        &self,
        entry_tags: &[String],
    ) -> Result<PurgeOutcome, StoreError> {
        if !self.enabled || entry_tags.is_empty() {
            return Ok(PurgeOutcome::default());
        }
        self.bump_generation(PurgeScope::Tags(entry_tags.to_vec()));
        self.drop_shelved(|_, shelved| entry_tags.iter().any(|tag| shelved.tags.contains(tag)));

        let mut data_keys = BTreeSet::new();
        let mut markers = Vec::new();
        for tag in entry_tags {
            let prefix = tags::marker_prefix(tag);
            for marker in self.backend.keys_with_prefix(&prefix).await? {
                if let Some(key) = tags::key_from_marker(tag, &marker) {
                    data_keys.insert(key.to_string());
                }
                markers.push(marker);
            }
        }

        let data_keys: Vec<String> = data_keys.into_iter().collect();
        {
            let mut shelf = lock_recovering(&self.shelf, SOURCE, "invalidate_tags");
            for key in &data_keys {
                shelf.pop(key.as_str());
            }
        }

        let mut outcome = self.delete_all(&data_keys).await;
        let marker_outcome = self.delete_all(&markers).await;
        outcome.failed += marker_outcome.failed;

        counter!(METRIC_INVALIDATED_KEYS, "kind" => "tag").increment(outcome.removed as u64);
        info!(
            tags = ?entry_tags,
            removed = outcome.removed,
            failed = outcome.failed,
            backend = self.backend.name(),
            "Invalidated cache tags"
        );
        Ok(outcome)
    }

    /// Last stored value for `key` while within the stale window.
    ///
    /// Never consulted by [`get`](Self::get); only failed fetches fall back here.
    pub fn get_stale<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
        let now = Instant::now();
        let mut shelf = lock_recovering(&self.shelf, SOURCE, "get_stale");
        let found = shelf
            .get(key)
            .map(|shelved| (now < shelved.retain_until).then(|| shelved.encoded.clone()));
        let encoded = match found {
            Some(Some(encoded)) => encoded,
            Some(None) => {
                shelf.pop(key);
                return None;
            }
            None => return None,
        };
        drop(shelf);

        match decode(&encoded) {
            Ok(entry) => Some(entry),
            Err(err) => {
                self.record_error("get_stale", key, &err);
                None
            }
        }
    }

    async fn delete_all(&self, keys: &[String]) -> PurgeOutcome {
        let results = join_all(keys.iter().map(|key| async move {
            (key, self.backend.delete(key).await)
        }))
        .await;

        let mut outcome = PurgeOutcome::default();
        for (key, result) in results {
            match result {
                Ok(()) => outcome.removed += 1,
                Err(err) => {
                    self.record_error("delete", key, &err);
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }

    fn drop_shelved(&self, mut predicate: impl FnMut(&str, &ShelvedEntry) -> bool) {
        let mut shelf = lock_recovering(&self.shelf, SOURCE, "drop_shelved");
        let doomed: Vec<String> = shelf
            .iter()
            .filter(|(key, shelved)| predicate(key.as_str(), shelved))
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            shelf.pop(key.as_str());
        }
    }

    fn bump_generation(&self, scope: PurgeScope) {
        let mut log = lock_recovering(&self.purge_log, SOURCE, "bump_generation");
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        if log.len() == PURGE_LOG_LEN {
            log.pop_front();
        }
        log.push_back((generation, scope));
    }

    fn record_error(&self, op: &'static str, key: &str, err: &StoreError) {
        counter!(METRIC_STORE_ERROR, "backend" => self.backend.name(), "op" => op).increment(1);
        warn!(
            op,
            key,
            backend = self.backend.name(),
            error = %err,
            "Cache store error absorbed"
        );
    }
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<CacheEntry<T>, StoreError> {
    serde_json::from_slice(raw).map_err(|err| StoreError::Decode(err.to_string()))
}
