use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::ops::Bound;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use tokio::time::Instant;

use super::{CacheBackend, deadline_after};
use crate::cache::error::StoreError;
use crate::cache::keys::tags;
use crate::cache::lock::lock_recovering;

const SOURCE: &str = "cache::backend::memory";

struct MemoryEntry {
    value: Bytes,
    expires_at: Instant,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// LRU of data entries plus the tag markers that point into it.
///
/// Markers sit outside the LRU: they are never read on the hot path, so
/// recency would evict them ahead of their data. They leave together with
/// the data key they mark.
struct MemoryState {
    entries: LruCache<String, MemoryEntry>,
    markers: BTreeMap<String, Instant>,
    /// Data key to the markers naming it.
    marked_by: HashMap<String, BTreeSet<String>>,
}

impl MemoryState {
    fn lookup(&mut self, key: &str, now: Instant) -> Option<Bytes> {
        if tags::is_marker(key) {
            return self
                .markers
                .get(key)
                .filter(|expires_at| now < **expires_at)
                .map(|_| Bytes::new());
        }

        let live = self
            .entries
            .get(key)
            .map(|entry| entry.is_live(now).then(|| entry.value.clone()));
        match live {
            Some(Some(value)) => Some(value),
            Some(None) => {
                self.remove_data(key);
                None
            }
            None => None,
        }
    }

    fn insert(&mut self, key: &str, value: Bytes, expires_at: Instant) {
        if tags::is_marker(key) {
            if let Some(data_key) = tags::marked_key(key) {
                self.markers.insert(key.to_string(), expires_at);
                self.marked_by
                    .entry(data_key.to_string())
                    .or_default()
                    .insert(key.to_string());
            }
            return;
        }

        if let Some((evicted, _)) = self
            .entries
            .push(key.to_string(), MemoryEntry { value, expires_at })
            && evicted != key
        {
            self.forget_markers(&evicted);
        }
    }

    fn remove(&mut self, key: &str) {
        if !tags::is_marker(key) {
            self.remove_data(key);
            return;
        }

        self.markers.remove(key);
        if let Some(data_key) = tags::marked_key(key)
            && let Some(markers) = self.marked_by.get_mut(data_key)
        {
            markers.remove(key);
            if markers.is_empty() {
                self.marked_by.remove(data_key);
            }
        }
    }

    fn remove_data(&mut self, key: &str) {
        self.entries.pop(key);
        self.forget_markers(key);
    }

    fn forget_markers(&mut self, data_key: &str) {
        for marker in self.marked_by.remove(data_key).unwrap_or_default() {
            self.markers.remove(&marker);
        }
    }
}

/// Bounded in-process backend.
///
/// Least recently used entries are evicted at capacity, taking their tag
/// markers with them. Deadlines use the monotonic tokio clock, so wall-clock
/// jumps never revive or expire entries.
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                entries: LruCache::new(capacity),
                markers: BTreeMap::new(),
                marked_by: HashMap::new(),
            }),
        }
    }

    /// Number of stored data entries, including expired ones not yet reclaimed.
    pub fn len(&self) -> usize {
        lock_recovering(&self.state, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tag markers currently held.
    pub fn marker_count(&self) -> usize {
        lock_recovering(&self.state, SOURCE, "marker_count").markers.len()
    }

    /// Drop every expired data entry and marker, returning how many data
    /// entries were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = lock_recovering(&self.state, SOURCE, "purge_expired");
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.remove_data(key);
        }

        let stale_markers: Vec<String> = state
            .markers
            .iter()
            .filter(|(_, expires_at)| now >= **expires_at)
            .map(|(marker, _)| marker.clone())
            .collect();
        for marker in &stale_markers {
            state.remove(marker);
        }
        expired.len()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let now = Instant::now();
        Ok(lock_recovering(&self.state, SOURCE, "get").lookup(key, now))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = deadline_after(Instant::now(), ttl);
        lock_recovering(&self.state, SOURCE, "set").insert(key, value, expires_at);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        lock_recovering(&self.state, SOURCE, "delete").remove(key);
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Vec<Result<Option<Bytes>, StoreError>> {
        let now = Instant::now();
        let mut state = lock_recovering(&self.state, SOURCE, "mget");
        keys.iter().map(|key| Ok(state.lookup(key, now))).collect()
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let state = lock_recovering(&self.state, SOURCE, "keys_with_prefix");
        let data = state
            .entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
            .map(|(key, _)| key.clone());
        let markers = state
            .markers
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(marker, _)| marker.starts_with(prefix))
            .filter(|(_, expires_at)| now < **expires_at)
            .map(|(marker, _)| marker.clone());
        Ok(data.chain(markers).collect())
    }
}
