//! Key-value backends behind the cache store.
//!
//! A backend moves opaque bytes and enforces expiry itself; encoding, tags and
//! error absorption live one layer up in [`CacheStore`](super::CacheStore).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use tokio::time::Instant;

use super::error::StoreError;

mod edge_kv;
mod memory;

pub use edge_kv::{EdgeKvBackend, EdgeKvConfig};
pub use memory::MemoryBackend;

/// Furthest a deadline is ever pushed out.
const MAX_RETENTION: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `now + ttl`, clamped so that huge lifetimes never overflow the clock.
pub(crate) fn deadline_after(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(MAX_RETENTION))
        .unwrap_or(now)
}

/// Storage technology behind a [`CacheStore`](super::CacheStore).
///
/// Implementations must never return a value whose TTL has elapsed.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short backend name used in logs and errors.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Store `value` under `key`, expiring after `ttl`.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError>;

    /// Remove `key`. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Batch read, one result per requested key in request order.
    ///
    /// Backends without native batching inherit parallel single reads.
    async fn mget(&self, keys: &[String]) -> Vec<Result<Option<Bytes>, StoreError>> {
        join_all(keys.iter().map(|key| self.get(key))).await
    }

    /// Every live key starting with `prefix` (`""` lists everything).
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
