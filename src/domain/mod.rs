//! Domain layer: content snapshots served through the cache.

pub mod content;
