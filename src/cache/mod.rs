//! Freshcache cache system
//!
//! Guards expensive content assembly for a publishing site:
//!
//! - **Policy**: how long a result may be reused, and when to skip the cache
//! - **Store**: key-value cache over a pluggable backend (memory or edge KV)
//! - **Coordinator**: single-flight fetches with stale fallback
//! - **Projector**: `full` and `lite` shapes from one cached snapshot
//! - **Bus**: content mutations turned into store purges
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `freshcache.toml`:
//!
//! ```toml
//! [cache]
//! enabled = true
//! memory_capacity = 10000
//! fetch_timeout_ms = 5000
//! # ... see config.rs for all options
//!
//! [policy]
//! breaking_seconds = 30
//! ```

pub mod backend;
mod bus;
mod config;
mod coordinator;
mod error;
mod events;
pub mod keys;
mod lock;
mod planner;
mod policy;
pub mod projector;
mod store;

pub use backend::{CacheBackend, EdgeKvBackend, EdgeKvConfig, MemoryBackend};
pub use bus::{InvalidationBus, InvalidationReport};
pub use config::CacheConfig;
pub use coordinator::{
    CoordinatorStats, FetchCoordinator, FetchRequest, Fetched, ServeError, Served,
    ServedProjection,
};
pub use error::{CacheError, StoreError};
pub use events::{
    BREAKING_NAMESPACE, ContentMutation, Epoch, EventQueue, InvalidationEvent, InvalidationTarget,
};
pub use keys::{CacheKey, CacheKeyBuilder, KeyPattern};
pub use planner::InvalidationPlan;
pub use policy::{MAX_TTL_SECS, TtlPolicy};
pub use projector::{Project, Projected, project};
pub use store::{CacheEntry, CacheStore, PurgeOutcome};
