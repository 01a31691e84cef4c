use std::time::Duration;

use thiserror::Error;

/// Failure inside a cache backend.
///
/// Never reaches callers of [`CacheStore`](super::CacheStore) read or write
/// paths: the store logs it and degrades to a miss.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("{backend} backend unavailable during `{op}`: {message}")]
    Unavailable {
        backend: &'static str,
        op: &'static str,
        message: String,
    },
    #[error("{backend} backend answered `{op}` with status {status}")]
    Status {
        backend: &'static str,
        op: &'static str,
        status: u16,
    },
    #[error("failed to encode cache entry: {0}")]
    Encode(String),
    #[error("failed to decode cache entry: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn unavailable(backend: &'static str, op: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            backend,
            op,
            message: message.into(),
        }
    }

    pub fn status(backend: &'static str, op: &'static str, status: u16) -> Self {
        Self::Status {
            backend,
            op,
            status,
        }
    }
}

/// Typed failure handed to callers of the fetch coordinator.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("origin fetch failed: {message}")]
    Fetch { message: String },
    #[error("origin fetch timed out after {}ms", .after.as_millis())]
    Timeout { after: Duration },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CacheError {
    pub fn fetch(message: impl Into<String>) -> Self {
        Self::Fetch {
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::Timeout { after }
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::Fetch { .. } => "fetch_error",
            CacheError::Timeout { .. } => "timeout",
            CacheError::Store(_) => "store_error",
        }
    }
}
