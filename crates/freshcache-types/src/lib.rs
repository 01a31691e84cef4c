//! Shared types for the freshcache content cache.
//!
//! These types cross the boundary between the cache subsystem and its
//! collaborators: fetchers describe what they produced with a
//! [`ContentDescriptor`], request handlers pass [`RequestFlags`], and HTTP
//! layers read [`ResponseMeta`] to set downstream cache headers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Kind of content a cached result was assembled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Article,
    Video,
    Gallery,
    Featured,
    Smart,
    Home,
    Latest,
    Popular,
    Trending,
    Category,
    Tag,
    Author,
    Page,
}

impl ContentType {
    pub const ALL: [ContentType; 13] = [
        ContentType::Article,
        ContentType::Video,
        ContentType::Gallery,
        ContentType::Featured,
        ContentType::Smart,
        ContentType::Home,
        ContentType::Latest,
        ContentType::Popular,
        ContentType::Trending,
        ContentType::Category,
        ContentType::Tag,
        ContentType::Author,
        ContentType::Page,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Article => "article",
            ContentType::Video => "video",
            ContentType::Gallery => "gallery",
            ContentType::Featured => "featured",
            ContentType::Smart => "smart",
            ContentType::Home => "home",
            ContentType::Latest => "latest",
            ContentType::Popular => "popular",
            ContentType::Trending => "trending",
            ContentType::Category => "category",
            ContentType::Tag => "tag",
            ContentType::Author => "author",
            ContentType::Page => "page",
        }
    }

    /// Taxonomy and standalone pages that change rarely.
    pub fn is_static(self) -> bool {
        matches!(
            self,
            ContentType::Category | ContentType::Tag | ContentType::Author | ContentType::Page
        )
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ContentType::ALL
            .into_iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| UnknownVariant::new("content type", value))
    }
}

/// Editorial priority attached to a piece of content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl FromStr for Priority {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        [
            Priority::Low,
            Priority::Normal,
            Priority::High,
            Priority::Urgent,
        ]
        .into_iter()
        .find(|candidate| candidate.as_str().eq_ignore_ascii_case(value))
        .ok_or_else(|| UnknownVariant::new("priority", value))
    }
}

/// Policy input describing a fetched result.
///
/// Built by the caller from domain data. The legacy breaking-news flags are
/// expected to be folded into `is_breaking` before a descriptor is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentDescriptor {
    pub is_breaking: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub published_at: Option<OffsetDateTime>,
    pub content_type: ContentType,
    #[serde(default)]
    pub priority: Priority,
}

impl ContentDescriptor {
    pub fn new(content_type: ContentType) -> Self {
        Self {
            is_breaking: false,
            published_at: None,
            content_type,
            priority: Priority::Normal,
        }
    }

    pub fn breaking(mut self, is_breaking: bool) -> Self {
        self.is_breaking = is_breaking;
        self
    }

    pub fn published_at(mut self, published_at: OffsetDateTime) -> Self {
        self.published_at = Some(published_at);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Role of whoever issued the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequesterRole {
    #[default]
    Anonymous,
    Subscriber,
    Editor,
    Admin,
}

impl RequesterRole {
    /// Editorial roles always see origin data.
    pub fn is_elevated(self) -> bool {
        matches!(self, RequesterRole::Editor | RequesterRole::Admin)
    }
}

impl FromStr for RequesterRole {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "anonymous" => Ok(RequesterRole::Anonymous),
            "subscriber" => Ok(RequesterRole::Subscriber),
            "editor" => Ok(RequesterRole::Editor),
            "admin" => Ok(RequesterRole::Admin),
            _ => Err(UnknownVariant::new("requester role", value)),
        }
    }
}

/// Per-request switches that influence cache use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFlags {
    /// Explicit `no-cache` request (e.g. `Cache-Control: no-cache` or `?nocache=1`).
    #[serde(default)]
    pub no_cache: bool,
    #[serde(default)]
    pub role: RequesterRole,
}

impl RequestFlags {
    pub fn no_cache() -> Self {
        Self {
            no_cache: true,
            ..Self::default()
        }
    }

    pub fn with_role(role: RequesterRole) -> Self {
        Self {
            role,
            ..Self::default()
        }
    }
}

/// Output shape requested by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Full,
    Lite,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Full => "full",
            OutputFormat::Lite => "lite",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "full" => Ok(OutputFormat::Full),
            "lite" => Ok(OutputFormat::Lite),
            _ => Err(UnknownVariant::new("output format", value)),
        }
    }
}

/// Where a served value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheSource {
    Cache,
    Origin,
    Stale,
    OriginError,
}

impl CacheSource {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheSource::Cache => "cache",
            CacheSource::Origin => "origin",
            CacheSource::Stale => "stale",
            CacheSource::OriginError => "origin-error",
        }
    }
}

impl fmt::Display for CacheSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata surfaced to HTTP callers for `Cache-Control`/CDN headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    pub cached: bool,
    pub source: CacheSource,
    pub ttl_seconds: u64,
}

impl ResponseMeta {
    pub fn hit(ttl_seconds: u64) -> Self {
        Self {
            cached: true,
            source: CacheSource::Cache,
            ttl_seconds,
        }
    }

    pub fn origin(ttl_seconds: u64) -> Self {
        Self {
            cached: false,
            source: CacheSource::Origin,
            ttl_seconds,
        }
    }

    pub fn stale() -> Self {
        Self {
            cached: true,
            source: CacheSource::Stale,
            ttl_seconds: 0,
        }
    }

    pub fn origin_error() -> Self {
        Self {
            cached: false,
            source: CacheSource::OriginError,
            ttl_seconds: 0,
        }
    }
}

/// Returned by the `FromStr` impls in this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} `{}`", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}
