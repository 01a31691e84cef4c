//! Cache key, tag and pattern definitions.
//!
//! Keys are plain strings shaped `namespace:param=value:...`. The output
//! format is deliberately absent from keys: every format is projected from the
//! same cached snapshot.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use freshcache_types::ContentType;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Keys longer than this collapse their parameters into a digest.
pub const MAX_KEY_LEN: usize = 200;

/// Namespace of the marker keys that record tag membership in the backend.
pub const TAG_MARKER_PREFIX: &str = "__tag:";

const TAG_MARKER_SEPARATOR: char = '|';

/// Opaque cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Start composing a key for `namespace` (e.g. `featured`, `home`).
    pub fn builder(namespace: impl Into<String>) -> CacheKeyBuilder {
        CacheKeyBuilder {
            namespace: namespace.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Text before the first `:`.
    pub fn namespace(&self) -> &str {
        self.0.split(':').next().unwrap_or_default()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Builder producing deterministic keys: parameters are sorted by name so the
/// insertion order at call sites never splits a shared fetch.
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    namespace: String,
    params: BTreeMap<String, String>,
}

impl CacheKeyBuilder {
    pub fn param(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    pub fn build(self) -> CacheKey {
        let params = self
            .params
            .iter()
            .map(|(name, value)| format!("{}={}", escape(name), escape(value)))
            .collect::<Vec<_>>()
            .join(":");

        let namespace = escape(&self.namespace);
        let full = if params.is_empty() {
            namespace.clone()
        } else {
            format!("{namespace}:{params}")
        };

        if full.len() <= MAX_KEY_LEN {
            return CacheKey(full);
        }

        let mut hasher = Sha256::new();
        hasher.update(params.as_bytes());
        let digest = hex::encode(hasher.finalize());
        CacheKey(format!("{namespace}:#{digest}"))
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            '=' => out.push_str("%3D"),
            '|' => out.push_str("%7C"),
            '*' => out.push_str("%2A"),
            other => out.push(other),
        }
    }
    out
}

/// Conventional tag names attached to cache entries.
pub mod tags {
    use super::*;

    /// Every entry containing the content item `id`.
    pub fn content(id: Uuid) -> String {
        format!("content:{id}")
    }

    /// Every entry assembled from content of `content_type`.
    pub fn content_type(content_type: ContentType) -> String {
        format!("type:{content_type}")
    }

    /// Every entry that depends on a taxonomy term or page (`category:world`).
    pub fn taxonomy(content_type: ContentType, slug: &str) -> String {
        format!("{content_type}:{slug}")
    }

    /// Backend key recording that `key` carries `tag`.
    pub fn marker_key(tag: &str, key: &str) -> String {
        format!("{}{key}", marker_prefix(tag))
    }

    /// Listing prefix for all markers of `tag`.
    pub fn marker_prefix(tag: &str) -> String {
        format!("{TAG_MARKER_PREFIX}{}{TAG_MARKER_SEPARATOR}", escape(tag))
    }

    /// Recover the data key from a marker listed under `marker_prefix(tag)`.
    pub fn key_from_marker<'a>(tag: &str, marker: &'a str) -> Option<&'a str> {
        marker.strip_prefix(marker_prefix(tag).as_str())
    }

    pub fn is_marker(key: &str) -> bool {
        key.starts_with(TAG_MARKER_PREFIX)
    }

    /// Data key a marker points at, whatever its tag. Escaped tags never
    /// contain the separator, so the first one ends the tag.
    pub fn marked_key(marker: &str) -> Option<&str> {
        marker
            .strip_prefix(TAG_MARKER_PREFIX)?
            .split_once(TAG_MARKER_SEPARATOR)
            .map(|(_, key)| key)
    }
}

/// Key selector accepted by pattern invalidation.
///
/// `*` matches every key, a trailing `*` matches by prefix, anything else is an
/// exact key. Tag marker keys are never matched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPattern {
    All,
    Prefix(String),
    Exact(String),
}

impl KeyPattern {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw == "*" {
            KeyPattern::All
        } else if let Some(prefix) = raw.strip_suffix('*') {
            KeyPattern::Prefix(prefix.to_string())
        } else {
            KeyPattern::Exact(raw.to_string())
        }
    }

    /// Prefix pattern for a namespace: `home` becomes `home:*`.
    pub fn namespace(namespace: &str) -> Self {
        KeyPattern::Prefix(format!("{}:", escape(namespace)))
    }

    pub fn matches(&self, key: &str) -> bool {
        if tags::is_marker(key) {
            return false;
        }
        match self {
            KeyPattern::All => true,
            KeyPattern::Prefix(prefix) => key.starts_with(prefix.as_str()),
            KeyPattern::Exact(exact) => key == exact,
        }
    }

    /// Whether every key matched by `other` is also matched by `self`.
    pub fn subsumes(&self, other: &KeyPattern) -> bool {
        match (self, other) {
            (KeyPattern::All, _) => true,
            (KeyPattern::Prefix(_), KeyPattern::All) => false,
            (KeyPattern::Prefix(prefix), KeyPattern::Prefix(other)) => other.starts_with(prefix.as_str()),
            (KeyPattern::Prefix(prefix), KeyPattern::Exact(exact)) => exact.starts_with(prefix.as_str()),
            (KeyPattern::Exact(exact), KeyPattern::Exact(other)) => exact == other,
            (KeyPattern::Exact(_), _) => false,
        }
    }

    /// Prefix to list from the backend; `None` for exact keys.
    pub fn list_prefix(&self) -> Option<&str> {
        match self {
            KeyPattern::All => Some(""),
            KeyPattern::Prefix(prefix) => Some(prefix),
            KeyPattern::Exact(_) => None,
        }
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPattern::All => f.write_str("*"),
            KeyPattern::Prefix(prefix) => write!(f, "{prefix}*"),
            KeyPattern::Exact(exact) => f.write_str(exact),
        }
    }
}

impl From<&str> for KeyPattern {
    fn from(value: &str) -> Self {
        KeyPattern::parse(value)
    }
}
