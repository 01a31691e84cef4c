//! TTL policy.
//!
//! Maps a [`ContentDescriptor`] to a cache lifetime and decides when a request
//! must skip the cache entirely. Rules are evaluated in order; the first
//! match wins:
//!
//! 1. breaking content
//! 2. content published within the recent window
//! 3. popular / trending listings
//! 4. static content (category, tag, author, page), tiered by sub-type
//! 5. everything else

use freshcache_types::{ContentDescriptor, ContentType, Priority, RequestFlags};
use time::OffsetDateTime;

const BREAKING_TTL_SECS: u64 = 30;
const RECENT_TTL_SECS: u64 = 60;
const RECENT_WINDOW_SECS: u64 = 3_600;
const POPULAR_TTL_SECS: u64 = 300;
const CATEGORY_TTL_SECS: u64 = 3_600;
const TAG_TTL_SECS: u64 = 7_200;
const AUTHOR_TTL_SECS: u64 = 21_600;
const PAGE_TTL_SECS: u64 = 86_400;
const DEFAULT_TTL_SECS: u64 = 60;

/// Largest lifetime any configured tier may take: one year.
pub const MAX_TTL_SECS: u64 = 31_536_000;

/// Tier values used by the policy, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub breaking: u64,
    pub recent: u64,
    pub recent_window: u64,
    pub popular: u64,
    pub category: u64,
    pub tag: u64,
    pub author: u64,
    pub page: u64,
    pub default: u64,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            breaking: BREAKING_TTL_SECS,
            recent: RECENT_TTL_SECS,
            recent_window: RECENT_WINDOW_SECS,
            popular: POPULAR_TTL_SECS,
            category: CATEGORY_TTL_SECS,
            tag: TAG_TTL_SECS,
            author: AUTHOR_TTL_SECS,
            page: PAGE_TTL_SECS,
            default: DEFAULT_TTL_SECS,
        }
    }
}

impl From<&crate::config::PolicySettings> for TtlPolicy {
    fn from(settings: &crate::config::PolicySettings) -> Self {
        Self {
            breaking: settings.breaking_seconds.get(),
            recent: settings.recent_seconds.get(),
            recent_window: settings.recent_window_seconds.get(),
            popular: settings.popular_seconds.get(),
            category: settings.category_seconds.get(),
            tag: settings.tag_seconds.get(),
            author: settings.author_seconds.get(),
            page: settings.page_seconds.get(),
            default: settings.default_seconds.get(),
        }
    }
}

impl TtlPolicy {
    /// Lifetime in seconds for `descriptor`, evaluated against the current time.
    pub fn ttl_for(&self, descriptor: &ContentDescriptor) -> u64 {
        self.ttl_for_at(descriptor, OffsetDateTime::now_utc())
    }

    /// Lifetime in seconds for `descriptor`, evaluated against `now`.
    pub fn ttl_for_at(&self, descriptor: &ContentDescriptor, now: OffsetDateTime) -> u64 {
        if descriptor.is_breaking {
            return self.breaking;
        }

        if let Some(published_at) = descriptor.published_at
            && self.is_recent(published_at, now)
        {
            return self.recent;
        }

        match descriptor.content_type {
            ContentType::Popular | ContentType::Trending => self.popular,
            ContentType::Category => self.category,
            ContentType::Tag => self.tag,
            ContentType::Author => self.author,
            ContentType::Page => self.page,
            _ => self.default,
        }
    }

    /// Whether a request must skip both cache read and write.
    ///
    /// `descriptor` is optional because the descriptor of a result is usually
    /// only known once it has been fetched; request flags alone can already
    /// force a bypass.
    pub fn should_bypass(&self, descriptor: Option<&ContentDescriptor>, flags: &RequestFlags) -> bool {
        flags.no_cache
            || flags.role.is_elevated()
            || descriptor.is_some_and(|descriptor| descriptor.priority == Priority::Urgent)
    }

    // Future timestamps count as recent: scheduled or clock-skewed content
    // should get the short tier.
    fn is_recent(&self, published_at: OffsetDateTime, now: OffsetDateTime) -> bool {
        let age = now - published_at;
        age.whole_seconds() < i64::try_from(self.recent_window).unwrap_or(i64::MAX)
    }
}
