//! Canonical content snapshots assembled by fetchers.

use freshcache_types::{ContentDescriptor, ContentType};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::keys::tags;
use crate::cache::projector::Project;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorRef {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
}

/// A single article, video, gallery or page as assembled from the content store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: Uuid,
    pub slug: String,
    pub title: String,
    pub excerpt: String,
    pub body_html: String,
    pub author: Option<AuthorRef>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub hero_image: Option<String>,
    #[serde(default)]
    pub is_breaking: bool,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub published_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub view_count: u64,
}

impl ContentItem {
    /// Policy input for this item served as `content_type`.
    pub fn descriptor(&self, content_type: ContentType) -> ContentDescriptor {
        ContentDescriptor {
            is_breaking: self.is_breaking,
            published_at: self.published_at,
            content_type,
            priority: Default::default(),
        }
    }

    /// Invalidation tag for this item.
    pub fn cache_tag(&self) -> String {
        tags::content(self.id)
    }
}

/// An ordered listing (home, latest, featured, smart, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentFeed {
    pub items: Vec<ContentItem>,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
}

impl ContentFeed {
    pub fn new(items: Vec<ContentItem>, generated_at: OffsetDateTime) -> Self {
        Self {
            items,
            generated_at,
        }
    }

    /// A feed is as volatile as its most volatile item: breaking if any item
    /// is, and as recent as its newest publication.
    pub fn descriptor(&self, content_type: ContentType) -> ContentDescriptor {
        ContentDescriptor {
            is_breaking: self.items.iter().any(|item| item.is_breaking),
            published_at: self.items.iter().filter_map(|item| item.published_at).max(),
            content_type,
            priority: Default::default(),
        }
    }

    /// One content tag per item plus the listing's type tag.
    pub fn cache_tags(&self, content_type: ContentType) -> Vec<String> {
        let mut out: Vec<String> = self.items.iter().map(ContentItem::cache_tag).collect();
        out.push(tags::content_type(content_type));
        out.sort();
        out.dedup();
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemFull {
    pub id: Uuid,
    pub slug: String,
    pub title: String,
    pub excerpt: String,
    pub body_html: String,
    pub author: Option<AuthorRef>,
    pub tags: Vec<String>,
    pub hero_image: Option<String>,
    pub is_breaking: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub published_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub view_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemLite {
    pub id: Uuid,
    pub slug: String,
    pub title: String,
    pub excerpt: String,
    pub thumbnail: Option<String>,
    pub is_breaking: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub published_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedFull {
    pub items: Vec<ItemFull>,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedLite {
    pub items: Vec<ItemLite>,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
}

impl Project for ContentItem {
    type Full = ItemFull;
    type Lite = ItemLite;

    fn full(&self) -> ItemFull {
        ItemFull {
            id: self.id,
            slug: self.slug.clone(),
            title: self.title.clone(),
            excerpt: self.excerpt.clone(),
            body_html: self.body_html.clone(),
            author: self.author.clone(),
            tags: self.tags.clone(),
            hero_image: self.hero_image.clone(),
            is_breaking: self.is_breaking,
            published_at: self.published_at,
            updated_at: self.updated_at,
            view_count: self.view_count,
        }
    }

    fn lite(&self) -> ItemLite {
        ItemLite {
            id: self.id,
            slug: self.slug.clone(),
            title: self.title.clone(),
            excerpt: self.excerpt.clone(),
            thumbnail: self.hero_image.clone(),
            is_breaking: self.is_breaking,
            published_at: self.published_at,
            updated_at: self.updated_at,
        }
    }
}

impl Project for ContentFeed {
    type Full = FeedFull;
    type Lite = FeedLite;

    fn full(&self) -> FeedFull {
        FeedFull {
            items: self.items.iter().map(Project::full).collect(),
            generated_at: self.generated_at,
        }
    }

    fn lite(&self) -> FeedLite {
        FeedLite {
            items: self.items.iter().map(Project::lite).collect(),
            generated_at: self.generated_at,
        }
    }
}
