//! Invalidation events.
//!
//! Content mutations become epoch-ordered events in an in-memory queue that
//! the invalidation bus drains.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use freshcache_types::ContentType;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use super::keys::{KeyPattern, tags};
use super::lock::lock_recovering;

const SOURCE: &str = "cache::events";
const METRIC_QUEUE_LEN: &str = "freshcache_event_queue_len";
const METRIC_EVENT_DROPPED: &str = "freshcache_event_dropped_total";

/// Namespace purged whenever breaking coverage changes.
pub const BREAKING_NAMESPACE: &str = "breaking";

/// Monotonic per-process ordering of events.
pub type Epoch = u64;

/// What an event removes from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationTarget {
    Pattern(KeyPattern),
    Tags(BTreeSet<String>),
}

impl InvalidationTarget {
    pub fn pattern(raw: &str) -> Self {
        Self::Pattern(KeyPattern::parse(raw))
    }

    pub fn tags<I, T>(tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self::Tags(tags.into_iter().map(Into::into).collect())
    }
}

impl From<KeyPattern> for InvalidationTarget {
    fn from(pattern: KeyPattern) -> Self {
        Self::Pattern(pattern)
    }
}

#[derive(Debug, Clone)]
pub struct InvalidationEvent {
    /// Unique identifier used to drop duplicate deliveries.
    pub id: Uuid,
    pub epoch: Epoch,
    pub target: InvalidationTarget,
    pub reason: String,
    pub timestamp: OffsetDateTime,
}

impl InvalidationEvent {
    pub fn new(target: InvalidationTarget, reason: impl Into<String>, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            target,
            reason: reason.into(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// A committed change to content, reported by mutation collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentMutation {
    Published { id: Uuid, content_type: ContentType },
    Updated { id: Uuid, content_type: ContentType },
    Unpublished { id: Uuid, content_type: ContentType },
    BreakingToggled { id: Uuid, is_breaking: bool },
    TaxonomyChanged { content_type: ContentType, slug: String },
}

impl ContentMutation {
    pub fn reason(&self) -> &'static str {
        match self {
            ContentMutation::Published { .. } => "published",
            ContentMutation::Updated { .. } => "updated",
            ContentMutation::Unpublished { .. } => "unpublished",
            ContentMutation::BreakingToggled { .. } => "breaking_toggled",
            ContentMutation::TaxonomyChanged { .. } => "taxonomy_changed",
        }
    }

    /// Everything this mutation makes stale: entries tagged with the content,
    /// plus every aggregate listing.
    pub fn targets(&self, aggregate_prefixes: &[String]) -> Vec<InvalidationTarget> {
        let mut targets = Vec::new();

        match self {
            ContentMutation::Published { id, .. }
            | ContentMutation::Updated { id, .. }
            | ContentMutation::Unpublished { id, .. } => {
                targets.push(InvalidationTarget::tags([tags::content(*id)]));
            }
            ContentMutation::BreakingToggled { id, .. } => {
                targets.push(InvalidationTarget::tags([tags::content(*id)]));
                targets.extend(namespace_targets(BREAKING_NAMESPACE));
            }
            ContentMutation::TaxonomyChanged { content_type, slug } => {
                targets.push(InvalidationTarget::tags([tags::taxonomy(*content_type, slug)]));
                targets.extend(namespace_targets(content_type.as_str()));
            }
        }

        for prefix in aggregate_prefixes {
            targets.extend(namespace_targets(prefix));
        }
        targets
    }
}

/// Both the parameterised keys of a namespace and its bare key (`home:*`, `home`).
fn namespace_targets(namespace: &str) -> [InvalidationTarget; 2] {
    let prefix = KeyPattern::namespace(namespace);
    let bare = match &prefix {
        KeyPattern::Prefix(prefix) => prefix.trim_end_matches(':').to_string(),
        _ => namespace.to_string(),
    };
    [
        InvalidationTarget::Pattern(prefix),
        InvalidationTarget::Pattern(KeyPattern::Exact(bare)),
    ]
}

/// Bounded FIFO of pending invalidations. When full, the oldest event is dropped.
pub struct EventQueue {
    queue: Mutex<VecDeque<InvalidationEvent>>,
    epoch_counter: AtomicU64,
    limit: usize,
}

impl EventQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
            limit: limit.max(1),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn publish(&self, target: InvalidationTarget, reason: &str) -> Epoch {
        let epoch = self.next_epoch();
        let event = InvalidationEvent::new(target, reason, epoch);

        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            target = ?event.target,
            reason,
            "Invalidation event enqueued"
        );

        let mut queue = lock_recovering(&self.queue, SOURCE, "publish");
        if queue.len() >= self.limit
            && let Some(dropped) = queue.pop_front()
        {
            counter!(METRIC_EVENT_DROPPED).increment(1);
            warn!(
                event_id = %dropped.id,
                event_epoch = dropped.epoch,
                limit = self.limit,
                "Invalidation queue full, dropped oldest event"
            );
        }
        queue.push_back(event);
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
        epoch
    }

    /// Remove up to `limit` events in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<InvalidationEvent> {
        let mut queue = lock_recovering(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        let events = queue.drain(..count).collect();
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
        events
    }

    pub fn len(&self) -> usize {
        lock_recovering(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn epochs_are_monotonic_and_drain_is_fifo() {
        let queue = EventQueue::new(16);
        queue.publish(InvalidationTarget::pattern("home:*"), "first");
        queue.publish(InvalidationTarget::tags(["content:1"]), "second");
        queue.publish(InvalidationTarget::pattern("*"), "third");

        let events = queue.drain(2);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].reason, "first");
        assert_eq!(events[1].reason, "second");
        assert!(events[0].epoch < events[1].epoch);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn full_queue_drops_oldest() {
        let queue = EventQueue::new(2);
        queue.publish(InvalidationTarget::pattern("a"), "a");
        queue.publish(InvalidationTarget::pattern("b"), "b");
        queue.publish(InvalidationTarget::pattern("c"), "c");

        let reasons: Vec<_> = queue.drain(10).into_iter().map(|e| e.reason).collect();
        assert_eq!(reasons, vec!["b", "c"]);
    }

    #[test]
    fn content_mutations_purge_content_tag_and_aggregates() {
        let id = Uuid::nil();
        let targets = ContentMutation::Updated {
            id,
            content_type: ContentType::Article,
        }
        .targets(&["home".to_string(), "latest".to_string()]);

        assert_eq!(
            targets,
            vec![
                InvalidationTarget::tags([tags::content(id)]),
                InvalidationTarget::pattern("home:*"),
                InvalidationTarget::pattern("home"),
                InvalidationTarget::pattern("latest:*"),
                InvalidationTarget::pattern("latest"),
            ]
        );
    }

    #[test]
    fn breaking_toggle_also_purges_breaking_namespace() {
        let targets = ContentMutation::BreakingToggled {
            id: Uuid::nil(),
            is_breaking: true,
        }
        .targets(&[]);

        assert!(targets.contains(&InvalidationTarget::pattern("breaking:*")));
        assert!(targets.contains(&InvalidationTarget::pattern("breaking")));
    }

    #[test]
    fn taxonomy_change_targets_its_listing_namespace() {
        let targets = ContentMutation::TaxonomyChanged {
            content_type: ContentType::Category,
            slug: "world".to_string(),
        }
        .targets(&[]);

        assert!(targets.contains(&InvalidationTarget::tags(["category:world"])));
        assert!(targets.contains(&InvalidationTarget::pattern("category:*")));
    }

    #[test]
    fn mutation_wire_format() {
        let mutation: ContentMutation = serde_json::from_str(
            r#"{"kind":"breaking_toggled","id":"00000000-0000-0000-0000-000000000000","is_breaking":true}"#,
        )
        .expect("decode mutation");
        assert_eq!(mutation.reason(), "breaking_toggled");
    }

    #[test]
    fn queue_recovers_from_poisoned_lock() {
        let queue = EventQueue::new(4);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = queue.queue.lock().expect("queue lock should be acquired");
            panic!("poison queue lock");
        }));

        queue.publish(InvalidationTarget::pattern("*"), "after poison");
        assert_eq!(queue.len(), 1);
    }
}
