//! Invalidation plan generation.
//!
//! Merges a batch of invalidation events into the minimal set of store
//! operations.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use uuid::Uuid;

use super::events::{InvalidationEvent, InvalidationTarget};
use super::keys::KeyPattern;

/// Store operations covering a batch of events.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct InvalidationPlan {
    /// Patterns to purge; none subsumes another.
    pub patterns: BTreeSet<KeyPattern>,
    /// Tags to purge in a single pass.
    pub tags: BTreeSet<String>,
    /// Distinct events folded into this plan, in epoch order.
    pub event_ids: Vec<Uuid>,
    pub reasons: BTreeSet<String>,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InvalidationPlan {{ events: {}, patterns: {}, tags: {} }}",
            self.event_ids.len(),
            self.patterns.len(),
            self.tags.len(),
        )
    }
}

impl InvalidationPlan {
    /// Merge events: duplicates (same id) are dropped, tags are unioned and
    /// patterns covered by a broader pattern are removed.
    pub fn from_events(events: Vec<InvalidationEvent>) -> Self {
        let mut plan = Self::default();
        let mut seen_ids = HashSet::new();

        let mut events: Vec<_> = events
            .into_iter()
            .filter(|event| seen_ids.insert(event.id))
            .collect();
        events.sort_by_key(|event| event.epoch);

        let mut patterns = BTreeSet::new();
        for event in events {
            plan.event_ids.push(event.id);
            plan.reasons.insert(event.reason);
            match event.target {
                InvalidationTarget::Pattern(pattern) => {
                    patterns.insert(pattern);
                }
                InvalidationTarget::Tags(tags) => plan.tags.extend(tags),
            }
        }

        plan.patterns = patterns
            .iter()
            .filter(|pattern| {
                !patterns
                    .iter()
                    .any(|other| other != *pattern && other.subsumes(pattern))
            })
            .cloned()
            .collect();
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty() && self.tags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(target: InvalidationTarget, epoch: u64) -> InvalidationEvent {
        InvalidationEvent::new(target, "test", epoch)
    }

    #[test]
    fn duplicate_deliveries_count_once() {
        let original = event(InvalidationTarget::tags(["content:1"]), 1);
        let plan = InvalidationPlan::from_events(vec![original.clone(), original]);

        assert_eq!(plan.event_ids.len(), 1);
        assert_eq!(plan.tags.len(), 1);
    }

    #[test]
    fn tags_are_unioned() {
        let plan = InvalidationPlan::from_events(vec![
            event(InvalidationTarget::tags(["content:1", "content:2"]), 1),
            event(InvalidationTarget::tags(["content:2", "type:video"]), 2),
        ]);

        let tags: Vec<_> = plan.tags.iter().map(String::as_str).collect();
        assert_eq!(tags, vec!["content:1", "content:2", "type:video"]);
    }

    #[test]
    fn narrower_patterns_are_subsumed() {
        let plan = InvalidationPlan::from_events(vec![
            event(InvalidationTarget::pattern("home:top"), 1),
            event(InvalidationTarget::pattern("home:*"), 2),
            event(InvalidationTarget::pattern("home"), 3),
            event(InvalidationTarget::pattern("latest:*"), 4),
            event(InvalidationTarget::pattern("home:*"), 5),
        ]);

        let patterns: Vec<_> = plan.patterns.iter().map(ToString::to_string).collect();
        assert_eq!(patterns.len(), 3);
        assert!(patterns.contains(&"home:*".to_string()));
        assert!(patterns.contains(&"home".to_string()));
        assert!(patterns.contains(&"latest:*".to_string()));
    }

    #[test]
    fn match_all_swallows_every_other_pattern() {
        let plan = InvalidationPlan::from_events(vec![
            event(InvalidationTarget::pattern("home:*"), 1),
            event(InvalidationTarget::pattern("*"), 2),
        ]);

        assert_eq!(plan.patterns.len(), 1);
        assert!(plan.patterns.contains(&KeyPattern::All));
    }

    #[test]
    fn events_are_folded_in_epoch_order() {
        let late = event(InvalidationTarget::pattern("a"), 9);
        let early = event(InvalidationTarget::pattern("b"), 2);
        let (late_id, early_id) = (late.id, early.id);

        let plan = InvalidationPlan::from_events(vec![late, early]);
        assert_eq!(plan.event_ids, vec![early_id, late_id]);
    }

    #[test]
    fn empty_batch_gives_empty_plan() {
        assert!(InvalidationPlan::from_events(Vec::new()).is_empty());
    }
}
