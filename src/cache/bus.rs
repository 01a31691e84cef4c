//! Invalidation bus.
//!
//! Mutation collaborators report committed changes here after their write
//! succeeds. Invalidation is fire-and-forget: store failures are logged and
//! counted in the report, never returned to the mutation.

use std::sync::Arc;
use std::time::Duration;

use metrics::histogram;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use super::config::CacheConfig;
use super::events::{ContentMutation, EventQueue, InvalidationEvent, InvalidationTarget};
use super::planner::InvalidationPlan;
use super::store::CacheStore;

const METRIC_CONSUME_MS: &str = "freshcache_consume_ms";

/// Outcome of one invalidation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub events: usize,
    pub patterns: usize,
    pub tags: usize,
    /// Data keys removed from the store.
    pub removed: usize,
    /// Store operations that failed and were skipped.
    pub failures: usize,
}

pub struct InvalidationBus {
    config: CacheConfig,
    store: Arc<CacheStore>,
    queue: Arc<EventQueue>,
}

impl InvalidationBus {
    pub fn new(config: CacheConfig, store: Arc<CacheStore>, queue: Arc<EventQueue>) -> Self {
        Self {
            config,
            store,
            queue,
        }
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Purge `target` now, bypassing the queue.
    pub async fn invalidate(
        &self,
        target: impl Into<InvalidationTarget>,
        reason: &str,
    ) -> InvalidationReport {
        let event = InvalidationEvent::new(target.into(), reason, self.queue.next_epoch());
        self.execute(InvalidationPlan::from_events(vec![event])).await
    }

    /// Purge `target` on a background task.
    pub fn invalidate_detached(
        self: &Arc<Self>,
        target: impl Into<InvalidationTarget>,
        reason: &str,
    ) -> JoinHandle<InvalidationReport> {
        let bus = Arc::clone(self);
        let target = target.into();
        let reason = reason.to_string();
        tokio::spawn(async move { bus.invalidate(target, &reason).await })
    }

    /// Enqueue the events implied by `mutation`. Returns how many were queued.
    pub fn publish(&self, mutation: &ContentMutation) -> usize {
        if !self.config.enabled {
            debug!(mutation = ?mutation, "Invalidation skipped: cache disabled");
            return 0;
        }

        let targets = mutation.targets(&self.config.aggregate_prefixes);
        let count = targets.len();
        for target in targets {
            self.queue.publish(target, mutation.reason());
        }
        count
    }

    /// Publish `mutation` and consume the queue immediately.
    pub async fn notify(&self, mutation: &ContentMutation) -> InvalidationReport {
        self.publish(mutation);
        self.consume().await
    }

    /// Drain one batch of queued events and execute the merged plan.
    #[instrument(skip(self))]
    pub async fn consume(&self) -> InvalidationReport {
        let started_at = Instant::now();
        let events = self.queue.drain(self.config.consume_batch_limit);
        if events.is_empty() {
            return InvalidationReport::default();
        }

        let event_count = events.len();
        let plan = InvalidationPlan::from_events(events);
        info!(event_count, plan = %plan, "Invalidation consumption starting");

        let report = self.execute(plan).await;
        histogram!(METRIC_CONSUME_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        report
    }

    /// Run the background consumer at the configured `auto_consume_interval`.
    pub fn start_consumer(self: &Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.auto_consume_interval();
        info!(interval_ms = interval.as_millis() as u64, "Starting invalidation consumer");
        self.spawn_consumer(interval)
    }

    /// Drain the queue every `interval` until the returned handle is aborted.
    pub fn spawn_consumer(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                while !bus.queue.is_empty() {
                    bus.consume().await;
                }
            }
        })
    }

    async fn execute(&self, plan: InvalidationPlan) -> InvalidationReport {
        let mut report = InvalidationReport {
            events: plan.event_ids.len(),
            patterns: plan.patterns.len(),
            tags: plan.tags.len(),
            ..InvalidationReport::default()
        };

        for pattern in &plan.patterns {
            match self.store.try_invalidate_pattern(pattern).await {
                Ok(outcome) => {
                    report.removed += outcome.removed;
                    report.failures += outcome.failed;
                }
                Err(err) => {
                    report.failures += 1;
                    warn!(pattern = %pattern, error = %err, "Pattern invalidation failed");
                }
            }
        }

        if !plan.tags.is_empty() {
            let tags: Vec<String> = plan.tags.iter().cloned().collect();
            match self.store.try_invalidate_tags(&tags).await {
                Ok(outcome) => {
                    report.removed += outcome.removed;
                    report.failures += outcome.failed;
                }
                Err(err) => {
                    report.failures += 1;
                    warn!(tags = ?tags, error = %err, "Tag invalidation failed");
                }
            }
        }

        info!(
            events = report.events,
            removed = report.removed,
            failures = report.failures,
            reasons = ?plan.reasons,
            "Invalidation complete"
        );
        report
    }
}
