//! Durable queue execution
//!
//! Operations go to one queue per feed type, so feeds of the same type share
//! workers fairly. Workers drain a queue up to an item cap per run; the
//! per-feed lock, not queue order, keeps concurrent imports apart.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::ExecutionStrategy;
use crate::context::ImportContext;
use crate::error::ImportResult;
use crate::executor::{FeedImporter, Operation, Stage, StrategyKind};
use crate::queue::{QueueBackend, DEFAULT_MAX_ATTEMPTS};

pub const DEFAULT_LEASE_SECS: u64 = 300;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// How long a delivered message stays invisible to other workers
    pub lease: Duration,
    pub retry_delay: Duration,
    pub max_attempts: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(DEFAULT_LEASE_SECS),
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// What one worker run did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub executed: u64,
    /// PROCESS operations run, counted against the item cap
    pub items: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
}

pub struct QueueStrategy {
    importer: Arc<FeedImporter>,
    queue: Arc<dyn QueueBackend>,
    settings: WorkerSettings,
}

impl QueueStrategy {
    pub fn new(importer: Arc<FeedImporter>, queue: Arc<dyn QueueBackend>, settings: WorkerSettings) -> Self {
        Self {
            importer,
            queue,
            settings,
        }
    }

    pub fn queue_name(feed_type: &str) -> String {
        format!("feeds_feed_import:{}", feed_type.to_lowercase())
    }

    /// Begin an import whose remaining stages run in workers
    ///
    /// The feed is flagged as queued by BEGIN once the lock is held; a refused
    /// start writes nothing.
    pub async fn start_queued_import(&self, ctx: &ImportContext, feed_id: Uuid) -> ImportResult<()> {
        self.start(ctx, feed_id).await
    }

    /// Drain `queue` until it is empty or `max_items` items were processed
    pub async fn work(&self, ctx: &ImportContext, queue: &str, max_items: u64) -> ImportResult<WorkerReport> {
        let mut report = WorkerReport::default();

        while report.items < max_items {
            let Some(delivery) = self.queue.dequeue(queue, self.settings.lease).await? else {
                break;
            };
            let op = &delivery.operation;
            if matches!(op.stage, Stage::Process { .. }) {
                report.items += 1;
            }

            match self.importer.execute(ctx, op).await {
                Ok(next) => {
                    self.queue.complete(&delivery, next).await?;
                    report.executed += 1;
                },
                Err(err) if !err.is_retryable() => {
                    tracing::warn!(feed_id = %op.feed_id, error = %err, "Dropping operation");
                    self.queue.ack(&delivery).await?;
                    report.dropped += 1;
                },
                Err(err) => {
                    let dead = self
                        .queue
                        .release(
                            &delivery,
                            &err.to_string(),
                            self.settings.retry_delay,
                            self.settings.max_attempts,
                        )
                        .await?;
                    if dead {
                        // The lock is left to time out so an operator can look first
                        let purged = self.queue.purge_feed(op.feed_id).await?;
                        tracing::error!(
                            feed_id = %op.feed_id,
                            stage = op.stage.name(),
                            attempts = delivery.attempts,
                            purged,
                            error = %err,
                            "Operation dead-lettered, import abandoned"
                        );
                        report.dead_lettered += 1;
                    } else {
                        tracing::warn!(
                            feed_id = %op.feed_id,
                            stage = op.stage.name(),
                            attempts = delivery.attempts,
                            error = %err,
                            "Operation failed, will be redelivered"
                        );
                        report.retried += 1;
                    }
                },
            }
        }

        if report.executed > 0 {
            tracing::info!(
                queue,
                executed = report.executed,
                items = report.items,
                "Worker run finished"
            );
        }
        Ok(report)
    }
}

#[async_trait]
impl ExecutionStrategy for QueueStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Queue
    }

    fn importer(&self) -> &FeedImporter {
        &self.importer
    }

    async fn schedule(&self, _ctx: &ImportContext, operations: Vec<Operation>) -> ImportResult<()> {
        let mut by_queue: BTreeMap<String, Vec<Operation>> = BTreeMap::new();
        for op in operations {
            by_queue
                .entry(Self::queue_name(&op.feed_type))
                .or_default()
                .push(op);
        }
        for (queue, ops) in by_queue {
            self.queue.enqueue_all(&queue, ops).await?;
        }
        Ok(())
    }

    async fn purge(&self, feed_id: Uuid) -> ImportResult<()> {
        self.queue.purge_feed(feed_id).await?;
        Ok(())
    }
}
