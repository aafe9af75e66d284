//! Interactive multi-request execution
//!
//! Operations are parked in a per-feed queue. Each user request calls
//! [`BatchStrategy::step`], which runs a few of them in submission order and
//! reports progress for display.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::ExecutionStrategy;
use crate::context::ImportContext;
use crate::error::ImportResult;
use crate::executor::{FeedImporter, Operation, StrategyKind};
use crate::queue::QueueBackend;
use crate::state::COMPLETE;

/// Default operations run per request
pub const DEFAULT_OPS_PER_REQUEST: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BatchProgress {
    pub progress: f64,
    pub remaining: u64,
    pub finished: bool,
}

pub struct BatchStrategy {
    importer: Arc<FeedImporter>,
    queue: Arc<dyn QueueBackend>,
    ops_per_request: usize,
    lease: Duration,
}

impl BatchStrategy {
    pub fn new(
        importer: Arc<FeedImporter>,
        queue: Arc<dyn QueueBackend>,
        ops_per_request: usize,
        lease: Duration,
    ) -> Self {
        Self {
            importer,
            queue,
            ops_per_request: ops_per_request.max(1),
            lease,
        }
    }

    pub fn queue_name(feed_id: Uuid) -> String {
        format!("feeds_batch:{}", feed_id)
    }

    pub async fn start_batch_import(
        &self,
        ctx: &ImportContext,
        feed_id: Uuid,
    ) -> ImportResult<BatchProgress> {
        self.start(ctx, feed_id).await?;
        self.progress(feed_id).await
    }

    /// Run the next few operations of the feed's import
    pub async fn step(&self, ctx: &ImportContext, feed_id: Uuid) -> ImportResult<BatchProgress> {
        let queue = Self::queue_name(feed_id);

        for _ in 0..self.ops_per_request {
            let Some(delivery) = self.queue.dequeue(&queue, self.lease).await? else {
                break;
            };
            match self.importer.execute(ctx, &delivery.operation).await {
                Ok(next) => self.queue.complete(&delivery, next).await?,
                Err(err) => {
                    // The executor already aborted the import
                    self.queue.purge_feed(feed_id).await?;
                    return Err(err);
                },
            }
        }

        self.progress(feed_id).await
    }

    pub async fn progress(&self, feed_id: Uuid) -> ImportResult<BatchProgress> {
        let remaining = self.queue.len(&Self::queue_name(feed_id)).await?;
        if remaining == 0 {
            return Ok(BatchProgress {
                progress: COMPLETE,
                remaining,
                finished: true,
            });
        }

        let feed = self.importer.load_feed(feed_id).await?;
        Ok(BatchProgress {
            progress: feed.import_progress(),
            remaining,
            finished: false,
        })
    }
}

#[async_trait]
impl ExecutionStrategy for BatchStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Batch
    }

    fn importer(&self) -> &FeedImporter {
        &self.importer
    }

    async fn schedule(&self, _ctx: &ImportContext, operations: Vec<Operation>) -> ImportResult<()> {
        let Some(first) = operations.first() else {
            return Ok(());
        };
        let queue = Self::queue_name(first.feed_id);
        self.queue.enqueue_all(&queue, operations).await?;
        Ok(())
    }

    async fn purge(&self, feed_id: Uuid) -> ImportResult<()> {
        self.queue.purge_feed(feed_id).await?;
        Ok(())
    }
}
