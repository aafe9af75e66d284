//! Execution strategies
//!
//! All strategies take the operations the executor returns and decide when
//! and where they run:
//!
//! - [`DirectStrategy`]: everything now, in the caller
//! - [`BatchStrategy`]: a few operations per interactive request
//! - [`QueueStrategy`]: durable per-feed-type queues drained by workers
//!
//! None of them relies on exactly-once execution.

pub mod batch;
pub mod direct;
pub mod queue;

use async_trait::async_trait;
use uuid::Uuid;

use crate::context::ImportContext;
use crate::error::ImportResult;
use crate::executor::{FeedImporter, Operation, StrategyKind};

pub use batch::{BatchProgress, BatchStrategy};
pub use direct::DirectStrategy;
pub use queue::{QueueStrategy, WorkerReport, WorkerSettings};

#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn importer(&self) -> &FeedImporter;

    /// Arrange for `operations` to run, in order
    async fn schedule(&self, ctx: &ImportContext, operations: Vec<Operation>) -> ImportResult<()>;

    /// Drop operations of `feed_id` that have not run yet
    async fn purge(&self, feed_id: Uuid) -> ImportResult<()>;

    /// Begin an import
    ///
    /// BEGIN always runs in the caller so a locked feed is reported right
    /// away instead of surfacing later in a worker.
    async fn start(&self, ctx: &ImportContext, feed_id: Uuid) -> ImportResult<()> {
        let feed = self.importer().load_feed(feed_id).await?;
        let next = self
            .importer()
            .execute(ctx, &Operation::begin(&feed, self.kind()))
            .await?;

        if let Err(err) = self.schedule(ctx, next).await {
            if let Err(unlock_err) = self.importer().unlock(ctx, feed_id).await {
                tracing::error!(feed_id = %feed_id, error = %unlock_err, "Failed to unlock feed");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Cancel the running import of `feed_id`
    async fn cancel(&self, ctx: &ImportContext, feed_id: Uuid) -> ImportResult<()> {
        self.importer().unlock(ctx, feed_id).await?;
        self.purge(feed_id).await
    }
}
