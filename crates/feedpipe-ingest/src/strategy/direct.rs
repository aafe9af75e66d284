//! Synchronous execution in the calling context

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

use super::ExecutionStrategy;
use crate::context::ImportContext;
use crate::error::ImportResult;
use crate::executor::{FeedImporter, Operation, StrategyKind};
use crate::feed::ImportSummary;

pub struct DirectStrategy {
    importer: Arc<FeedImporter>,
}

impl DirectStrategy {
    pub fn new(importer: Arc<FeedImporter>) -> Self {
        Self { importer }
    }

    /// Run a whole import and return its summary
    pub async fn start_import(&self, ctx: &ImportContext, feed_id: Uuid) -> ImportResult<ImportSummary> {
        self.start(ctx, feed_id).await?;
        let feed = self.importer.load_feed(feed_id).await?;
        Ok(feed.last_summary.unwrap_or_default())
    }
}

#[async_trait]
impl ExecutionStrategy for DirectStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Direct
    }

    fn importer(&self) -> &FeedImporter {
        &self.importer
    }

    async fn schedule(&self, ctx: &ImportContext, operations: Vec<Operation>) -> ImportResult<()> {
        let mut pending: VecDeque<Operation> = operations.into();
        while let Some(op) = pending.pop_front() {
            pending.extend(self.importer.execute(ctx, &op).await?);
        }
        Ok(())
    }

    async fn purge(&self, _feed_id: Uuid) -> ImportResult<()> {
        Ok(())
    }
}
