//! Periodic import scheduler
//!
//! Starts queued imports for feeds whose next import time has passed.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::ImportContext;
use crate::error::{ImportError, ImportResult};
use crate::strategy::{ExecutionStrategy, QueueStrategy};

pub const DEFAULT_SCHEDULER_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_STALE_QUEUED_SECS: u64 = 3600;

pub struct ImportScheduler {
    strategy: Arc<QueueStrategy>,
    interval: Duration,
    /// Feeds queued longer ago than this are queued again
    stale_after: Duration,
}

impl ImportScheduler {
    pub fn new(strategy: Arc<QueueStrategy>, interval: Duration, stale_after: Duration) -> Self {
        Self {
            strategy,
            interval,
            stale_after,
        }
    }

    /// Start imports for every due feed; returns how many were started
    pub async fn run_once(&self, ctx: &ImportContext) -> ImportResult<usize> {
        let due = self
            .strategy
            .importer()
            .feeds()
            .due_for_import(Utc::now(), self.stale_after)
            .await?;

        let mut started = 0;
        for feed in due {
            match self.strategy.start_queued_import(ctx, feed.id).await {
                Ok(()) => started += 1,
                Err(ImportError::LockUnavailable(_)) => {
                    debug!(feed_id = %feed.id, "Feed busy, skipping");
                },
                Err(err) => warn!(feed_id = %feed.id, error = %err, "Failed to queue import"),
            }
        }

        if started > 0 {
            info!(started, "Scheduled imports");
        }
        Ok(started)
    }

    /// Run [`run_once`](Self::run_once) on a fixed interval in the background
    pub fn spawn(self: Arc<Self>, ctx: ImportContext) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "Import scheduler started");
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                if let Err(err) = self.run_once(&ctx).await {
                    error!(error = %err, "Scheduler run failed");
                }
            }
        })
    }
}
