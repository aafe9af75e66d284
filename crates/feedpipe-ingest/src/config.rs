//! Ingest configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::lock::DEFAULT_LOCK_TIMEOUT;
use crate::queue::DEFAULT_MAX_ATTEMPTS;
use crate::scheduler::{DEFAULT_SCHEDULER_INTERVAL_SECS, DEFAULT_STALE_QUEUED_SECS};
use crate::strategy::batch::DEFAULT_OPS_PER_REQUEST;
use crate::strategy::queue::{DEFAULT_LEASE_SECS, DEFAULT_RETRY_DELAY_SECS};
use crate::strategy::WorkerSettings;

/// Default feed type definition file
pub const DEFAULT_FEED_TYPES_PATH: &str = "config/feed_types.toml";

/// Default PROCESS operations per worker run
pub const DEFAULT_WORKER_MAX_ITEMS: u64 = 50;

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub lock_timeout_secs: u64,
    /// Operations run per interactive batch request
    pub ops_per_request: usize,
    /// PROCESS operations per worker run
    pub worker_max_items: u64,
    pub queue_lease_secs: u64,
    pub queue_retry_delay_secs: u64,
    pub queue_max_attempts: u32,
    pub scheduler_interval_secs: u64,
    /// Feeds queued longer ago than this are queued again
    pub stale_queued_secs: u64,
    pub feed_types_path: PathBuf,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT.as_secs(),
            ops_per_request: DEFAULT_OPS_PER_REQUEST,
            worker_max_items: DEFAULT_WORKER_MAX_ITEMS,
            queue_lease_secs: DEFAULT_LEASE_SECS,
            queue_retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            queue_max_attempts: DEFAULT_MAX_ATTEMPTS,
            scheduler_interval_secs: DEFAULT_SCHEDULER_INTERVAL_SECS,
            stale_queued_secs: DEFAULT_STALE_QUEUED_SECS,
            feed_types_path: PathBuf::from(DEFAULT_FEED_TYPES_PATH),
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl IngestConfig {
    /// Load configuration from `FEEDPIPE_*` environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            lock_timeout_secs: env_or("FEEDPIPE_LOCK_TIMEOUT_SECS", defaults.lock_timeout_secs),
            ops_per_request: env_or("FEEDPIPE_OPS_PER_REQUEST", defaults.ops_per_request),
            worker_max_items: env_or("FEEDPIPE_WORKER_MAX_ITEMS", defaults.worker_max_items),
            queue_lease_secs: env_or("FEEDPIPE_QUEUE_LEASE_SECS", defaults.queue_lease_secs),
            queue_retry_delay_secs: env_or(
                "FEEDPIPE_QUEUE_RETRY_DELAY_SECS",
                defaults.queue_retry_delay_secs,
            ),
            queue_max_attempts: env_or("FEEDPIPE_QUEUE_MAX_ATTEMPTS", defaults.queue_max_attempts),
            scheduler_interval_secs: env_or(
                "FEEDPIPE_SCHEDULER_INTERVAL_SECS",
                defaults.scheduler_interval_secs,
            ),
            stale_queued_secs: env_or("FEEDPIPE_STALE_QUEUED_SECS", defaults.stale_queued_secs),
            feed_types_path: std::env::var("FEEDPIPE_FEED_TYPES")
                .map(PathBuf::from)
                .unwrap_or(defaults.feed_types_path),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.lock_timeout_secs == 0 {
            anyhow::bail!("FEEDPIPE_LOCK_TIMEOUT_SECS must be greater than 0");
        }
        if self.ops_per_request == 0 {
            anyhow::bail!("FEEDPIPE_OPS_PER_REQUEST must be greater than 0");
        }
        if self.worker_max_items == 0 {
            anyhow::bail!("FEEDPIPE_WORKER_MAX_ITEMS must be greater than 0");
        }
        if self.queue_max_attempts == 0 {
            anyhow::bail!("FEEDPIPE_QUEUE_MAX_ATTEMPTS must be greater than 0");
        }
        if self.scheduler_interval_secs == 0 {
            anyhow::bail!("FEEDPIPE_SCHEDULER_INTERVAL_SECS must be greater than 0");
        }
        if self.queue_lease_secs < self.lock_timeout_secs {
            tracing::warn!(
                lease = self.queue_lease_secs,
                lock_timeout = self.lock_timeout_secs,
                "Queue lease is shorter than the lock timeout; slow operations may run twice"
            );
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }

    pub fn stale_queued(&self) -> Duration {
        Duration::from_secs(self.stale_queued_secs)
    }

    pub fn queue_lease(&self) -> Duration {
        Duration::from_secs(self.queue_lease_secs)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            lease: self.queue_lease(),
            retry_delay: Duration::from_secs(self.queue_retry_delay_secs),
            max_attempts: self.queue_max_attempts,
        }
    }
}
