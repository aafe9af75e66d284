//! Feedpipe Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Staged, resumable import of external feeds into stored entities.
//!
//! An import runs as a chain of small operations (BEGIN, FETCH, PARSE,
//! PROCESS per item, CLEAN per stale entity, FINISH). Each operation
//! persists its progress on the feed and returns the operations that
//! follow it, so the same chain can run:
//!
//! - **Directly**: in the calling task, start to finish
//! - **Interactively**: a few operations per user request
//! - **Queued**: on durable queues drained by workers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use feedpipe_ingest::{
//!     DirectStrategy, FeedImporter, FeedTypeRegistry, ImportContext, MemoryEntityStorage,
//!     MemoryFeedLock, MemoryFeedStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let types = FeedTypeRegistry::load("config/feed_types.toml".as_ref())?;
//!     let importer = Arc::new(FeedImporter::new(
//!         Arc::new(MemoryFeedStore::new()),
//!         Arc::new(MemoryFeedLock::new()),
//!         Arc::new(MemoryEntityStorage::new()),
//!         Arc::new(types),
//!     ));
//!     let direct = DirectStrategy::new(importer);
//!     # let feed_id = uuid::Uuid::new_v4();
//!     let summary = direct.start_import(&ImportContext::system(), feed_id).await?;
//!     println!("{:?}", summary.counters);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod db;
pub mod entity;
pub mod error;
pub mod events;
pub mod executor;
pub mod feed;
pub mod feed_type;
pub mod lock;
pub mod processor;
pub mod queue;
pub mod scheduler;
pub mod source;
pub mod state;
pub mod strategy;
pub mod target;

pub use config::IngestConfig;
pub use context::{Actor, ImportContext};
pub use entity::{Entity, EntityStatus, EntityStorage, MemoryEntityStorage};
pub use error::{ImportError, ImportResult, TargetError};
pub use events::{ImportEvent, ImportListener, LoggingListener};
pub use executor::{FeedImporter, Operation, Stage, StrategyKind};
pub use feed::{Feed, FeedStore, ImportSummary, MemoryFeedStore, NewFeed};
pub use feed_type::{FeedType, FeedTypeRegistry};
pub use lock::{FeedLock, LockToken, MemoryFeedLock};
pub use queue::{MemoryQueue, QueueBackend};
pub use scheduler::ImportScheduler;
pub use strategy::{BatchStrategy, DirectStrategy, ExecutionStrategy, QueueStrategy};
