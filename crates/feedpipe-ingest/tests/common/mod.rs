//! Shared fixtures for feedpipe integration tests
//!
//! - [`PagedFetcher`]: in-memory source whose pages can change between imports
//! - [`RecordingListener`]: captures lifecycle events for assertions
//! - [`Harness`]: importer wired to memory backends
//! - [`TestPostgres`]: PostgreSQL container with migrations applied

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use feedpipe_common::checksum::{checksum_bytes, ChecksumAlgorithm};
use feedpipe_ingest::processor::{Processor, ProcessorSettings};
use feedpipe_ingest::source::{FetchResult, Fetcher, JsonLinesParser};
use feedpipe_ingest::state::progress;
use feedpipe_ingest::strategy::WorkerSettings;
use feedpipe_ingest::target::{Mapping, TargetKind};
use feedpipe_ingest::{
    BatchStrategy, DirectStrategy, Feed, FeedImporter, FeedStore, FeedType, FeedTypeRegistry,
    ImportContext, ImportError, ImportEvent, ImportListener, ImportResult, MemoryEntityStorage,
    MemoryFeedLock, MemoryFeedStore, MemoryQueue, NewFeed, QueueStrategy,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;

pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,feedpipe_ingest=debug,sqlx=warn,testcontainers=info")
        }))
        .with_test_writer()
        .try_init();
}

/// One JSON line per `(id, body)`
pub fn jsonl(rows: &[(&str, &str)]) -> String {
    rows.iter()
        .map(|(id, body)| json!({ "id": id, "body": body }).to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Source served one page per fetch, with a content hash as fingerprint
#[derive(Debug, Default)]
pub struct PagedFetcher {
    pages: Mutex<Vec<String>>,
    skip_unchanged: bool,
    failures: AtomicU32,
    calls: AtomicU32,
}

impl PagedFetcher {
    pub fn new(pages: Vec<String>) -> Self {
        Self {
            pages: Mutex::new(pages),
            ..Default::default()
        }
    }

    pub fn single(payload: impl Into<String>) -> Self {
        Self::new(vec![payload.into()])
    }

    pub fn skipping_unchanged(mut self) -> Self {
        self.skip_unchanged = true;
        self
    }

    pub fn set_pages(&self, pages: Vec<String>) {
        *self.pages.lock() = pages;
    }

    /// Fail the next `times` fetches with a recoverable error
    pub fn fail_times(&self, times: u32) {
        self.failures.store(times, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for PagedFetcher {
    async fn fetch(
        &self,
        _ctx: &ImportContext,
        feed: &Feed,
        pointer: Option<&Value>,
    ) -> ImportResult<FetchResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ImportError::recoverable("source unavailable"));
        }

        let pages = self.pages.lock().clone();
        let hash = checksum_bytes(pages.join("\n").as_bytes(), ChecksumAlgorithm::Sha256)?;
        let index = pointer.and_then(Value::as_u64).unwrap_or(0) as usize;
        if self.skip_unchanged && index == 0 && feed.source_fingerprint.as_deref() == Some(hash.as_str()) {
            return Err(ImportError::EmptySource);
        }
        let Some(page) = pages.get(index) else {
            return Ok(FetchResult::complete("").with_fingerprint(Some(hash)));
        };

        let next = index + 1;
        Ok(FetchResult {
            payload: page.clone(),
            progress: progress(pages.len() as u64, next as u64),
            pointer: (next < pages.len()).then(|| json!(next)),
            source_fingerprint: Some(hash),
        })
    }
}

#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ImportEvent>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<ImportEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl ImportListener for RecordingListener {
    fn on_event(&self, event: &ImportEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Feed type reading JSON lines keyed by `id`
///
/// Maps `id` (unique identifier), `body` (text) and `ref` (references to
/// other items by key).
pub fn notes_type(id: &str, fetcher: Arc<PagedFetcher>, settings: ProcessorSettings) -> FeedType {
    FeedType::new(
        id,
        fetcher,
        Arc::new(JsonLinesParser::new(Some("id".into()), 0)),
        Processor::new(
            settings,
            vec![
                Mapping::new("id", "id", TargetKind::Identifier).unique(),
                Mapping::new("body", "body", TargetKind::Text),
                Mapping::new("ref", "ref", TargetKind::Reference).multiple(),
            ],
        ),
    )
}

/// Like [`notes_type`] but parses `line_limit` lines per PARSE
pub fn paged_notes_type(
    id: &str,
    fetcher: Arc<PagedFetcher>,
    settings: ProcessorSettings,
    line_limit: usize,
) -> FeedType {
    let mut feed_type = notes_type(id, fetcher, settings);
    feed_type.parser = Arc::new(JsonLinesParser::new(Some("id".into()), line_limit));
    feed_type
}

pub struct Harness {
    pub importer: Arc<FeedImporter>,
    pub feeds: Arc<MemoryFeedStore>,
    pub entities: Arc<MemoryEntityStorage>,
    pub locks: Arc<MemoryFeedLock>,
    pub queue: Arc<MemoryQueue>,
    pub events: Arc<RecordingListener>,
}

impl Harness {
    pub fn new(types: Vec<FeedType>) -> Self {
        Self::with_lock_timeout(types, Duration::from_secs(120))
    }

    pub fn with_lock_timeout(types: Vec<FeedType>, lock_timeout: Duration) -> Self {
        let mut registry = FeedTypeRegistry::new();
        for feed_type in types {
            registry.register(feed_type);
        }

        let feeds = Arc::new(MemoryFeedStore::new());
        let entities = Arc::new(MemoryEntityStorage::new());
        let locks = Arc::new(MemoryFeedLock::new());
        let events = Arc::new(RecordingListener::default());
        let importer = FeedImporter::new(
            feeds.clone(),
            locks.clone(),
            entities.clone(),
            Arc::new(registry),
        )
        .with_lock_timeout(lock_timeout)
        .with_listener(events.clone());

        Self {
            importer: Arc::new(importer),
            feeds,
            entities,
            locks,
            queue: Arc::new(MemoryQueue::new()),
            events,
        }
    }

    pub async fn feed(&self, feed_type: &str) -> Feed {
        self.feeds
            .create(NewFeed {
                feed_type: feed_type.to_string(),
                title: format!("{} feed", feed_type),
                source: "memory".to_string(),
                owner: None,
                active: true,
            })
            .await
            .unwrap()
    }

    pub async fn reload(&self, feed: &Feed) -> Feed {
        self.importer.load_feed(feed.id).await.unwrap()
    }

    pub fn direct(&self) -> DirectStrategy {
        DirectStrategy::new(self.importer.clone())
    }

    pub fn batch(&self, ops_per_request: usize) -> BatchStrategy {
        BatchStrategy::new(
            self.importer.clone(),
            self.queue.clone(),
            ops_per_request,
            Duration::from_secs(60),
        )
    }

    pub fn queued(&self, settings: WorkerSettings) -> QueueStrategy {
        QueueStrategy::new(self.importer.clone(), self.queue.clone(), settings)
    }
}

/// PostgreSQL container with the feedpipe schema applied
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: Arc<PgPool>,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container.get_host().await.context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;
        let url = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&url)
            .await
            .context("Failed to connect to PostgreSQL")?;
        feedpipe_ingest::db::run_migrations(&pool).await?;

        Ok(Self {
            _container: container,
            pool: Arc::new(pool),
        })
    }

    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }
}
