//! Pipeline executor
//!
//! Drives one feed through the stage graph:
//!
//! ```text
//! BEGIN -> FETCH -> PARSE -> PROCESS x N -> FINISH
//!   FINISH -> PARSE            while parsing is incomplete
//!   FINISH -> FETCH            while fetching is incomplete
//!   FINISH -> CLEAN x M -> FINISH
//!   FINISH -> EXPIRE x K -> FINISH
//!   FINISH -> done (unlock)
//! ```
//!
//! The executor runs exactly one [`Operation`] per call and returns the
//! operations to run next. Execution strategies decide when and where those
//! run. Any operation may be executed more than once: FETCH and PARSE carry
//! the pointer they start from, PROCESS skips unchanged items by fingerprint,
//! CLEAN and EXPIRE only act on ids still pending, and every operation checks
//! that its lock token still holds the feed.

use anyhow::{anyhow, Context as _};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::context::ImportContext;
use crate::entity::EntityStorage;
use crate::error::{ImportError, ImportResult};
use crate::events::{ImportEvent, ImportListener};
use crate::feed::{Feed, FeedStore, ImportSummary};
use crate::feed_type::{FeedType, FeedTypeRegistry};
use crate::lock::{FeedLock, LockInfo, LockToken, DEFAULT_LOCK_TIMEOUT};
use crate::source::{FetchResult, Item};
use crate::state::{Counter, Severity, StageId, StageState};

/// How an import is being driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Direct,
    Batch,
    Queue,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Direct => "direct",
            StrategyKind::Batch => "batch",
            StrategyKind::Queue => "queue",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(StrategyKind::Direct),
            "batch" => Ok(StrategyKind::Batch),
            "queue" => Ok(StrategyKind::Queue),
            _ => Err(anyhow!("Invalid strategy: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Stage {
    Begin,
    /// `page` counts the fetches of the import, `batch` the parse batches of
    /// the current page and `index` the items of the import. A stage whose
    /// counter is behind its stage state has already been applied.
    Fetch {
        pointer: Option<Value>,
        #[serde(default)]
        page: u64,
    },
    Parse {
        fetched: FetchResult,
        pointer: Option<Value>,
        #[serde(default)]
        batch: u64,
    },
    Process {
        item: Item,
        #[serde(default)]
        index: u64,
    },
    Finish { fetched: FetchResult },
    Clean { entity_id: Uuid },
    Expire { entity_id: Uuid },
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Begin => "begin",
            Stage::Fetch { .. } => "fetch",
            Stage::Parse { .. } => "parse",
            Stage::Process { .. } => "process",
            Stage::Finish { .. } => "finish",
            Stage::Clean { .. } => "clean",
            Stage::Expire { .. } => "expire",
        }
    }
}

/// One unit of pipeline work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub feed_id: Uuid,
    pub feed_type: String,
    /// Lock token of the import; `None` only for BEGIN
    pub token: Option<LockToken>,
    pub strategy: StrategyKind,
    pub stage: Stage,
}

impl Operation {
    pub fn begin(feed: &Feed, strategy: StrategyKind) -> Self {
        Self {
            feed_id: feed.id,
            feed_type: feed.feed_type.clone(),
            token: None,
            strategy,
            stage: Stage::Begin,
        }
    }

    /// Follow-up operation of the same import
    pub fn next(&self, stage: Stage) -> Self {
        Self {
            stage,
            ..self.clone()
        }
    }

    fn with_token(mut self, token: LockToken) -> Self {
        self.token = Some(token);
        self
    }
}

pub struct FeedImporter {
    feeds: Arc<dyn FeedStore>,
    locks: Arc<dyn FeedLock>,
    entities: Arc<dyn EntityStorage>,
    types: Arc<FeedTypeRegistry>,
    listeners: Vec<Arc<dyn ImportListener>>,
    lock_timeout: Duration,
}

impl FeedImporter {
    pub fn new(
        feeds: Arc<dyn FeedStore>,
        locks: Arc<dyn FeedLock>,
        entities: Arc<dyn EntityStorage>,
        types: Arc<FeedTypeRegistry>,
    ) -> Self {
        Self {
            feeds,
            locks,
            entities,
            types,
            listeners: Vec::new(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ImportListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn feeds(&self) -> &Arc<dyn FeedStore> {
        &self.feeds
    }

    pub fn entities(&self) -> &Arc<dyn EntityStorage> {
        &self.entities
    }

    pub fn types(&self) -> &Arc<FeedTypeRegistry> {
        &self.types
    }

    pub async fn load_feed(&self, feed_id: Uuid) -> ImportResult<Feed> {
        self.feeds
            .load(feed_id)
            .await?
            .ok_or(ImportError::FeedNotFound(feed_id))
    }

    fn emit(&self, event: ImportEvent) {
        for listener in &self.listeners {
            listener.on_event(&event);
        }
    }

    /// Run one operation and return its follow-ups
    ///
    /// Error policy:
    /// - `EmptySource` finishes the import early and is not an error.
    /// - `LockUnavailable` leaves everything as it was.
    /// - Under the queue strategy any other error is returned with the feed
    ///   still locked so the message can be redelivered.
    /// - Otherwise the import is aborted and the feed unlocked.
    #[tracing::instrument(
        skip_all,
        fields(feed_id = %op.feed_id, stage = op.stage.name(), strategy = %op.strategy)
    )]
    pub async fn execute(&self, ctx: &ImportContext, op: &Operation) -> ImportResult<Vec<Operation>> {
        match self.run_stage(ctx, op).await {
            Ok(next) => Ok(next),
            Err(ImportError::EmptySource) => {
                tracing::info!("Nothing new to import");
                self.finish_early(ctx, op).await?;
                Ok(Vec::new())
            },
            Err(err @ ImportError::LockUnavailable(_)) => {
                tracing::warn!(error = %err, "Import not started");
                Err(err)
            },
            // BEGIN releases its own lock on failure
            Err(err) if matches!(op.stage, Stage::Begin) => Err(err),
            Err(err) if op.strategy == StrategyKind::Queue => {
                tracing::error!(error = %err, "Stage failed, feed stays locked for redelivery");
                Err(err)
            },
            Err(err) => {
                match &err {
                    ImportError::Recoverable(message) => tracing::warn!(%message, "Import aborted"),
                    other => tracing::error!(error = %other, "Import failed"),
                }
                if let Err(abort_err) = self.abort_import(ctx, op, &err.to_string()).await {
                    tracing::error!(error = %abort_err, "Failed to abort import");
                }
                Err(err)
            },
        }
    }

    async fn run_stage(&self, ctx: &ImportContext, op: &Operation) -> ImportResult<Vec<Operation>> {
        if matches!(op.stage, Stage::Begin) {
            return self.begin(ctx, op).await;
        }

        let token = op
            .token
            .ok_or_else(|| anyhow!("{} operation carries no lock token", op.stage.name()))?;
        if !self.locks.refresh(op.feed_id, &token, self.lock_timeout).await? {
            tracing::debug!(token = %token, "Dropping operation of a finished or cancelled import");
            return Ok(Vec::new());
        }

        let mut feed = self.load_feed(op.feed_id).await?;
        let feed_type = self.types.get(&feed.feed_type)?;
        let ctx = ctx.acting_as(feed.owner.as_deref());

        match &op.stage {
            Stage::Begin => Ok(Vec::new()),
            Stage::Fetch { pointer, page } => {
                self.fetch(&ctx, op, &mut feed, &feed_type, pointer.as_ref(), *page)
                    .await
            },
            Stage::Parse {
                fetched,
                pointer,
                batch,
            } => {
                self.parse(op, &mut feed, &feed_type, fetched, pointer.as_ref(), *batch)
                    .await
            },
            Stage::Process { item, index } => {
                self.process(&ctx, &mut feed, &feed_type, item, *index).await
            },
            Stage::Finish { fetched } => self.finish(op, &mut feed, &feed_type, fetched, token).await,
            Stage::Clean { entity_id } => self.clean(&mut feed, &feed_type, *entity_id).await,
            Stage::Expire { entity_id } => self.expire(&mut feed, *entity_id).await,
        }
    }

    /// Acquire the lock, then reset the feed record
    ///
    /// Nothing is written to the feed before the lock is held: a refused
    /// start leaves a running import untouched.
    async fn begin(&self, ctx: &ImportContext, op: &Operation) -> ImportResult<Vec<Operation>> {
        self.types.get(&self.load_feed(op.feed_id).await?.feed_type)?;

        let token = self.locks.acquire(op.feed_id, self.lock_timeout).await?;
        let reset = async {
            let mut feed = self.load_feed(op.feed_id).await?;
            feed.lock = Some(LockInfo {
                token,
                acquired_at: Utc::now(),
            });
            if op.strategy == StrategyKind::Queue {
                feed.queued_at = Some(Utc::now());
            }
            feed.clear_states();
            self.feeds.save(&feed).await?;
            Ok::<_, ImportError>(feed)
        };
        let feed = match reset.await {
            Ok(feed) => feed,
            Err(err) => {
                self.locks.release(op.feed_id, &token).await?;
                return Err(err);
            },
        };

        tracing::info!(token = %token, actor = %ctx.actor, "Import started");
        self.emit(ImportEvent::Started { feed_id: feed.id });

        let op = op.clone().with_token(token);
        Ok(vec![op.next(Stage::Fetch {
            pointer: None,
            page: 0,
        })])
    }

    async fn fetch(
        &self,
        ctx: &ImportContext,
        op: &Operation,
        feed: &mut Feed,
        feed_type: &FeedType,
        pointer: Option<&Value>,
        page: u64,
    ) -> ImportResult<Vec<Operation>> {
        let fetched = feed_type.fetcher.fetch(ctx, feed, pointer).await?;

        if page < feed.state(StageId::Fetch).position {
            tracing::debug!(page, "Fetch already applied");
        } else {
            let state = feed.state_mut(StageId::Fetch);
            state.set_fraction(fetched.progress);
            state.pointer = fetched.pointer.clone();
            state.position = page + 1;
            let progress = state.progress;
            *feed.state_mut(StageId::Parse) = StageState::new();
            self.feeds.save(feed).await?;

            tracing::debug!(bytes = fetched.payload.len(), progress, "Fetched source");
            self.emit(ImportEvent::Fetched {
                feed_id: feed.id,
                progress,
            });
        }

        Ok(vec![op.next(Stage::Parse {
            fetched,
            pointer: None,
            batch: 0,
        })])
    }

    async fn parse(
        &self,
        op: &Operation,
        feed: &mut Feed,
        feed_type: &FeedType,
        fetched: &FetchResult,
        pointer: Option<&Value>,
        batch: u64,
    ) -> ImportResult<Vec<Operation>> {
        let parsed = feed_type.parser.parse(fetched, pointer)?;
        let count = parsed.items.len() as u64;
        let applied = batch < feed.state(StageId::Parse).position;

        // Items of an applied batch are the last ones counted
        let total = feed.state(StageId::Process).total;
        let first_index = if applied {
            total.saturating_sub(count)
        } else {
            total
        };

        if applied {
            tracing::debug!(batch, "Parse batch already applied");
        } else {
            // A source that yields nothing at all must not wipe existing entities
            let exhausted = parsed.progress >= 1.0 && feed.is_complete(StageId::Fetch);
            if count == 0 && parsed.messages.is_empty() && exhausted && total == 0 {
                return Err(ImportError::EmptySource);
            }

            let state = feed.state_mut(StageId::Parse);
            state.set_fraction(parsed.progress);
            state.pointer = parsed.pointer.clone();
            state.position = batch + 1;
            for message in parsed.messages {
                state.report(Counter::Failed, Some(message));
            }
            let progress = state.progress;

            let process = feed.state_mut(StageId::Process);
            process.total += count;
            process.set_progress(process.total, process.position);

            if feed_type.processor.cleans() && !feed.state(StageId::Clean).is_initiated() {
                let existing = self.entities.ids_for_feed(feed.id).await?;
                tracing::debug!(entities = existing.len(), "Tracking entities for cleanup");
                feed.state_mut(StageId::Clean).init_pending(existing);
            }
            self.feeds.save(feed).await?;

            tracing::debug!(items = count, progress, "Parsed batch");
            self.emit(ImportEvent::Parsed {
                feed_id: feed.id,
                items: parsed.items.len(),
                progress,
            });
        }

        let mut next: Vec<Operation> = parsed
            .items
            .into_iter()
            .zip(first_index..)
            .map(|(item, index)| op.next(Stage::Process { item, index }))
            .collect();
        next.push(op.next(Stage::Finish {
            fetched: fetched.clone(),
        }));
        Ok(next)
    }

    async fn process(
        &self,
        ctx: &ImportContext,
        feed: &mut Feed,
        feed_type: &FeedType,
        item: &Item,
        index: u64,
    ) -> ImportResult<Vec<Operation>> {
        if index < feed.state(StageId::Process).position {
            tracing::debug!(index, key = %item.key, "Item already processed");
            return Ok(Vec::new());
        }

        let outcome = feed_type
            .processor
            .process(ctx, feed, item, self.entities.as_ref())
            .await
            .with_context(|| format!("Failed to process item {}", item.key))?;

        let state = feed.state_mut(StageId::Process);
        state.position = index + 1;
        state.set_progress(state.total, state.position);
        state.counters.increment(outcome.counter);
        for message in outcome.messages {
            state.message(message);
        }
        if let (Some(id), Some(clean)) = (outcome.entity_id, feed.states.get_mut(&StageId::Clean)) {
            clean.resolve_pending(id);
        }
        // Persist per item: a crash loses at most this item
        self.feeds.save(feed).await?;

        self.emit(ImportEvent::ItemProcessed {
            feed_id: feed.id,
            entity_id: outcome.entity_id,
        });
        Ok(Vec::new())
    }

    async fn finish(
        &self,
        op: &Operation,
        feed: &mut Feed,
        feed_type: &FeedType,
        fetched: &FetchResult,
        token: LockToken,
    ) -> ImportResult<Vec<Operation>> {
        let parse = feed.state(StageId::Parse);
        if !parse.is_complete() {
            return Ok(vec![op.next(Stage::Parse {
                fetched: fetched.clone(),
                pointer: parse.pointer,
                batch: parse.position,
            })]);
        }
        let fetch = feed.state(StageId::Fetch);
        if !fetch.is_complete() {
            return Ok(vec![op.next(Stage::Fetch {
                pointer: fetch.pointer,
                page: fetch.position,
            })]);
        }

        let finish = op.next(Stage::Finish {
            fetched: fetched.clone(),
        });

        // Without a single item there is nothing to tell stale entities apart
        let clean = feed.state(StageId::Clean);
        let seen_items = feed.state(StageId::Process).total > 0;
        if !seen_items && clean.is_initiated() {
            tracing::warn!("Source yielded no valid items, skipping cleanup");
        }
        if feed_type.processor.cleans() && seen_items && clean.is_initiated() && !clean.is_complete() {
            let mut next: Vec<Operation> = clean
                .pending()
                .into_iter()
                .map(|entity_id| op.next(Stage::Clean { entity_id }))
                .collect();
            tracing::debug!(stale = next.len(), "Cleaning entities missing from source");
            next.push(finish);
            return Ok(next);
        }

        if let Some(expire_after) = feed_type.processor.expire_after() {
            if !feed.state(StageId::Expire).is_initiated() {
                let expired = self
                    .entities
                    .expired_ids(feed.id, Utc::now() - expire_after)
                    .await?;
                feed.state_mut(StageId::Expire).init_pending(expired);
                self.feeds.save(feed).await?;
            }
            let expire = feed.state(StageId::Expire);
            if !expire.is_complete() {
                let mut next: Vec<Operation> = expire
                    .pending()
                    .into_iter()
                    .map(|entity_id| op.next(Stage::Expire { entity_id }))
                    .collect();
                next.push(finish);
                return Ok(next);
            }
        }

        self.finish_import(feed, feed_type, token, Some(fetched)).await?;
        Ok(Vec::new())
    }

    async fn clean(
        &self,
        feed: &mut Feed,
        feed_type: &FeedType,
        entity_id: Uuid,
    ) -> ImportResult<Vec<Operation>> {
        if !feed.state(StageId::Clean).pending().contains(&entity_id) {
            return Ok(Vec::new());
        }

        let cleaned = feed_type
            .processor
            .clean(entity_id, self.entities.as_ref())
            .await?;
        let state = feed.state_mut(StageId::Clean);
        state.resolve_pending(entity_id);
        if cleaned {
            state.report(Counter::Cleaned, None);
        }
        self.feeds.save(feed).await?;

        if cleaned {
            self.emit(ImportEvent::Cleaned {
                feed_id: feed.id,
                entity_id,
            });
        }
        Ok(Vec::new())
    }

    async fn expire(&self, feed: &mut Feed, entity_id: Uuid) -> ImportResult<Vec<Operation>> {
        if !feed.state(StageId::Expire).pending().contains(&entity_id) {
            return Ok(Vec::new());
        }

        let deleted = self.entities.delete(entity_id).await?;
        let state = feed.state_mut(StageId::Expire);
        state.resolve_pending(entity_id);
        if deleted {
            state.report(Counter::Deleted, None);
        }
        self.feeds.save(feed).await?;

        if deleted {
            self.emit(ImportEvent::Expired {
                feed_id: feed.id,
                entity_id,
            });
        }
        Ok(Vec::new())
    }

    /// Record the finished import and release the lock
    async fn finish_import(
        &self,
        feed: &mut Feed,
        feed_type: &FeedType,
        token: LockToken,
        fetched: Option<&FetchResult>,
    ) -> ImportResult<()> {
        let now = Utc::now();
        let mut summary = ImportSummary::from_states(&feed.states);
        summary.finished_at = Some(now);

        // Only a clean run may vouch for the source; otherwise refetch next time
        if let Some(fetched) = fetched {
            let clean_run = summary.counters.failed == 0
                && summary.messages.iter().all(|m| m.severity == Severity::Status);
            feed.source_fingerprint = if clean_run {
                fetched.source_fingerprint.clone()
            } else {
                None
            };
        }

        feed.imported_at = Some(now);
        feed.next_import_at = feed_type
            .import_period
            .and_then(|period| chrono::Duration::from_std(period).ok())
            .map(|period| now + period);
        feed.queued_at = None;
        feed.item_count = self.entities.count_for_feed(feed.id).await?;
        feed.last_summary = Some(summary.clone());
        feed.lock = None;
        feed.clear_states();
        self.feeds.save(feed).await?;
        self.locks.release(feed.id, &token).await?;

        tracing::info!(
            items = summary.items,
            created = summary.counters.created,
            updated = summary.counters.updated,
            failed = summary.counters.failed,
            "Import finished"
        );
        self.emit(ImportEvent::Finished {
            feed_id: feed.id,
            summary,
        });
        Ok(())
    }

    async fn finish_early(&self, ctx: &ImportContext, op: &Operation) -> ImportResult<()> {
        let Some(token) = op.token else {
            return Ok(());
        };
        let mut feed = self.load_feed(op.feed_id).await?;
        let feed_type = self.types.get(&feed.feed_type)?;
        tracing::debug!(actor = %ctx.actor, "Finishing import without new items");
        self.finish_import(&mut feed, &feed_type, token, None).await
    }

    /// Drop the import state of a failed import and release its lock
    async fn abort_import(&self, ctx: &ImportContext, op: &Operation, reason: &str) -> ImportResult<()> {
        if let Some(token) = op.token {
            self.locks.release(op.feed_id, &token).await?;
        }
        if let Some(mut feed) = self.feeds.load(op.feed_id).await? {
            if feed.lock.as_ref().map(|l| l.token) == op.token {
                feed.clear_states();
                feed.lock = None;
                feed.queued_at = None;
                self.feeds.save(&feed).await?;
            }
        }

        tracing::debug!(actor = %ctx.actor, "Import state cleared");
        self.emit(ImportEvent::Aborted {
            feed_id: op.feed_id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Cancel whatever import holds the feed
    ///
    /// Outstanding operations of that import become stale: their token no
    /// longer holds the lock.
    pub async fn unlock(&self, ctx: &ImportContext, feed_id: Uuid) -> ImportResult<()> {
        self.locks.force_release(feed_id).await?;

        let mut feed = self.load_feed(feed_id).await?;
        let was_running = feed.lock.is_some() || !feed.states.is_empty();
        feed.clear_states();
        feed.lock = None;
        feed.queued_at = None;
        self.feeds.save(&feed).await?;

        tracing::info!(feed_id = %feed_id, actor = %ctx.actor, was_running, "Feed unlocked");
        if was_running {
            self.emit(ImportEvent::Aborted {
                feed_id,
                reason: "Import cancelled".to_string(),
            });
        }
        Ok(())
    }
}
