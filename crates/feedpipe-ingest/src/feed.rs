//! Feed records and their store

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use uuid::Uuid;

use crate::lock::LockInfo;
use crate::state::{Counters, StageId, StageMessage, StageState, MAX_PARTIAL};

/// Outcome of the last finished import
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub finished_at: Option<DateTime<Utc>>,
    pub items: u64,
    pub counters: Counters,
    pub messages: Vec<StageMessage>,
}

impl ImportSummary {
    /// Aggregate counters and messages over every stage
    pub fn from_states(states: &BTreeMap<StageId, StageState>) -> Self {
        let mut summary = Self::default();
        for state in states.values() {
            summary.counters.merge(&state.counters);
            summary.messages.extend(state.messages.iter().cloned());
        }
        summary.items = states.get(&StageId::Process).map(|s| s.total).unwrap_or(0);
        summary
    }
}

/// A configured source plus schedule plus accumulated import state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feed {
    pub id: Uuid,
    pub feed_type: String,
    pub title: String,
    /// Source locator handed to the fetcher (path, URL, ...)
    pub source: String,
    pub owner: Option<String>,
    pub active: bool,
    pub lock: Option<LockInfo>,
    pub imported_at: Option<DateTime<Utc>>,
    pub next_import_at: Option<DateTime<Utc>>,
    pub queued_at: Option<DateTime<Utc>>,
    pub item_count: u64,
    pub states: BTreeMap<StageId, StageState>,
    /// Fingerprint of the last fully imported source (ETag or content hash)
    pub source_fingerprint: Option<String>,
    pub last_summary: Option<ImportSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for a new feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFeed {
    pub feed_type: String,
    pub title: String,
    pub source: String,
    pub owner: Option<String>,
    pub active: bool,
}

impl Feed {
    pub fn new(params: NewFeed) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            feed_type: params.feed_type,
            title: params.title,
            source: params.source,
            owner: params.owner,
            active: params.active,
            lock: None,
            imported_at: None,
            // New active feeds are due right away
            next_import_at: params.active.then_some(now),
            queued_at: None,
            item_count: 0,
            states: BTreeMap::new(),
            source_fingerprint: None,
            last_summary: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// State of `stage`, or a fresh one if the stage has not run
    pub fn state(&self, stage: StageId) -> StageState {
        self.states.get(&stage).cloned().unwrap_or_default()
    }

    pub fn state_mut(&mut self, stage: StageId) -> &mut StageState {
        self.states.entry(stage).or_default()
    }

    pub fn is_complete(&self, stage: StageId) -> bool {
        self.states.get(&stage).is_some_and(StageState::is_complete)
    }

    pub fn clear_states(&mut self) {
        self.states.clear();
    }

    /// Rough overall progress of a running import
    ///
    /// Never reaches [`COMPLETE`](crate::state::COMPLETE): a finished import
    /// has no stage state left.
    pub fn import_progress(&self) -> f64 {
        let fraction =
            |stage: StageId| self.states.get(&stage).map(|s| s.progress).unwrap_or(0.0);
        let average =
            (fraction(StageId::Fetch) + fraction(StageId::Parse) + fraction(StageId::Process)) / 3.0;
        average.min(MAX_PARTIAL)
    }

    /// Whether the scheduler should start an import now
    pub fn is_due(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        if !self.active {
            return false;
        }
        let scheduled = self.next_import_at.is_some_and(|at| at <= now);
        let stale_after = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::zero());
        let not_queued = self.queued_at.is_none_or(|at| at + stale_after < now);
        scheduled && not_queued
    }
}

#[async_trait]
pub trait FeedStore: Send + Sync {
    async fn load(&self, id: Uuid) -> Result<Option<Feed>>;

    async fn save(&self, feed: &Feed) -> Result<()>;

    async fn create(&self, params: NewFeed) -> Result<Feed>;

    async fn list(&self) -> Result<Vec<Feed>>;

    /// Active feeds that are scheduled and not already queued
    ///
    /// A feed queued more than `stale_after` ago counts as not queued.
    async fn due_for_import(&self, now: DateTime<Utc>, stale_after: Duration) -> Result<Vec<Feed>>;
}

#[derive(Debug, Default)]
pub struct MemoryFeedStore {
    feeds: RwLock<HashMap<Uuid, Feed>>,
}

impl MemoryFeedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FeedStore for MemoryFeedStore {
    async fn load(&self, id: Uuid) -> Result<Option<Feed>> {
        Ok(self.feeds.read().get(&id).cloned())
    }

    async fn save(&self, feed: &Feed) -> Result<()> {
        let mut feed = feed.clone();
        feed.updated_at = Utc::now();
        self.feeds.write().insert(feed.id, feed);
        Ok(())
    }

    async fn create(&self, params: NewFeed) -> Result<Feed> {
        let feed = Feed::new(params);
        self.feeds.write().insert(feed.id, feed.clone());
        Ok(feed)
    }

    async fn list(&self) -> Result<Vec<Feed>> {
        let mut feeds: Vec<Feed> = self.feeds.read().values().cloned().collect();
        feeds.sort_by_key(|f| f.created_at);
        Ok(feeds)
    }

    async fn due_for_import(&self, now: DateTime<Utc>, stale_after: Duration) -> Result<Vec<Feed>> {
        let mut due: Vec<Feed> = self
            .feeds
            .read()
            .values()
            .filter(|f| f.is_due(now, stale_after))
            .cloned()
            .collect();
        due.sort_by_key(|f| f.next_import_at);
        Ok(due)
    }
}
