//! PostgreSQL feed store

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{secs, to_i64, to_u64};
use crate::feed::{Feed, FeedStore, ImportSummary, NewFeed};
use crate::lock::LockInfo;
use crate::state::{StageId, StageState};

const FEED_COLUMNS: &str = "id, feed_type, title, source, owner, active, lock_info, imported_at, \
     next_import_at, queued_at, item_count, states, source_fingerprint, last_summary, created_at, \
     updated_at";

#[derive(Debug, sqlx::FromRow)]
struct FeedRow {
    id: Uuid,
    feed_type: String,
    title: String,
    source: String,
    owner: Option<String>,
    active: bool,
    lock_info: Option<Json<LockInfo>>,
    imported_at: Option<DateTime<Utc>>,
    next_import_at: Option<DateTime<Utc>>,
    queued_at: Option<DateTime<Utc>>,
    item_count: i64,
    states: Json<BTreeMap<StageId, StageState>>,
    source_fingerprint: Option<String>,
    last_summary: Option<Json<ImportSummary>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<FeedRow> for Feed {
    fn from(row: FeedRow) -> Self {
        Feed {
            id: row.id,
            feed_type: row.feed_type,
            title: row.title,
            source: row.source,
            owner: row.owner,
            active: row.active,
            lock: row.lock_info.map(|Json(info)| info),
            imported_at: row.imported_at,
            next_import_at: row.next_import_at,
            queued_at: row.queued_at,
            item_count: to_u64(row.item_count),
            states: row.states.0,
            source_fingerprint: row.source_fingerprint,
            last_summary: row.last_summary.map(|Json(summary)| summary),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

pub struct PgFeedStore {
    pool: Arc<PgPool>,
}

impl PgFeedStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FeedStore for PgFeedStore {
    async fn load(&self, id: Uuid) -> Result<Option<Feed>> {
        let row = sqlx::query_as::<_, FeedRow>(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = $1"))
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .context("Failed to load feed")?;
        Ok(row.map(Feed::from))
    }

    async fn save(&self, feed: &Feed) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO feeds (id, feed_type, title, source, owner, active, lock_info, imported_at,
                               next_import_at, queued_at, item_count, states, source_fingerprint,
                               last_summary, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, NOW())
            ON CONFLICT (id) DO UPDATE SET
                feed_type = EXCLUDED.feed_type,
                title = EXCLUDED.title,
                source = EXCLUDED.source,
                owner = EXCLUDED.owner,
                active = EXCLUDED.active,
                lock_info = EXCLUDED.lock_info,
                imported_at = EXCLUDED.imported_at,
                next_import_at = EXCLUDED.next_import_at,
                queued_at = EXCLUDED.queued_at,
                item_count = EXCLUDED.item_count,
                states = EXCLUDED.states,
                source_fingerprint = EXCLUDED.source_fingerprint,
                last_summary = EXCLUDED.last_summary,
                updated_at = NOW()
            "#,
        )
        .bind(feed.id)
        .bind(&feed.feed_type)
        .bind(&feed.title)
        .bind(&feed.source)
        .bind(&feed.owner)
        .bind(feed.active)
        .bind(feed.lock.as_ref().map(Json))
        .bind(feed.imported_at)
        .bind(feed.next_import_at)
        .bind(feed.queued_at)
        .bind(to_i64(feed.item_count))
        .bind(Json(&feed.states))
        .bind(&feed.source_fingerprint)
        .bind(feed.last_summary.as_ref().map(Json))
        .bind(feed.created_at)
        .execute(&*self.pool)
        .await
        .with_context(|| format!("Failed to save feed {}", feed.id))?;

        Ok(())
    }

    async fn create(&self, params: NewFeed) -> Result<Feed> {
        let feed = Feed::new(params);
        self.save(&feed).await?;
        tracing::info!(feed_id = %feed.id, feed_type = %feed.feed_type, "Feed created");
        Ok(feed)
    }

    async fn list(&self) -> Result<Vec<Feed>> {
        let rows = sqlx::query_as::<_, FeedRow>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds ORDER BY created_at"
        ))
        .fetch_all(&*self.pool)
        .await
        .context("Failed to list feeds")?;
        Ok(rows.into_iter().map(Feed::from).collect())
    }

    async fn due_for_import(&self, now: DateTime<Utc>, stale_after: Duration) -> Result<Vec<Feed>> {
        let rows = sqlx::query_as::<_, FeedRow>(&format!(
            r#"
            SELECT {FEED_COLUMNS} FROM feeds
            WHERE active
              AND next_import_at <= $1
              AND (queued_at IS NULL OR queued_at + make_interval(secs => $2) < $1)
            ORDER BY next_import_at
            "#
        ))
        .bind(now)
        .bind(secs(stale_after))
        .fetch_all(&*self.pool)
        .await
        .context("Failed to query due feeds")?;
        Ok(rows.into_iter().map(Feed::from).collect())
    }
}
