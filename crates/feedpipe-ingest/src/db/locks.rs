//! PostgreSQL feed lock
//!
//! One row per held lock. Acquisition takes over a row only when it has
//! expired, so the upsert is the whole critical section.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::secs;
use crate::lock::{FeedLock, LockToken};

pub struct PgFeedLock {
    pool: Arc<PgPool>,
}

impl PgFeedLock {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FeedLock for PgFeedLock {
    async fn try_acquire(&self, feed_id: Uuid, timeout: Duration) -> Result<Option<LockToken>> {
        let token = LockToken::new();
        let acquired: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO feed_locks (feed_id, token, acquired_at, expires_at)
            VALUES ($1, $2, NOW(), NOW() + make_interval(secs => $3))
            ON CONFLICT (feed_id) DO UPDATE SET
                token = EXCLUDED.token,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE feed_locks.expires_at <= NOW()
            RETURNING token
            "#,
        )
        .bind(feed_id)
        .bind(token.0)
        .bind(secs(timeout))
        .fetch_optional(&*self.pool)
        .await
        .context("Failed to acquire feed lock")?;

        Ok(acquired.map(LockToken))
    }

    async fn refresh(&self, feed_id: Uuid, token: &LockToken, timeout: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE feed_locks SET expires_at = NOW() + make_interval(secs => $3)
            WHERE feed_id = $1 AND token = $2
            "#,
        )
        .bind(feed_id)
        .bind(token.0)
        .bind(secs(timeout))
        .execute(&*self.pool)
        .await
        .context("Failed to refresh feed lock")?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, feed_id: Uuid, token: &LockToken) -> Result<()> {
        sqlx::query("DELETE FROM feed_locks WHERE feed_id = $1 AND token = $2")
            .bind(feed_id)
            .bind(token.0)
            .execute(&*self.pool)
            .await
            .context("Failed to release feed lock")?;
        Ok(())
    }

    async fn force_release(&self, feed_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM feed_locks WHERE feed_id = $1")
            .bind(feed_id)
            .execute(&*self.pool)
            .await
            .context("Failed to force-release feed lock")?;
        Ok(())
    }

    async fn is_locked(&self, feed_id: Uuid) -> Result<bool> {
        let locked: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM feed_locks WHERE feed_id = $1 AND expires_at > NOW())",
        )
        .bind(feed_id)
        .fetch_one(&*self.pool)
        .await
        .context("Failed to check feed lock")?;
        Ok(locked)
    }
}
