//! PostgreSQL operation queue
//!
//! Workers lease rows with `FOR UPDATE SKIP LOCKED`. Only the oldest pending
//! row of each feed is eligible, which keeps a feed's operations in order
//! while different feeds are worked in parallel.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{secs, to_u64};
use crate::executor::Operation;
use crate::queue::{Delivery, QueueBackend};

#[derive(Debug, sqlx::FromRow)]
struct DeliveryRow {
    id: i64,
    queue: String,
    operation: Json<Operation>,
    attempts: i32,
}

impl From<DeliveryRow> for Delivery {
    fn from(row: DeliveryRow) -> Self {
        Delivery {
            id: row.id,
            queue: row.queue,
            operation: row.operation.0,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
        }
    }
}

pub struct PgQueue {
    pool: Arc<PgPool>,
}

impl PgQueue {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    async fn insert_all(
        tx: &mut Transaction<'_, Postgres>,
        queue: &str,
        operations: Vec<Operation>,
    ) -> Result<()> {
        for operation in operations {
            sqlx::query("INSERT INTO import_queue (queue, feed_id, operation) VALUES ($1, $2, $3)")
                .bind(queue)
                .bind(operation.feed_id)
                .bind(Json(&operation))
                .execute(&mut **tx)
                .await
                .context("Failed to enqueue operation")?;
        }
        Ok(())
    }

    /// Dead-lettered operations of `queue` with their last error
    pub async fn dead_letters(&self, queue: &str) -> Result<Vec<(Operation, Option<String>)>> {
        let rows: Vec<(Json<Operation>, Option<String>)> = sqlx::query_as(
            "SELECT operation, last_error FROM import_queue WHERE queue = $1 AND status = 'dead' ORDER BY id",
        )
        .bind(queue)
        .fetch_all(&*self.pool)
        .await
        .context("Failed to list dead letters")?;
        Ok(rows.into_iter().map(|(Json(op), error)| (op, error)).collect())
    }
}

#[async_trait]
impl QueueBackend for PgQueue {
    async fn enqueue_all(&self, queue: &str, operations: Vec<Operation>) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        Self::insert_all(&mut tx, queue, operations).await?;
        tx.commit().await.context("Failed to commit enqueue")?;
        Ok(())
    }

    async fn dequeue(&self, queue: &str, lease: Duration) -> Result<Option<Delivery>> {
        let row = sqlx::query_as::<_, DeliveryRow>(
            r#"
            WITH heads AS (
                SELECT DISTINCT ON (feed_id) id
                FROM import_queue
                WHERE status = 'pending'
                ORDER BY feed_id, id
            )
            UPDATE import_queue
            SET attempts = attempts + 1,
                leased_until = NOW() + make_interval(secs => $2)
            WHERE id = (
                SELECT q.id
                FROM import_queue q
                JOIN heads h ON h.id = q.id
                WHERE q.queue = $1
                  AND (q.leased_until IS NULL OR q.leased_until <= NOW())
                  AND q.available_at <= NOW()
                ORDER BY q.id
                LIMIT 1
                FOR UPDATE OF q SKIP LOCKED
            )
            RETURNING id, queue, operation, attempts
            "#,
        )
        .bind(queue)
        .bind(secs(lease))
        .fetch_optional(&*self.pool)
        .await
        .context("Failed to dequeue operation")?;

        Ok(row.map(Delivery::from))
    }

    async fn complete(&self, delivery: &Delivery, follow_ups: Vec<Operation>) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let deleted = sqlx::query("DELETE FROM import_queue WHERE id = $1 AND status = 'pending'")
            .bind(delivery.id)
            .execute(&mut *tx)
            .await
            .context("Failed to acknowledge operation")?;

        // Purged while running: the import was cancelled
        if deleted.rows_affected() == 0 {
            tx.rollback().await.context("Failed to roll back")?;
            return Ok(());
        }

        Self::insert_all(&mut tx, &delivery.queue, follow_ups).await?;
        tx.commit().await.context("Failed to commit completion")?;
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        sqlx::query("DELETE FROM import_queue WHERE id = $1")
            .bind(delivery.id)
            .execute(&*self.pool)
            .await
            .context("Failed to acknowledge operation")?;
        Ok(())
    }

    async fn release(
        &self,
        delivery: &Delivery,
        error: &str,
        retry_after: Duration,
        max_attempts: u32,
    ) -> Result<bool> {
        let status: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE import_queue
            SET leased_until = NULL,
                last_error = $2,
                status = CASE WHEN attempts >= $3 THEN 'dead' ELSE 'pending' END,
                available_at = NOW() + make_interval(secs => $4)
            WHERE id = $1
            RETURNING status
            "#,
        )
        .bind(delivery.id)
        .bind(error)
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .bind(secs(retry_after))
        .fetch_optional(&*self.pool)
        .await
        .context("Failed to release operation")?;

        Ok(status.as_deref() == Some("dead"))
    }

    async fn purge_feed(&self, feed_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM import_queue WHERE feed_id = $1 AND status = 'pending'")
            .bind(feed_id)
            .execute(&*self.pool)
            .await
            .context("Failed to purge feed operations")?;
        Ok(result.rows_affected())
    }

    async fn len(&self, queue: &str) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM import_queue WHERE queue = $1 AND status = 'pending'")
                .bind(queue)
                .fetch_one(&*self.pool)
                .await
                .context("Failed to count queue")?;
        Ok(to_u64(count))
    }
}
