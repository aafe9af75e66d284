//! PostgreSQL entity storage

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use super::to_u64;
use crate::entity::{Entity, EntityStatus, EntityStorage};

const ENTITY_COLUMNS: &str = "id, feed_id, item_key, fields, status, fingerprint, author, imported_at";

#[derive(Debug, sqlx::FromRow)]
struct EntityRow {
    id: Uuid,
    feed_id: Uuid,
    item_key: String,
    fields: Json<BTreeMap<String, Value>>,
    status: String,
    fingerprint: Option<String>,
    author: String,
    imported_at: DateTime<Utc>,
}

impl From<EntityRow> for Entity {
    fn from(row: EntityRow) -> Self {
        Entity {
            id: row.id,
            feed_id: row.feed_id,
            item_key: row.item_key,
            fields: row.fields.0,
            status: EntityStatus::parse(&row.status),
            fingerprint: row.fingerprint,
            author: row.author,
            imported_at: row.imported_at,
        }
    }
}

pub struct PgEntityStorage {
    pool: Arc<PgPool>,
}

impl PgEntityStorage {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntityStorage for PgEntityStorage {
    async fn load(&self, id: Uuid) -> Result<Option<Entity>> {
        let row = sqlx::query_as::<_, EntityRow>(&format!(
            "SELECT {ENTITY_COLUMNS} FROM feed_entities WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .context("Failed to load entity")?;
        Ok(row.map(Entity::from))
    }

    async fn find_by_key(&self, feed_id: Option<Uuid>, item_key: &str) -> Result<Option<Entity>> {
        let row = sqlx::query_as::<_, EntityRow>(&format!(
            r#"
            SELECT {ENTITY_COLUMNS} FROM feed_entities
            WHERE item_key = $1 AND ($2::uuid IS NULL OR feed_id = $2)
            ORDER BY imported_at
            LIMIT 1
            "#
        ))
        .bind(item_key)
        .bind(feed_id)
        .fetch_optional(&*self.pool)
        .await
        .context("Failed to find entity by key")?;
        Ok(row.map(Entity::from))
    }

    async fn find_by_field(&self, feed_id: Uuid, field: &str, value: &Value) -> Result<Option<Entity>> {
        // Scalar field equal to the value, or array field containing it
        let row = sqlx::query_as::<_, EntityRow>(&format!(
            r#"
            SELECT {ENTITY_COLUMNS} FROM feed_entities
            WHERE feed_id = $1
              AND (fields -> $2 = $3
                   OR (jsonb_typeof(fields -> $2) = 'array' AND fields -> $2 @> jsonb_build_array($3)))
            LIMIT 1
            "#
        ))
        .bind(feed_id)
        .bind(field)
        .bind(Json(value))
        .fetch_optional(&*self.pool)
        .await
        .context("Failed to find entity by field")?;
        Ok(row.map(Entity::from))
    }

    async fn save(&self, entity: &Entity) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO feed_entities (id, feed_id, item_key, fields, status, fingerprint, author, imported_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                item_key = EXCLUDED.item_key,
                fields = EXCLUDED.fields,
                status = EXCLUDED.status,
                fingerprint = EXCLUDED.fingerprint,
                author = EXCLUDED.author,
                imported_at = EXCLUDED.imported_at
            "#,
        )
        .bind(entity.id)
        .bind(entity.feed_id)
        .bind(&entity.item_key)
        .bind(Json(&entity.fields))
        .bind(entity.status.as_str())
        .bind(&entity.fingerprint)
        .bind(&entity.author)
        .bind(entity.imported_at)
        .execute(&*self.pool)
        .await
        .with_context(|| format!("Failed to save entity {}", entity.id))?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM feed_entities WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await
            .context("Failed to delete entity")?;
        Ok(result.rows_affected() > 0)
    }

    async fn ids_for_feed(&self, feed_id: Uuid) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar("SELECT id FROM feed_entities WHERE feed_id = $1 ORDER BY id")
            .bind(feed_id)
            .fetch_all(&*self.pool)
            .await
            .context("Failed to list entity ids")?;
        Ok(ids)
    }

    async fn expired_ids(&self, feed_id: Uuid, before: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM feed_entities WHERE feed_id = $1 AND imported_at < $2 ORDER BY id",
        )
        .bind(feed_id)
        .bind(before)
        .fetch_all(&*self.pool)
        .await
        .context("Failed to list expired entities")?;
        Ok(ids)
    }

    async fn count_for_feed(&self, feed_id: Uuid) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM feed_entities WHERE feed_id = $1")
            .bind(feed_id)
            .fetch_one(&*self.pool)
            .await
            .context("Failed to count entities")?;
        Ok(to_u64(count))
    }
}
