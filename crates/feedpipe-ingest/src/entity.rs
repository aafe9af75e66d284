//! Stored entities produced by imports

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    #[default]
    Published,
    Unpublished,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Published => "published",
            EntityStatus::Unpublished => "unpublished",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "unpublished" => EntityStatus::Unpublished,
            _ => EntityStatus::Published,
        }
    }
}

/// An entity created from a feed item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub feed_id: Uuid,
    /// Identity key of the item that produced this entity
    pub item_key: String,
    pub fields: BTreeMap<String, Value>,
    pub status: EntityStatus,
    /// Fingerprint of the mapped item values; `None` forces reprocessing
    pub fingerprint: Option<String>,
    pub author: String,
    pub imported_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(feed_id: Uuid, item_key: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            feed_id,
            item_key: item_key.into(),
            fields: BTreeMap::new(),
            status: EntityStatus::Published,
            fingerprint: None,
            author: author.into(),
            imported_at: Utc::now(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

#[async_trait]
pub trait EntityStorage: Send + Sync {
    async fn load(&self, id: Uuid) -> Result<Option<Entity>>;

    /// Find by item key, within one feed or across all feeds
    async fn find_by_key(&self, feed_id: Option<Uuid>, item_key: &str) -> Result<Option<Entity>>;

    /// Find an entity of `feed_id` whose `field` holds `value`
    async fn find_by_field(&self, feed_id: Uuid, field: &str, value: &Value) -> Result<Option<Entity>>;

    async fn save(&self, entity: &Entity) -> Result<()>;

    async fn delete(&self, id: Uuid) -> Result<bool>;

    async fn ids_for_feed(&self, feed_id: Uuid) -> Result<Vec<Uuid>>;

    /// Entities of `feed_id` last imported before `before`
    async fn expired_ids(&self, feed_id: Uuid, before: DateTime<Utc>) -> Result<Vec<Uuid>>;

    async fn count_for_feed(&self, feed_id: Uuid) -> Result<u64>;
}

#[derive(Debug, Default)]
pub struct MemoryEntityStorage {
    entities: RwLock<HashMap<Uuid, Entity>>,
}

impl MemoryEntityStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Field match: equal values, or an array field containing the value
fn field_matches(stored: &Value, wanted: &Value) -> bool {
    match stored {
        Value::Array(values) => values.contains(wanted),
        other => other == wanted,
    }
}

#[async_trait]
impl EntityStorage for MemoryEntityStorage {
    async fn load(&self, id: Uuid) -> Result<Option<Entity>> {
        Ok(self.entities.read().get(&id).cloned())
    }

    async fn find_by_key(&self, feed_id: Option<Uuid>, item_key: &str) -> Result<Option<Entity>> {
        Ok(self
            .entities
            .read()
            .values()
            .filter(|e| feed_id.is_none_or(|f| e.feed_id == f))
            .filter(|e| e.item_key == item_key)
            .min_by_key(|e| e.imported_at)
            .cloned())
    }

    async fn find_by_field(&self, feed_id: Uuid, field: &str, value: &Value) -> Result<Option<Entity>> {
        Ok(self
            .entities
            .read()
            .values()
            .find(|e| {
                e.feed_id == feed_id && e.fields.get(field).is_some_and(|v| field_matches(v, value))
            })
            .cloned())
    }

    async fn save(&self, entity: &Entity) -> Result<()> {
        self.entities.write().insert(entity.id, entity.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.entities.write().remove(&id).is_some())
    }

    async fn ids_for_feed(&self, feed_id: Uuid) -> Result<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self
            .entities
            .read()
            .values()
            .filter(|e| e.feed_id == feed_id)
            .map(|e| e.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn expired_ids(&self, feed_id: Uuid, before: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self
            .entities
            .read()
            .values()
            .filter(|e| e.feed_id == feed_id && e.imported_at < before)
            .map(|e| e.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn count_for_feed(&self, feed_id: Uuid) -> Result<u64> {
        Ok(self
            .entities
            .read()
            .values()
            .filter(|e| e.feed_id == feed_id)
            .count() as u64)
    }
}
