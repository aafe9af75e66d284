//! Item processing with change detection
//!
//! Every item is reduced to its mapped target values and fingerprinted. An
//! entity whose stored fingerprint equals the fresh one is left alone. An
//! item that could not be fully applied (missing reference, invalid value)
//! never gets a stored fingerprint, so the next import reconsiders it even
//! when its source content has not changed.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::context::ImportContext;
use crate::entity::{Entity, EntityStatus, EntityStorage};
use crate::error::TargetError;
use crate::feed::Feed;
use crate::source::Item;
use crate::target::Mapping;
use crate::state::{Counter, StageMessage};

/// What to do with an item matching an existing entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateExisting {
    /// Leave existing entities alone
    Skip,
    /// Drop all mutable fields, then write the mapped ones
    Replace,
    /// Overwrite mapped fields, keep the rest
    #[default]
    Update,
}

/// What to do with entities whose item disappeared from the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateNonExistent {
    #[default]
    Keep,
    Delete,
    Unpublish,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorSettings {
    #[serde(default = "default_true")]
    pub insert_new: bool,
    #[serde(default)]
    pub update_existing: UpdateExisting,
    #[serde(default)]
    pub update_non_existent: UpdateNonExistent,
    /// Reprocess items even when their fingerprint is unchanged
    #[serde(default)]
    pub skip_hash_check: bool,
    /// Delete entities not imported for this many seconds
    #[serde(default)]
    pub expire_after_secs: Option<u64>,
    /// Targets that must receive a value
    #[serde(default)]
    pub required_fields: Vec<String>,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            insert_new: true,
            update_existing: UpdateExisting::default(),
            update_non_existent: UpdateNonExistent::default(),
            skip_hash_check: false,
            expire_after_secs: None,
            required_fields: Vec::new(),
        }
    }
}

/// Result of processing one item
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    /// Entity matched or produced by the item
    pub entity_id: Option<Uuid>,
    pub counter: Counter,
    pub messages: Vec<StageMessage>,
}

impl ItemOutcome {
    fn new(entity_id: Option<Uuid>, counter: Counter) -> Self {
        Self {
            entity_id,
            counter,
            messages: Vec::new(),
        }
    }
}

/// Mapped values in mapping order, the input of the fingerprint
pub type MappedValues = Vec<(String, Vec<Value>)>;

#[derive(Debug, Clone)]
pub struct Processor {
    pub settings: ProcessorSettings,
    pub mappings: Vec<Mapping>,
}

impl Processor {
    pub fn new(settings: ProcessorSettings, mappings: Vec<Mapping>) -> Self {
        Self { settings, mappings }
    }

    pub fn cleans(&self) -> bool {
        self.settings.update_non_existent != UpdateNonExistent::Keep
    }

    pub fn expire_after(&self) -> Option<chrono::Duration> {
        self.settings
            .expire_after_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .map(chrono::Duration::seconds)
    }

    pub fn mapped_values(&self, item: &Item) -> MappedValues {
        self.mappings
            .iter()
            .map(|m| (m.target.clone(), item.values(&m.source)))
            .collect()
    }

    pub fn fingerprint(mapped: &MappedValues) -> Result<String> {
        Ok(feedpipe_common::checksum::fingerprint(mapped)?)
    }

    async fn find_existing(
        &self,
        feed: &Feed,
        item: &Item,
        storage: &dyn EntityStorage,
    ) -> Result<Option<Entity>> {
        if let Some(entity) = storage.find_by_key(Some(feed.id), &item.key).await? {
            return Ok(Some(entity));
        }
        for mapping in self.mappings.iter().filter(|m| m.unique) {
            for raw in item.values(&mapping.source) {
                let Ok(value) = mapping.kind.prepare_value(&raw) else {
                    continue;
                };
                if let Some(entity) = storage.find_by_field(feed.id, &mapping.target, &value).await? {
                    return Ok(Some(entity));
                }
            }
        }
        Ok(None)
    }

    /// Create, update or skip the entity for `item`
    pub async fn process(
        &self,
        ctx: &ImportContext,
        feed: &Feed,
        item: &Item,
        storage: &dyn EntityStorage,
    ) -> Result<ItemOutcome> {
        let mapped = self.mapped_values(item);
        let fingerprint = Self::fingerprint(&mapped)?;
        let existing = self.find_existing(feed, item, storage).await?;
        let existing_id = existing.as_ref().map(|e| e.id);

        let missing: Vec<&str> = self
            .settings
            .required_fields
            .iter()
            .filter(|target| {
                let values: Vec<Value> = mapped
                    .iter()
                    .filter(|(t, _)| t == *target)
                    .flat_map(|(_, v)| v.iter().cloned())
                    .collect();
                values.is_empty() || self.kind_of(target.as_str()).is_empty(&values)
            })
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            let mut outcome = ItemOutcome::new(existing_id, Counter::Failed);
            outcome.messages.push(StageMessage::error(format!(
                "Item {}: missing required value for {}",
                item.key,
                missing.join(", ")
            )));
            return Ok(outcome);
        }

        let (mut entity, is_new) = match existing {
            None if !self.settings.insert_new => {
                return Ok(ItemOutcome::new(None, Counter::Skipped));
            },
            None => (Entity::new(feed.id, item.key.clone(), ctx.actor.label()), true),
            Some(_) if self.settings.update_existing == UpdateExisting::Skip => {
                return Ok(ItemOutcome::new(existing_id, Counter::Skipped));
            },
            Some(entity)
                if !self.settings.skip_hash_check
                    && entity.fingerprint.as_deref() == Some(fingerprint.as_str()) =>
            {
                tracing::trace!(feed_id = %feed.id, key = %item.key, "Item unchanged");
                return Ok(ItemOutcome::new(Some(entity.id), Counter::Skipped));
            },
            Some(mut entity) => {
                if self.settings.update_existing == UpdateExisting::Replace {
                    let immutable: Vec<&str> = self
                        .mappings
                        .iter()
                        .filter(|m| !m.kind.is_mutable())
                        .map(|m| m.target.as_str())
                        .collect();
                    entity.fields.retain(|name, _| immutable.contains(&name.as_str()));
                }
                (entity, false)
            },
        };

        let mut outcome = ItemOutcome::new(Some(entity.id), Counter::Created);
        let mut unresolved = false;
        let mut invalid = Vec::new();

        for (mapping, (_, values)) in self.mappings.iter().zip(mapped.iter()) {
            match mapping.set_target(&mut entity, values, storage, is_new).await? {
                Ok(()) | Err(TargetError::EmptyValue { .. }) => {},
                Err(err @ TargetError::ReferenceNotFound { .. }) => {
                    unresolved = true;
                    outcome
                        .messages
                        .push(StageMessage::warning(format!("Item {}: {}", item.key, err)));
                },
                Err(err @ TargetError::Validation { .. }) => invalid.push(err.to_string()),
            }
        }

        if !invalid.is_empty() {
            outcome.counter = Counter::Failed;
            outcome.entity_id = existing_id;
            outcome
                .messages
                .push(StageMessage::error(format!("Item {}: {}", item.key, invalid.join("; "))));
            return Ok(outcome);
        }

        entity.fingerprint = if unresolved { None } else { Some(fingerprint) };
        entity.status = EntityStatus::Published;
        entity.imported_at = Utc::now();
        storage.save(&entity).await?;

        if !is_new {
            outcome.counter = Counter::Updated;
        }
        Ok(outcome)
    }

    fn kind_of(&self, target: &str) -> crate::target::TargetKind {
        self.mappings
            .iter()
            .find(|m| m.target == target)
            .map(|m| m.kind)
            .unwrap_or_default()
    }

    /// Apply the non-existent policy to an entity missing from the source
    ///
    /// Returns whether anything changed.
    pub async fn clean(&self, entity_id: Uuid, storage: &dyn EntityStorage) -> Result<bool> {
        match self.settings.update_non_existent {
            UpdateNonExistent::Keep => Ok(false),
            UpdateNonExistent::Delete => storage.delete(entity_id).await,
            UpdateNonExistent::Unpublish => {
                let Some(mut entity) = storage.load(entity_id).await? else {
                    return Ok(false);
                };
                if entity.status == EntityStatus::Unpublished {
                    return Ok(false);
                }
                entity.status = EntityStatus::Unpublished;
                // Force a reprocess if the item comes back
                entity.fingerprint = None;
                storage.save(&entity).await?;
                Ok(true)
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::entity::MemoryEntityStorage;
    use crate::feed::NewFeed;
    use crate::target::TargetKind;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn feed() -> Feed {
        Feed::new(NewFeed {
            feed_type: "articles".into(),
            title: "Articles".into(),
            source: "memory".into(),
            owner: None,
            active: true,
        })
    }

    fn item(guid: &str, title: &str) -> Item {
        let mut fields = BTreeMap::new();
        fields.insert("guid".to_string(), json!(guid));
        fields.insert("title".to_string(), json!(title));
        Item::new(fields, Some("guid")).unwrap()
    }

    fn processor(settings: ProcessorSettings) -> Processor {
        Processor::new(
            settings,
            vec![
                Mapping::new("guid", "guid", TargetKind::Identifier).unique(),
                Mapping::new("title", "title", TargetKind::Text),
            ],
        )
    }

    #[tokio::test]
    async fn test_create_then_skip_unchanged() {
        let storage = MemoryEntityStorage::new();
        let feed = feed();
        let ctx = ImportContext::system();
        let processor = processor(ProcessorSettings::default());

        let first = processor.process(&ctx, &feed, &item("1", "One"), &storage).await.unwrap();
        assert_eq!(first.counter, Counter::Created);

        let second = processor.process(&ctx, &feed, &item("1", "One"), &storage).await.unwrap();
        assert_eq!(second.counter, Counter::Skipped);
        assert_eq!(second.entity_id, first.entity_id);

        let third = processor.process(&ctx, &feed, &item("1", "Uno"), &storage).await.unwrap();
        assert_eq!(third.counter, Counter::Updated);
        let entity = storage.load(first.entity_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(entity.field("title"), Some(&json!("Uno")));
    }

    #[tokio::test]
    async fn test_skip_hash_check_forces_update() {
        let storage = MemoryEntityStorage::new();
        let feed = feed();
        let ctx = ImportContext::system();
        let processor = processor(ProcessorSettings {
            skip_hash_check: true,
            ..Default::default()
        });

        processor.process(&ctx, &feed, &item("1", "One"), &storage).await.unwrap();
        let again = processor.process(&ctx, &feed, &item("1", "One"), &storage).await.unwrap();
        assert_eq!(again.counter, Counter::Updated);
    }

    #[tokio::test]
    async fn test_insert_and_update_policies() {
        let storage = MemoryEntityStorage::new();
        let feed = feed();
        let ctx = ImportContext::system();

        let no_insert = processor(ProcessorSettings {
            insert_new: false,
            ..Default::default()
        });
        let outcome = no_insert.process(&ctx, &feed, &item("1", "One"), &storage).await.unwrap();
        assert_eq!(outcome.counter, Counter::Skipped);
        assert_eq!(storage.count_for_feed(feed.id).await.unwrap(), 0);

        processor(ProcessorSettings::default())
            .process(&ctx, &feed, &item("1", "One"), &storage)
            .await
            .unwrap();
        let no_update = processor(ProcessorSettings {
            update_existing: UpdateExisting::Skip,
            ..Default::default()
        });
        let outcome = no_update.process(&ctx, &feed, &item("1", "Changed"), &storage).await.unwrap();
        assert_eq!(outcome.counter, Counter::Skipped);
        assert!(outcome.entity_id.is_some());
    }

    #[tokio::test]
    async fn test_replace_drops_unmapped_fields() {
        let storage = MemoryEntityStorage::new();
        let feed = feed();
        let ctx = ImportContext::system();
        let processor = processor(ProcessorSettings {
            update_existing: UpdateExisting::Replace,
            ..Default::default()
        });

        let created = processor.process(&ctx, &feed, &item("1", "One"), &storage).await.unwrap();
        let mut entity = storage.load(created.entity_id.unwrap()).await.unwrap().unwrap();
        entity.fields.insert("note".into(), json!("manual"));
        storage.save(&entity).await.unwrap();

        processor.process(&ctx, &feed, &item("1", "Two"), &storage).await.unwrap();
        let entity = storage.load(entity.id).await.unwrap().unwrap();
        assert!(entity.field("note").is_none());
        assert_eq!(entity.field("guid"), Some(&json!("1")));
        assert_eq!(entity.field("title"), Some(&json!("Two")));
    }

    #[tokio::test]
    async fn test_validation_failure_saves_nothing() {
        let storage = MemoryEntityStorage::new();
        let feed = feed();
        let ctx = ImportContext::system();
        let processor = Processor::new(
            ProcessorSettings::default(),
            vec![Mapping::new("count", "count", TargetKind::Integer)],
        );

        let mut fields = BTreeMap::new();
        fields.insert("count".to_string(), json!("lots"));
        let bad = Item::new(fields, None).unwrap();

        let outcome = processor.process(&ctx, &feed, &bad, &storage).await.unwrap();
        assert_eq!(outcome.counter, Counter::Failed);
        assert_eq!(outcome.messages.len(), 1);
        assert_eq!(storage.count_for_feed(feed.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_required_fields() {
        let storage = MemoryEntityStorage::new();
        let feed = feed();
        let processor = processor(ProcessorSettings {
            required_fields: vec!["title".into()],
            ..Default::default()
        });

        let outcome = processor
            .process(&ImportContext::system(), &feed, &item("1", " "), &storage)
            .await
            .unwrap();
        assert_eq!(outcome.counter, Counter::Failed);
    }

    #[tokio::test]
    async fn test_unresolved_reference_stores_no_fingerprint() {
        let storage = MemoryEntityStorage::new();
        let feed = feed();
        let ctx = ImportContext::system();
        let processor = Processor::new(
            ProcessorSettings::default(),
            vec![Mapping::new("parent", "parent", TargetKind::Reference)],
        );

        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), json!("child"));
        fields.insert("parent".to_string(), json!("missing"));
        let child = Item::new(fields, Some("id")).unwrap();

        let outcome = processor.process(&ctx, &feed, &child, &storage).await.unwrap();
        assert_eq!(outcome.counter, Counter::Created);
        assert_eq!(outcome.messages.len(), 1);

        let entity = storage.load(outcome.entity_id.unwrap()).await.unwrap().unwrap();
        assert!(entity.fingerprint.is_none());

        let again = processor.process(&ctx, &feed, &child, &storage).await.unwrap();
        assert_eq!(again.counter, Counter::Updated);
    }

    #[tokio::test]
    async fn test_unique_mapping_matches_entity_with_other_key() {
        let storage = MemoryEntityStorage::new();
        let feed = feed();
        let mut existing = Entity::new(feed.id, "legacy-key", "system");
        existing.fields.insert("guid".into(), json!("1"));
        storage.save(&existing).await.unwrap();

        let outcome = processor(ProcessorSettings::default())
            .process(&ImportContext::system(), &feed, &item("1", "One"), &storage)
            .await
            .unwrap();
        assert_eq!(outcome.entity_id, Some(existing.id));
        assert_eq!(outcome.counter, Counter::Updated);
    }

    #[tokio::test]
    async fn test_clean_policies() {
        let storage = MemoryEntityStorage::new();
        let feed = feed();
        let entity = Entity::new(feed.id, "gone", "system");
        storage.save(&entity).await.unwrap();

        let unpublish = processor(ProcessorSettings {
            update_non_existent: UpdateNonExistent::Unpublish,
            ..Default::default()
        });
        assert!(unpublish.clean(entity.id, &storage).await.unwrap());
        assert!(!unpublish.clean(entity.id, &storage).await.unwrap());
        let stored = storage.load(entity.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EntityStatus::Unpublished);

        let delete = processor(ProcessorSettings {
            update_non_existent: UpdateNonExistent::Delete,
            ..Default::default()
        });
        assert!(delete.clean(entity.id, &storage).await.unwrap());
        assert!(storage.load(entity.id).await.unwrap().is_none());
    }

    #[test]
    fn test_entity_author_uses_actor() {
        let ctx = ImportContext::new(crate::context::Actor::user("editor"));
        let entity = Entity::new(Uuid::new_v4(), "k", ctx.actor.label());
        assert_eq!(entity.author, "editor");
    }
}
