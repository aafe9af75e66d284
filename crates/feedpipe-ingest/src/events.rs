//! Lifecycle events emitted at stage boundaries
//!
//! Listeners are registered on the executor and called in registration
//! order. Each event is emitted once per logical occurrence, however many
//! requests or worker runs the import spans.

use serde::Serialize;
use uuid::Uuid;

use crate::feed::ImportSummary;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ImportEvent {
    Started { feed_id: Uuid },
    Fetched { feed_id: Uuid, progress: f64 },
    Parsed { feed_id: Uuid, items: usize, progress: f64 },
    ItemProcessed { feed_id: Uuid, entity_id: Option<Uuid> },
    Cleaned { feed_id: Uuid, entity_id: Uuid },
    Expired { feed_id: Uuid, entity_id: Uuid },
    Finished { feed_id: Uuid, summary: ImportSummary },
    Aborted { feed_id: Uuid, reason: String },
}

impl ImportEvent {
    pub fn feed_id(&self) -> Uuid {
        match self {
            ImportEvent::Started { feed_id }
            | ImportEvent::Fetched { feed_id, .. }
            | ImportEvent::Parsed { feed_id, .. }
            | ImportEvent::ItemProcessed { feed_id, .. }
            | ImportEvent::Cleaned { feed_id, .. }
            | ImportEvent::Expired { feed_id, .. }
            | ImportEvent::Finished { feed_id, .. }
            | ImportEvent::Aborted { feed_id, .. } => *feed_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ImportEvent::Started { .. } => "started",
            ImportEvent::Fetched { .. } => "fetched",
            ImportEvent::Parsed { .. } => "parsed",
            ImportEvent::ItemProcessed { .. } => "item_processed",
            ImportEvent::Cleaned { .. } => "cleaned",
            ImportEvent::Expired { .. } => "expired",
            ImportEvent::Finished { .. } => "finished",
            ImportEvent::Aborted { .. } => "aborted",
        }
    }
}

pub trait ImportListener: Send + Sync {
    fn on_event(&self, event: &ImportEvent);
}

/// Writes lifecycle milestones to the log
#[derive(Debug, Default)]
pub struct LoggingListener;

impl ImportListener for LoggingListener {
    fn on_event(&self, event: &ImportEvent) {
        match event {
            ImportEvent::Finished { feed_id, summary } => tracing::info!(
                feed_id = %feed_id,
                items = summary.items,
                created = summary.counters.created,
                updated = summary.counters.updated,
                skipped = summary.counters.skipped,
                failed = summary.counters.failed,
                cleaned = summary.counters.cleaned,
                "Import finished"
            ),
            ImportEvent::Aborted { feed_id, reason } => {
                tracing::warn!(feed_id = %feed_id, reason = %reason, "Import aborted")
            },
            ImportEvent::ItemProcessed { .. } => {},
            other => tracing::debug!(feed_id = %other.feed_id(), event = other.name(), "Import event"),
        }
    }
}
