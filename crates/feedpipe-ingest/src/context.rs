//! Request context threaded through every stage call

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Account on whose behalf a stage runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    #[default]
    System,
    User(String),
}

impl Actor {
    pub fn user(id: impl Into<String>) -> Self {
        Actor::User(id.into())
    }

    /// Identifier stored as entity author
    pub fn label(&self) -> &str {
        match self {
            Actor::System => "system",
            Actor::User(id) => id,
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-request context
///
/// Built by whoever drives the pipeline (CLI invocation, queue worker run,
/// interactive request) and passed down explicitly; stages never consult
/// global state for the acting account.
#[derive(Debug, Clone)]
pub struct ImportContext {
    pub actor: Actor,
    pub request_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl ImportContext {
    pub fn new(actor: Actor) -> Self {
        Self {
            actor,
            request_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }

    pub fn system() -> Self {
        Self::new(Actor::System)
    }

    /// Same request, acting as the feed owner when it has one
    pub fn acting_as(&self, owner: Option<&str>) -> Self {
        match owner {
            Some(owner) => Self {
                actor: Actor::user(owner),
                ..self.clone()
            },
            None => self.clone(),
        }
    }
}
