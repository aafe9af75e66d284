//! Target mappers
//!
//! A [`Mapping`] copies one item field onto one entity field. How the value
//! is prepared, validated and written depends on the target's
//! [`TargetKind`]; every kind answers the same capability calls.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{Entity, EntityStorage};
use crate::error::TargetError;

/// Outcome of writing one target: storage failures are the outer error,
/// per-item problems the inner one.
pub type TargetResult = anyhow::Result<Result<(), TargetError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    #[default]
    Text,
    Integer,
    Float,
    Boolean,
    /// RFC 3339 string or unix seconds, stored as RFC 3339
    Timestamp,
    /// Item key of another entity, stored as that entity's id
    Reference,
    /// Text that is only written when the entity is created
    Identifier,
}

impl TargetKind {
    /// Whether an existing value may be overwritten
    pub fn is_mutable(&self) -> bool {
        !matches!(self, TargetKind::Identifier)
    }

    /// Whether the kind can serve as a unique lookup key
    pub fn supports_unique(&self) -> bool {
        matches!(self, TargetKind::Text | TargetKind::Integer | TargetKind::Identifier)
    }

    /// Whether the raw source values carry nothing to write
    pub fn is_empty(&self, values: &[Value]) -> bool {
        values.iter().all(|v| match v {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty(),
            Value::Array(items) => items.is_empty(),
            _ => false,
        })
    }

    /// Convert one raw source value into its stored form
    pub fn prepare_value(&self, raw: &Value) -> Result<Value, String> {
        match self {
            TargetKind::Text | TargetKind::Identifier | TargetKind::Reference => match raw {
                Value::String(s) => Ok(Value::String(s.trim().to_string())),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                other => Err(format!("expected text, got {}", other)),
            },
            TargetKind::Integer => match raw {
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(raw.clone()),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| format!("'{}' is not an integer", s)),
                other => Err(format!("expected integer, got {}", other)),
            },
            TargetKind::Float => match raw {
                Value::Number(_) => Ok(raw.clone()),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::from)
                    .map_err(|_| format!("'{}' is not a number", s)),
                other => Err(format!("expected number, got {}", other)),
            },
            TargetKind::Boolean => match raw {
                Value::Bool(_) => Ok(raw.clone()),
                Value::Number(n) => Ok(Value::Bool(n.as_i64() != Some(0))),
                Value::String(s) => match s.trim().to_lowercase().as_str() {
                    "true" | "1" | "yes" | "y" => Ok(Value::Bool(true)),
                    "false" | "0" | "no" | "n" => Ok(Value::Bool(false)),
                    _ => Err(format!("'{}' is not a boolean", s)),
                },
                other => Err(format!("expected boolean, got {}", other)),
            },
            TargetKind::Timestamp => parse_timestamp(raw).map(|ts| Value::String(ts.to_rfc3339())),
        }
    }
}

fn parse_timestamp(raw: &Value) -> Result<DateTime<Utc>, String> {
    match raw {
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .ok_or_else(|| format!("{} is not a valid unix timestamp", n)),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(secs) = s.parse::<i64>() {
                return parse_timestamp(&Value::from(secs));
            }
            DateTime::parse_from_rfc3339(s)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|_| format!("'{}' is not a valid date", s))
        },
        other => Err(format!("expected date, got {}", other)),
    }
}

/// One source field mapped onto one entity field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub kind: TargetKind,
    /// Use this target to find an existing entity
    #[serde(default)]
    pub unique: bool,
    /// Store every source value instead of the first one
    #[serde(default)]
    pub multiple: bool,
}

impl Mapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>, kind: TargetKind) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind,
            unique: false,
            multiple: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.source.trim().is_empty() || self.target.trim().is_empty() {
            anyhow::bail!("Mapping source and target must not be empty");
        }
        if self.unique && !self.kind.supports_unique() {
            anyhow::bail!(
                "Target '{}' of kind {:?} cannot be used as a unique key",
                self.target,
                self.kind
            );
        }
        Ok(())
    }

    fn store(&self, entity: &mut Entity, mut prepared: Vec<Value>) {
        let value = if self.multiple {
            Value::Array(prepared)
        } else {
            prepared.swap_remove(0)
        };
        entity.fields.insert(self.target.clone(), value);
    }

    /// Write `values` onto `entity`
    ///
    /// `is_new` tells immutable targets whether they may be written.
    pub async fn set_target(
        &self,
        entity: &mut Entity,
        values: &[Value],
        storage: &dyn EntityStorage,
        is_new: bool,
    ) -> TargetResult {
        if self.kind.is_empty(values) {
            return Ok(Err(TargetError::EmptyValue {
                target: self.target.clone(),
            }));
        }
        if !self.kind.is_mutable() && !is_new && entity.fields.contains_key(&self.target) {
            return Ok(Ok(()));
        }

        let mut prepared = Vec::new();
        for raw in values.iter().filter(|v| !self.kind.is_empty(std::slice::from_ref(v))) {
            match self.kind.prepare_value(raw) {
                Ok(value) => prepared.push(value),
                Err(message) => {
                    return Ok(Err(TargetError::Validation {
                        target: self.target.clone(),
                        message,
                    }))
                },
            }
            if !self.multiple {
                break;
            }
        }

        if self.kind != TargetKind::Reference {
            self.store(entity, prepared);
            return Ok(Ok(()));
        }

        let mut resolved = Vec::new();
        let mut missing = Vec::new();
        for key in prepared {
            let key = key.as_str().unwrap_or_default().to_string();
            match storage.find_by_key(None, &key).await? {
                Some(found) => resolved.push(Value::String(found.id.to_string())),
                None => missing.push(key),
            }
        }
        if !resolved.is_empty() {
            self.store(entity, resolved);
        }
        if missing.is_empty() {
            Ok(Ok(()))
        } else {
            Ok(Err(TargetError::ReferenceNotFound {
                target: self.target.clone(),
                keys: missing,
            }))
        }
    }
}
