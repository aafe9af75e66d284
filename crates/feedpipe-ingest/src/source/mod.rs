//! Source collaborators
//!
//! A [`Fetcher`] turns a feed's source locator into a [`FetchResult`]; a
//! [`Parser`] turns a fetch result into [`Item`]s. Both support partial
//! results: they report a completion fraction and a resume pointer, and are
//! called again with that pointer until the fraction reaches complete.

pub mod csv;
pub mod file;
pub mod http;
pub mod jsonl;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::context::ImportContext;
use crate::error::ImportResult;
use crate::feed::Feed;
use crate::state::{StageMessage, COMPLETE};

pub use self::csv::CsvParser;
pub use self::file::FileFetcher;
pub use self::http::HttpFetcher;
pub use self::jsonl::JsonLinesParser;

/// One record of a parsed source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Identity key used to find the entity this item produced before
    pub key: String,
    pub fields: BTreeMap<String, Value>,
}

impl Item {
    /// Build an item keyed by `key_field`
    ///
    /// Items without a usable key are keyed by the hash of their fields.
    pub fn new(fields: BTreeMap<String, Value>, key_field: Option<&str>) -> ImportResult<Self> {
        let key = key_field
            .and_then(|field| fields.get(field))
            .and_then(|value| match value {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
        let key = match key {
            Some(key) => key,
            None => feedpipe_common::checksum::fingerprint(&fields)?,
        };
        Ok(Self { key, fields })
    }

    /// Values of `field` as a list; arrays are flattened, null is empty
    pub fn values(&self, field: &str) -> Vec<Value> {
        match self.fields.get(field) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(values)) => values.clone(),
            Some(value) => vec![value.clone()],
        }
    }
}

/// Raw payload of one fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    pub payload: String,
    pub progress: f64,
    /// Where the next fetch resumes (page, file index, ...)
    pub pointer: Option<Value>,
    /// ETag or content hash of the source, for unchanged detection
    pub source_fingerprint: Option<String>,
}

impl FetchResult {
    pub fn complete(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            progress: COMPLETE,
            pointer: None,
            source_fingerprint: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: Option<String>) -> Self {
        self.source_fingerprint = fingerprint;
        self
    }
}

/// One batch of parsed items
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseResult {
    pub items: Vec<Item>,
    pub progress: f64,
    pub pointer: Option<Value>,
    /// Problems with individual records that were skipped
    pub messages: Vec<StageMessage>,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the next slice of the feed's source
    ///
    /// Returns [`ImportError::EmptySource`](crate::ImportError::EmptySource)
    /// when the source is unchanged since the last import.
    async fn fetch(
        &self,
        ctx: &ImportContext,
        feed: &Feed,
        pointer: Option<&Value>,
    ) -> ImportResult<FetchResult>;
}

pub trait Parser: Send + Sync {
    /// Parse the next batch of items from `fetched`, starting at `pointer`
    fn parse(&self, fetched: &FetchResult, pointer: Option<&Value>) -> ImportResult<ParseResult>;
}

/// Read a numeric resume pointer; missing means start
pub(crate) fn offset(pointer: Option<&Value>) -> usize {
    pointer.and_then(Value::as_u64).unwrap_or(0) as usize
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_item_key_from_field() {
        let mut fields = BTreeMap::new();
        fields.insert("guid".to_string(), json!(" a-1 "));
        let item = Item::new(fields, Some("guid")).unwrap();
        assert_eq!(item.key, "a-1");
    }

    #[test]
    fn test_item_key_falls_back_to_hash() {
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), json!("hello"));
        let a = Item::new(fields.clone(), Some("guid")).unwrap();
        let b = Item::new(fields, None).unwrap();
        assert_eq!(a.key, b.key);
        assert_eq!(a.key.len(), 64);
    }

    #[test]
    fn test_item_values() {
        let mut fields = BTreeMap::new();
        fields.insert("tags".to_string(), json!(["a", "b"]));
        fields.insert("title".to_string(), json!("t"));
        fields.insert("none".to_string(), Value::Null);
        let item = Item::new(fields, None).unwrap();

        assert_eq!(item.values("tags").len(), 2);
        assert_eq!(item.values("title"), vec![json!("t")]);
        assert!(item.values("none").is_empty());
        assert!(item.values("missing").is_empty());
    }
}
