//! Feed types: reusable fetcher/parser/processor/mapping configuration
//!
//! Feed types are declared in a TOML file:
//!
//! ```toml
//! [feed_types.articles]
//! import_period_secs = 3600
//! fetcher = { kind = "file", skip_unchanged = true }
//! parser = { kind = "csv", key = "guid", line_limit = 100 }
//! processor = { update_non_existent = "delete" }
//!
//! [[feed_types.articles.mappings]]
//! source = "guid"
//! target = "guid"
//! kind = "identifier"
//! unique = true
//! ```
//!
//! Feed type ids are case-insensitive and stored lowercase.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ImportError;
use crate::processor::{Processor, ProcessorSettings};
use crate::source::http::DEFAULT_HTTP_TIMEOUT_SECS;
use crate::source::{CsvParser, Fetcher, FileFetcher, HttpFetcher, JsonLinesParser, Parser};
use crate::target::Mapping;

fn default_timeout() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_delimiter() -> String {
    ",".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetcherConfig {
    File {
        #[serde(default)]
        skip_unchanged: bool,
    },
    Http {
        #[serde(default = "default_timeout")]
        timeout_secs: u64,
        #[serde(default)]
        skip_unchanged: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParserConfig {
    Csv {
        #[serde(default)]
        key: Option<String>,
        #[serde(default = "default_delimiter")]
        delimiter: String,
        #[serde(default)]
        line_limit: usize,
    },
    JsonLines {
        #[serde(default)]
        key: Option<String>,
        #[serde(default)]
        line_limit: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedTypeConfig {
    pub fetcher: FetcherConfig,
    pub parser: ParserConfig,
    #[serde(default)]
    pub processor: ProcessorSettings,
    #[serde(default)]
    pub mappings: Vec<Mapping>,
    /// Seconds between scheduled imports; none means manual only
    #[serde(default)]
    pub import_period_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FeedTypesFile {
    #[serde(default)]
    feed_types: HashMap<String, FeedTypeConfig>,
}

/// Runtime feed type
pub struct FeedType {
    pub id: String,
    pub fetcher: Arc<dyn Fetcher>,
    pub parser: Arc<dyn Parser>,
    pub processor: Processor,
    pub import_period: Option<Duration>,
}

impl std::fmt::Debug for FeedType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedType")
            .field("id", &self.id)
            .field("processor", &self.processor)
            .field("import_period", &self.import_period)
            .finish_non_exhaustive()
    }
}

impl FeedType {
    pub fn new(
        id: impl Into<String>,
        fetcher: Arc<dyn Fetcher>,
        parser: Arc<dyn Parser>,
        processor: Processor,
    ) -> Self {
        Self {
            id: id.into(),
            fetcher,
            parser,
            processor,
            import_period: None,
        }
    }

    pub fn with_import_period(mut self, period: Option<Duration>) -> Self {
        self.import_period = period;
        self
    }

    pub fn from_config(id: &str, config: FeedTypeConfig) -> Result<Self> {
        for mapping in &config.mappings {
            mapping
                .validate()
                .with_context(|| format!("Invalid mapping in feed type '{}'", id))?;
        }

        let fetcher: Arc<dyn Fetcher> = match config.fetcher {
            FetcherConfig::File { skip_unchanged } => Arc::new(FileFetcher::new(skip_unchanged)),
            FetcherConfig::Http {
                timeout_secs,
                skip_unchanged,
            } => Arc::new(HttpFetcher::new(timeout_secs, skip_unchanged)?),
        };

        let parser: Arc<dyn Parser> = match config.parser {
            ParserConfig::Csv {
                key,
                delimiter,
                line_limit,
            } => {
                let delimiter = match delimiter.as_bytes() {
                    [byte] => *byte,
                    _ => anyhow::bail!(
                        "Feed type '{}': CSV delimiter must be a single byte, got '{}'",
                        id,
                        delimiter
                    ),
                };
                Arc::new(CsvParser::new(key, delimiter, line_limit))
            },
            ParserConfig::JsonLines { key, line_limit } => {
                Arc::new(JsonLinesParser::new(key, line_limit))
            },
        };

        Ok(Self {
            id: id.to_lowercase(),
            fetcher,
            parser,
            processor: Processor::new(config.processor, config.mappings),
            import_period: config.import_period_secs.map(Duration::from_secs),
        })
    }
}

/// Feed types by id
#[derive(Debug, Default, Clone)]
pub struct FeedTypeRegistry {
    types: HashMap<String, Arc<FeedType>>,
}

impl FeedTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, feed_type: FeedType) {
        self.types
            .insert(feed_type.id.to_lowercase(), Arc::new(feed_type));
    }

    pub fn get(&self, id: &str) -> Result<Arc<FeedType>, ImportError> {
        self.types
            .get(&id.to_lowercase())
            .cloned()
            .ok_or_else(|| ImportError::UnknownFeedType(id.to_string()))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.types.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Parse feed types from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()
            .context("Failed to read feed type configuration")?;
        Self::from_settings(settings)
    }

    /// Load feed types from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .build()
            .with_context(|| format!("Failed to read feed types from {}", path.display()))?;
        Self::from_settings(settings)
    }

    fn from_settings(settings: config::Config) -> Result<Self> {
        let file: FeedTypesFile = settings
            .try_deserialize()
            .context("Invalid feed type configuration")?;

        let mut registry = Self::new();
        for (id, config) in file.feed_types {
            registry.register(FeedType::from_config(&id, config)?);
        }
        tracing::debug!(feed_types = ?registry.ids(), "Loaded feed types");
        Ok(registry)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::processor::UpdateNonExistent;
    use crate::target::TargetKind;

    const TOML: &str = r#"
        [feed_types.articles]
        import_period_secs = 3600
        fetcher = { kind = "file", skip_unchanged = true }
        parser = { kind = "csv", key = "guid", delimiter = ";", line_limit = 50 }
        processor = { update_non_existent = "delete", expire_after_secs = 86400 }

        [[feed_types.articles.mappings]]
        source = "guid"
        target = "guid"
        kind = "identifier"
        unique = true

        [[feed_types.articles.mappings]]
        source = "title"
        target = "title"

        [feed_types.products]
        fetcher = { kind = "http", timeout_secs = 10 }
        parser = { kind = "json_lines", key = "sku" }
    "#;

    #[test]
    fn test_load_registry_from_toml() {
        let registry = FeedTypeRegistry::from_toml(TOML).unwrap();
        assert_eq!(registry.ids(), vec!["articles", "products"]);

        let articles = registry.get("articles").unwrap();
        assert_eq!(articles.import_period, Some(Duration::from_secs(3600)));
        assert_eq!(
            articles.processor.settings.update_non_existent,
            UpdateNonExistent::Delete
        );
        assert!(articles.processor.settings.insert_new);
        assert_eq!(articles.processor.mappings.len(), 2);
        assert_eq!(articles.processor.mappings[1].kind, TargetKind::Text);

        let products = registry.get("Products").unwrap();
        assert!(products.import_period.is_none());
    }

    #[test]
    fn test_unknown_feed_type() {
        let registry = FeedTypeRegistry::new();
        assert!(matches!(registry.get("rss"), Err(ImportError::UnknownFeedType(_))));
    }

    #[test]
    fn test_rejects_unique_on_unsupported_kind() {
        let toml = r#"
            [feed_types.bad]
            fetcher = { kind = "file" }
            parser = { kind = "csv" }
            [[feed_types.bad.mappings]]
            source = "date"
            target = "date"
            kind = "timestamp"
            unique = true
        "#;
        assert!(FeedTypeRegistry::from_toml(toml).is_err());
    }

    #[test]
    fn test_rejects_multi_byte_delimiter() {
        let toml = r#"
            [feed_types.bad]
            fetcher = { kind = "file" }
            parser = { kind = "csv", delimiter = "::" }
        "#;
        assert!(FeedTypeRegistry::from_toml(toml).is_err());
    }
}
