//! Local file fetcher
//!
//! A file source is fetched in one go. A directory source is fetched one
//! file per call, in name order, with the file index as resume pointer.

use anyhow::Context;
use async_trait::async_trait;
use feedpipe_common::checksum::{checksum_bytes, ChecksumAlgorithm};
use serde_json::Value;
use std::path::{Path, PathBuf};

use super::{offset, FetchResult, Fetcher};
use crate::context::ImportContext;
use crate::error::{ImportError, ImportResult};
use crate::feed::Feed;
use crate::state::progress;

#[derive(Debug, Clone, Default)]
pub struct FileFetcher {
    /// End the import early when the file hash matches the last import
    pub skip_unchanged: bool,
}

impl FileFetcher {
    pub fn new(skip_unchanged: bool) -> Self {
        Self { skip_unchanged }
    }

    async fn list_dir(dir: &Path) -> ImportResult<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("Failed to read directory {}", dir.display()))?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.context("Failed to list directory")? {
            let path = entry.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn read(path: &Path) -> ImportResult<String> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ImportError::recoverable(format!("Cannot read {}: {}", path.display(), e)))?;
        String::from_utf8(bytes)
            .map_err(|_| ImportError::recoverable(format!("{} is not valid UTF-8", path.display())))
    }
}

#[async_trait]
impl Fetcher for FileFetcher {
    async fn fetch(
        &self,
        _ctx: &ImportContext,
        feed: &Feed,
        pointer: Option<&Value>,
    ) -> ImportResult<FetchResult> {
        let path = PathBuf::from(&feed.source);

        if path.is_dir() {
            let files = Self::list_dir(&path).await?;
            let index = offset(pointer);
            let Some(file) = files.get(index) else {
                return Err(ImportError::EmptySource);
            };
            tracing::debug!(feed_id = %feed.id, file = %file.display(), "Fetching directory entry");

            let payload = Self::read(file).await?;
            let next = index + 1;
            return Ok(FetchResult {
                payload,
                progress: progress(files.len() as u64, next as u64),
                pointer: Some(Value::from(next as u64)),
                source_fingerprint: None,
            });
        }

        let payload = Self::read(&path).await?;
        let hash = checksum_bytes(payload.as_bytes(), ChecksumAlgorithm::Sha256)?;
        if self.skip_unchanged && feed.source_fingerprint.as_deref() == Some(hash.as_str()) {
            tracing::info!(feed_id = %feed.id, "Source file unchanged since last import");
            return Err(ImportError::EmptySource);
        }

        Ok(FetchResult::complete(payload).with_fingerprint(Some(hash)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::feed::NewFeed;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn feed_for(source: &Path) -> Feed {
        Feed::new(NewFeed {
            feed_type: "articles".into(),
            title: "Articles".into(),
            source: source.display().to_string(),
            owner: None,
            active: true,
        })
    }

    #[tokio::test]
    async fn test_fetch_single_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "guid,title").unwrap();
        writeln!(file, "1,First").unwrap();

        let feed = feed_for(file.path());
        let fetched = FileFetcher::default()
            .fetch(&ImportContext::system(), &feed, None)
            .await
            .unwrap();

        assert!(fetched.payload.starts_with("guid,title"));
        assert_eq!(fetched.progress, 1.0);
        assert!(fetched.source_fingerprint.is_some());
    }

    #[tokio::test]
    async fn test_unchanged_file_is_empty_source() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "guid\n1").unwrap();

        let mut feed = feed_for(file.path());
        let fetcher = FileFetcher::new(true);
        let first = fetcher.fetch(&ImportContext::system(), &feed, None).await.unwrap();
        feed.source_fingerprint = first.source_fingerprint;

        let second = fetcher.fetch(&ImportContext::system(), &feed, None).await;
        assert!(matches!(second, Err(ImportError::EmptySource)));
    }

    #[tokio::test]
    async fn test_directory_is_fetched_file_by_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.csv"), "guid\n1\n").unwrap();
        std::fs::write(dir.path().join("b.csv"), "guid\n2\n").unwrap();

        let feed = feed_for(dir.path());
        let fetcher = FileFetcher::default();
        let ctx = ImportContext::system();

        let first = fetcher.fetch(&ctx, &feed, None).await.unwrap();
        assert_eq!(first.payload, "guid\n1\n");
        assert!(first.progress < 1.0);

        let second = fetcher.fetch(&ctx, &feed, first.pointer.as_ref()).await.unwrap();
        assert_eq!(second.payload, "guid\n2\n");
        assert_eq!(second.progress, 1.0);
    }

    #[tokio::test]
    async fn test_missing_file_is_recoverable() {
        let feed = feed_for(Path::new("/nonexistent/feed.csv"));
        let result = FileFetcher::default().fetch(&ImportContext::system(), &feed, None).await;
        assert!(matches!(result, Err(ImportError::Recoverable(_))));
    }
}
