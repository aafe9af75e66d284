//! HTTP fetcher
//!
//! Sends the ETag of the last import as `If-None-Match`; a `304 Not
//! Modified` answer ends the import as unchanged.

use async_trait::async_trait;
use feedpipe_common::checksum::{checksum_bytes, ChecksumAlgorithm};
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;

use super::{FetchResult, Fetcher};
use crate::context::ImportContext;
use crate::error::{ImportError, ImportResult};
use crate::feed::Feed;

/// Default request timeout
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    /// Compare the body hash with the last import when the server sends no ETag
    skip_unchanged: bool,
}

impl HttpFetcher {
    pub fn new(timeout_secs: u64, skip_unchanged: bool) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("feedpipe/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            skip_unchanged,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        _ctx: &ImportContext,
        feed: &Feed,
        _pointer: Option<&Value>,
    ) -> ImportResult<FetchResult> {
        let mut request = self.client.get(&feed.source);
        // Content hashes are bare hex; ETags are quoted or weak
        if let Some(etag) = feed
            .source_fingerprint
            .as_deref()
            .filter(|f| f.starts_with('"') || f.starts_with("W/"))
        {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ImportError::recoverable(format!("Request to {} failed: {}", feed.source, e)))?;

        if response.status() == StatusCode::NOT_MODIFIED {
            tracing::info!(feed_id = %feed.id, "Source not modified since last import");
            return Err(ImportError::EmptySource);
        }
        if !response.status().is_success() {
            return Err(ImportError::recoverable(format!(
                "Download of {} failed with HTTP {}",
                feed.source,
                response.status()
            )));
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let payload = response
            .text()
            .await
            .map_err(|e| ImportError::recoverable(format!("Failed to read response body: {}", e)))?;

        let fingerprint = match etag {
            Some(etag) => etag,
            None => {
                let hash = checksum_bytes(payload.as_bytes(), ChecksumAlgorithm::Sha256)?;
                if self.skip_unchanged && feed.source_fingerprint.as_deref() == Some(hash.as_str()) {
                    tracing::info!(feed_id = %feed.id, "Source content unchanged since last import");
                    return Err(ImportError::EmptySource);
                }
                hash
            },
        };

        Ok(FetchResult::complete(payload).with_fingerprint(Some(fingerprint)))
    }
}
