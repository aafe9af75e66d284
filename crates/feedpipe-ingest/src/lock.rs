//! Per-feed mutual exclusion
//!
//! A lock is held for a whole import, from BEGIN to finish or abort. Every
//! lock expires after its timeout, so an import whose worker died frees the
//! feed on its own. Holders refresh the lock on every operation they run.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::error::ImportError;

/// Default lock timeout
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(120);

/// Proof of lock ownership, carried by every operation of one import
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(pub Uuid);

impl LockToken {
    pub fn new() -> Self {
        LockToken(Uuid::new_v4())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Lock as recorded on the feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub token: LockToken,
    pub acquired_at: DateTime<Utc>,
}

#[async_trait]
pub trait FeedLock: Send + Sync {
    /// Take the lock unless an unexpired lock is held
    async fn try_acquire(&self, feed_id: Uuid, timeout: Duration) -> Result<Option<LockToken>>;

    /// Extend the lock if `token` still holds it
    ///
    /// An expired lock that nobody has taken over is still ours.
    async fn refresh(&self, feed_id: Uuid, token: &LockToken, timeout: Duration) -> Result<bool>;

    /// Release the lock held by `token`; a no-op otherwise
    async fn release(&self, feed_id: Uuid, token: &LockToken) -> Result<()>;

    /// Drop whatever lock is held on the feed
    async fn force_release(&self, feed_id: Uuid) -> Result<()>;

    async fn is_locked(&self, feed_id: Uuid) -> Result<bool>;

    /// Take the lock or fail with [`ImportError::LockUnavailable`]
    async fn acquire(&self, feed_id: Uuid, timeout: Duration) -> Result<LockToken, ImportError> {
        self.try_acquire(feed_id, timeout)
            .await?
            .ok_or(ImportError::LockUnavailable(feed_id))
    }
}

#[derive(Debug, Clone)]
struct Held {
    token: LockToken,
    expires_at: DateTime<Utc>,
}

/// Process-local lock table
#[derive(Debug, Default)]
pub struct MemoryFeedLock {
    held: Mutex<HashMap<Uuid, Held>>,
}

impl MemoryFeedLock {
    pub fn new() -> Self {
        Self::default()
    }
}

fn expiry(timeout: Duration) -> DateTime<Utc> {
    let timeout =
        chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(365));
    Utc::now() + timeout
}

#[async_trait]
impl FeedLock for MemoryFeedLock {
    async fn try_acquire(&self, feed_id: Uuid, timeout: Duration) -> Result<Option<LockToken>> {
        let mut held = self.held.lock();
        if let Some(current) = held.get(&feed_id) {
            if current.expires_at > Utc::now() {
                return Ok(None);
            }
        }

        let token = LockToken::new();
        held.insert(
            feed_id,
            Held {
                token,
                expires_at: expiry(timeout),
            },
        );
        Ok(Some(token))
    }

    async fn refresh(&self, feed_id: Uuid, token: &LockToken, timeout: Duration) -> Result<bool> {
        let mut held = self.held.lock();
        match held.get_mut(&feed_id) {
            Some(current) if current.token == *token => {
                current.expires_at = expiry(timeout);
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn release(&self, feed_id: Uuid, token: &LockToken) -> Result<()> {
        let mut held = self.held.lock();
        if held.get(&feed_id).is_some_and(|current| current.token == *token) {
            held.remove(&feed_id);
        }
        Ok(())
    }

    async fn force_release(&self, feed_id: Uuid) -> Result<()> {
        self.held.lock().remove(&feed_id);
        Ok(())
    }

    async fn is_locked(&self, feed_id: Uuid) -> Result<bool> {
        Ok(self
            .held
            .lock()
            .get(&feed_id)
            .is_some_and(|current| current.expires_at > Utc::now()))
    }
}
