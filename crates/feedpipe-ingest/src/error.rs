//! Import error taxonomy
//!
//! Whole-import failures are [`ImportError`] values. Per-item problems are
//! [`TargetError`] values; they are recorded on the process stage and never
//! abort a batch.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for pipeline operations
pub type ImportResult<T> = std::result::Result<T, ImportError>;

/// Errors that can end or prevent an import attempt
#[derive(Error, Debug)]
pub enum ImportError {
    /// Nothing to import, or the source is unchanged. Finishes the import
    /// quietly.
    #[error("Source is empty or unchanged")]
    EmptySource,

    /// Transient failure worth a user-visible warning. Direct and batch
    /// imports abort and unlock; queued imports get the message redelivered.
    #[error("{0}")]
    Recoverable(String),

    /// Another import holds the feed lock.
    #[error("Feed {0} is locked by another import")]
    LockUnavailable(Uuid),

    #[error("Feed not found: {0}")]
    FeedNotFound(Uuid),

    #[error("Unknown feed type: {0}")]
    UnknownFeedType(String),

    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl ImportError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        ImportError::Recoverable(message.into())
    }

    /// Whether the queue strategy should let the message be redelivered
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ImportError::LockUnavailable(_)
                | ImportError::FeedNotFound(_)
                | ImportError::UnknownFeedType(_)
        )
    }
}

impl From<serde_json::Error> for ImportError {
    fn from(err: serde_json::Error) -> Self {
        ImportError::Fatal(err.into())
    }
}

impl From<feedpipe_common::CommonError> for ImportError {
    fn from(err: feedpipe_common::CommonError) -> Self {
        ImportError::Fatal(err.into())
    }
}

/// Per-item outcome of writing one mapped field onto an entity
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    /// Source value absent; the target field is left untouched.
    #[error("Empty value for target {target}")]
    EmptyValue { target: String },

    /// The item points at an entity that does not exist yet.
    #[error("Referenced item(s) not found for {target}: {}", keys.join(", "))]
    ReferenceNotFound { target: String, keys: Vec<String> },

    /// The mapped value is not acceptable for the target.
    #[error("Invalid value for {target}: {message}")]
    Validation { target: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ImportError::recoverable("timeout").is_retryable());
        assert!(ImportError::Fatal(anyhow::anyhow!("db down")).is_retryable());
        assert!(!ImportError::LockUnavailable(Uuid::new_v4()).is_retryable());
        assert!(!ImportError::UnknownFeedType("rss".into()).is_retryable());
    }

    #[test]
    fn test_reference_not_found_message() {
        let err = TargetError::ReferenceNotFound {
            target: "parent".into(),
            keys: vec!["b".into(), "c".into()],
        };
        assert_eq!(err.to_string(), "Referenced item(s) not found for parent: b, c");
    }
}
