//! Per-stage progress bookkeeping
//!
//! Each stage of an import owns a [`StageState`]: a completion fraction, an
//! opaque resume pointer, counters and a message log. The fraction `1.0`
//! ([`COMPLETE`]) is reserved; partial progress is capped just below it so
//! rounding can never end a stage early.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Completion sentinel
pub const COMPLETE: f64 = 1.0;

/// Upper bound for any fraction that is not explicitly complete
pub const MAX_PARTIAL: f64 = 0.99;

/// Pipeline stage with persisted state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageId {
    Fetch,
    Parse,
    Process,
    Clean,
    Expire,
}

impl StageId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Fetch => "fetch",
            StageId::Parse => "parse",
            StageId::Process => "process",
            StageId::Clean => "clean",
            StageId::Expire => "expire",
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counter names accepted by [`StageState::report`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Counter {
    Created,
    Updated,
    Deleted,
    Skipped,
    Failed,
    Cleaned,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub failed: u64,
    pub cleaned: u64,
}

impl Counters {
    pub fn increment(&mut self, counter: Counter) {
        match counter {
            Counter::Created => self.created += 1,
            Counter::Updated => self.updated += 1,
            Counter::Deleted => self.deleted += 1,
            Counter::Skipped => self.skipped += 1,
            Counter::Failed => self.failed += 1,
            Counter::Cleaned => self.cleaned += 1,
        }
    }

    pub fn get(&self, counter: Counter) -> u64 {
        match counter {
            Counter::Created => self.created,
            Counter::Updated => self.updated,
            Counter::Deleted => self.deleted,
            Counter::Skipped => self.skipped,
            Counter::Failed => self.failed,
            Counter::Cleaned => self.cleaned,
        }
    }

    /// Merge counters from another stage
    pub fn merge(&mut self, other: &Counters) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.cleaned += other.cleaned;
    }

    pub fn total(&self) -> u64 {
        self.created + self.updated + self.deleted + self.skipped + self.failed + self.cleaned
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Status,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMessage {
    pub text: String,
    pub severity: Severity,
    /// Whether an identical message may be logged more than once
    pub repeat: bool,
}

impl StageMessage {
    pub fn new(text: impl Into<String>, severity: Severity) -> Self {
        Self {
            text: text.into(),
            severity,
            repeat: true,
        }
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self::new(text, Severity::Warning)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(text, Severity::Error)
    }

    pub fn once(mut self) -> Self {
        self.repeat = false;
        self
    }
}

/// Compute a completion fraction
///
/// Snaps to [`COMPLETE`] when `done >= total` or `total == 0`, otherwise
/// returns `done / total` capped at [`MAX_PARTIAL`].
pub fn progress(total: u64, done: u64) -> f64 {
    if total == 0 || done >= total {
        return COMPLETE;
    }
    (done as f64 / total as f64).min(MAX_PARTIAL)
}

/// Progress of a single stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub progress: f64,
    /// Stage-specific resume pointer, opaque to the executor
    #[serde(default)]
    pub pointer: Option<Value>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub position: u64,
    #[serde(default)]
    pub counters: Counters,
    #[serde(default)]
    pub messages: Vec<StageMessage>,
}

impl StageState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_complete(&self) -> bool {
        self.progress >= COMPLETE
    }

    /// Update the fraction from `total`/`done`
    pub fn set_progress(&mut self, total: u64, done: u64) {
        self.progress = progress(total, done);
    }

    /// Set a fraction reported by a collaborator
    ///
    /// Anything below the sentinel is kept strictly below it.
    pub fn set_fraction(&mut self, fraction: f64) {
        self.progress = if fraction >= COMPLETE {
            COMPLETE
        } else if fraction.is_nan() || fraction < 0.0 {
            0.0
        } else {
            fraction.min(MAX_PARTIAL)
        };
    }

    pub fn complete(&mut self) {
        self.progress = COMPLETE;
    }

    /// Increment a counter and optionally log a message
    pub fn report(&mut self, counter: Counter, message: Option<StageMessage>) {
        self.counters.increment(counter);
        if let Some(message) = message {
            self.message(message);
        }
    }

    /// Append a message; non-repeatable messages are logged once
    pub fn message(&mut self, message: StageMessage) {
        if !message.repeat && self.messages.iter().any(|m| m.text == message.text) {
            return;
        }
        self.messages.push(message);
    }

    /// Start tracking a set of pending entity ids
    ///
    /// Used by the clean and expire stages: the pointer holds the ids still
    /// to be handled and `total` the size of the initial set.
    pub fn init_pending(&mut self, ids: impl IntoIterator<Item = Uuid>) {
        let pending: BTreeSet<Uuid> = ids.into_iter().collect();
        self.total = pending.len() as u64;
        self.position = 0;
        self.pointer = Some(serde_json::json!(pending));
        self.set_progress(self.total, 0);
    }

    /// Whether [`init_pending`](Self::init_pending) has run
    pub fn is_initiated(&self) -> bool {
        self.pointer.is_some()
    }

    pub fn pending(&self) -> Vec<Uuid> {
        self.pointer
            .as_ref()
            .and_then(|p| serde_json::from_value::<Vec<Uuid>>(p.clone()).ok())
            .unwrap_or_default()
    }

    /// Drop `id` from the pending set; returns whether it was pending
    pub fn resolve_pending(&mut self, id: Uuid) -> bool {
        let mut pending = self.pending();
        let before = pending.len();
        pending.retain(|p| *p != id);
        if pending.len() == before {
            return false;
        }
        self.position = self.total.saturating_sub(pending.len() as u64);
        self.pointer = Some(serde_json::json!(pending));
        self.set_progress(self.total, self.position);
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_progress_round_trip() {
        assert_eq!(progress(10, 10), COMPLETE);
        assert_eq!(progress(0, 0), COMPLETE);
        let half = progress(10, 5);
        assert!((half - 0.5).abs() < f64::EPSILON);
        assert!(half < COMPLETE);
    }

    #[test]
    fn test_progress_caps_near_complete() {
        assert_eq!(progress(1000, 999), MAX_PARTIAL);
        assert_eq!(progress(3, 7), COMPLETE);
    }

    #[test]
    fn test_set_fraction_never_rounds_up() {
        let mut state = StageState::new();
        state.set_fraction(0.9999);
        assert!(!state.is_complete());
        state.set_fraction(-1.0);
        assert_eq!(state.progress, 0.0);
        state.set_fraction(1.0);
        assert!(state.is_complete());
    }

    #[test]
    fn test_report_counts_and_logs() {
        let mut state = StageState::new();
        state.report(Counter::Created, None);
        state.report(Counter::Failed, Some(StageMessage::error("bad date")));
        state.report(Counter::Failed, Some(StageMessage::error("bad date")));

        assert_eq!(state.counters.created, 1);
        assert_eq!(state.counters.failed, 2);
        assert_eq!(state.messages.len(), 2);
    }

    #[test]
    fn test_non_repeatable_message_logged_once() {
        let mut state = StageState::new();
        state.message(StageMessage::warning("missing parent").once());
        state.message(StageMessage::warning("missing parent").once());
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].severity, Severity::Warning);
    }

    #[test]
    fn test_pending_ids_drive_progress() {
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let mut state = StageState::new();
        assert!(!state.is_initiated());

        state.init_pending(ids.clone());
        assert!(state.is_initiated());
        assert_eq!(state.total, 4);
        assert!(!state.is_complete());

        assert!(state.resolve_pending(ids[0]));
        assert!(!state.resolve_pending(ids[0]));
        assert!((state.progress - 0.25).abs() < f64::EPSILON);

        for id in &ids[1..] {
            state.resolve_pending(*id);
        }
        assert!(state.is_complete());
        assert!(state.pending().is_empty());
    }

    #[test]
    fn test_empty_pending_set_is_complete() {
        let mut state = StageState::new();
        state.init_pending(Vec::new());
        assert!(state.is_initiated());
        assert!(state.is_complete());
    }

    #[test]
    fn test_state_serde_defaults() {
        let state: StageState = serde_json::from_str(r#"{"progress":0.5}"#).unwrap();
        assert_eq!(state.counters, Counters::default());
        assert!(state.pointer.is_none());
    }

    proptest! {
        #[test]
        fn prop_complete_iff_done_reaches_total(total in 0u64..100_000, done in 0u64..100_000) {
            let fraction = progress(total, done);
            if total == 0 || done >= total {
                prop_assert_eq!(fraction, COMPLETE);
            } else {
                prop_assert!(fraction < COMPLETE);
                prop_assert!(fraction >= 0.0);
            }
        }
    }
}
