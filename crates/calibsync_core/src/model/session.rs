//! Sync session bookkeeping model.
//!
//! # Responsibility
//! - Carry one session's state explicitly through the orchestrator.
//! - Render a human-readable summary for any terminal outcome.
//!
//! # Invariants
//! - Stage order is `Pending -> Fetching -> Diffing -> Applying -> terminal`;
//!   any stage may jump to `Failed`.
//! - A session with a terminal status is sealed and never mutated again.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Write as _};
use uuid::Uuid;

/// Stable identifier of one sync session.
pub type SessionId = Uuid;

/// Session state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Fetching,
    Diffing,
    Applying,
    Succeeded,
    /// Some operations committed, some failed or were cancelled.
    Partial,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Diffing => "diffing",
            Self::Applying => "applying",
            Self::Succeeded => "succeeded",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "fetching" => Some(Self::Fetching),
            "diffing" => Some(Self::Diffing),
            "applying" => Some(Self::Applying),
            "succeeded" => Some(Self::Succeeded),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Partial | Self::Failed)
    }
}

impl Display for SessionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-session operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounts {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub unchanged: u64,
    /// Records rejected before diffing (normalization errors, duplicates).
    pub skipped: u64,
    /// Operations that failed to apply.
    pub failed: u64,
    /// Soft-delete candidates not materialized because the fetch was incomplete.
    pub deferred_deletes: u64,
}

impl SessionCounts {
    /// Number of committed data changes.
    pub fn committed(&self) -> u64 {
        self.created + self.updated + self.deleted
    }
}

/// Classification of an error recorded in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionErrorKind {
    SourceUnavailable,
    SourceMalformed,
    Normalization,
    DuplicateRecord,
    ApplyConflict,
    StoreUnavailable,
    Cancelled,
    /// The process running the session stopped before sealing it.
    Abandoned,
}

impl SessionErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SourceUnavailable => "source_unavailable",
            Self::SourceMalformed => "source_malformed",
            Self::Normalization => "normalization",
            Self::DuplicateRecord => "duplicate_record",
            Self::ApplyConflict => "apply_conflict",
            Self::StoreUnavailable => "store_unavailable",
            Self::Cancelled => "cancelled",
            Self::Abandoned => "abandoned",
        }
    }

    /// Whether this kind is a failure of the whole session. Record-level
    /// kinds and cancellation are not.
    pub fn is_session_scoped(self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable
                | Self::SourceMalformed
                | Self::StoreUnavailable
                | Self::Abandoned
        )
    }
}

/// One error recorded in a session's summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionError {
    pub kind: SessionErrorKind,
    /// Affected instrument, for record-scoped errors.
    pub external_id: Option<String>,
    pub message: String,
}

/// One run of the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSession {
    pub id: SessionId,
    pub status: SessionStatus,
    /// Epoch milliseconds.
    pub started_at: i64,
    pub finished_at: Option<i64>,
    /// Advisory lower bound passed to the connector.
    pub since: Option<i64>,
    /// True when every page of a full (non-incremental) fetch was retrieved.
    pub fetch_complete: bool,
    pub source_record_count: u64,
    pub counts: SessionCounts,
    pub errors: Vec<SessionError>,
    pub cancel_reason: Option<String>,
}

impl SyncSession {
    /// Creates a pending session.
    pub fn new(started_at: i64, since: Option<i64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: SessionStatus::Pending,
            started_at,
            finished_at: None,
            since,
            fetch_complete: false,
            source_record_count: 0,
            counts: SessionCounts::default(),
            errors: Vec::new(),
            cancel_reason: None,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn record_error(
        &mut self,
        kind: SessionErrorKind,
        external_id: Option<&str>,
        message: impl Into<String>,
    ) {
        self.errors.push(SessionError {
            kind,
            external_id: external_id.map(str::to_string),
            message: message.into(),
        });
    }

    /// External ids listed by errors of `kind`.
    pub fn failed_external_ids(&self, kind: SessionErrorKind) -> Vec<&str> {
        self.errors
            .iter()
            .filter(|error| error.kind == kind)
            .filter_map(|error| error.external_id.as_deref())
            .collect()
    }

    /// Human-readable summary: status, counters and the first `max_errors`
    /// error messages.
    pub fn summary(&self, max_errors: usize) -> String {
        let counts = &self.counts;
        let mut text = format!(
            "session {} {}: source={} created={} updated={} deleted={} unchanged={} skipped={} failed={} deferred_deletes={}",
            self.id,
            self.status,
            self.source_record_count,
            counts.created,
            counts.updated,
            counts.deleted,
            counts.unchanged,
            counts.skipped,
            counts.failed,
            counts.deferred_deletes,
        );
        if let Some(reason) = &self.cancel_reason {
            let _ = write!(text, "\ncancelled: {reason}");
        }
        if !self.errors.is_empty() {
            let shown = self.errors.len().min(max_errors);
            let _ = write!(
                text,
                "\nerrors (showing {shown} of {}):",
                self.errors.len()
            );
            for error in self.errors.iter().take(max_errors) {
                match &error.external_id {
                    Some(id) => {
                        let _ = write!(text, "\n- [{}] {id}: {}", error.kind.as_str(), error.message);
                    }
                    None => {
                        let _ = write!(text, "\n- [{}] {}", error.kind.as_str(), error.message);
                    }
                }
            }
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::{SessionErrorKind, SessionStatus, SyncSession};

    #[test]
    fn summary_caps_error_messages() {
        let mut session = SyncSession::new(1_000, None);
        session.status = SessionStatus::Partial;
        for index in 0..4 {
            session.record_error(
                SessionErrorKind::ApplyConflict,
                Some(&format!("INS-{index:03}")),
                "constraint failed",
            );
        }

        let summary = session.summary(2);
        assert!(summary.contains("partial"));
        assert!(summary.contains("errors (showing 2 of 4)"));
        assert!(summary.contains("INS-000"));
        assert!(summary.contains("INS-001"));
        assert!(!summary.contains("INS-002"));
    }

    #[test]
    fn only_session_failures_are_session_scoped() {
        for kind in [
            SessionErrorKind::SourceUnavailable,
            SessionErrorKind::SourceMalformed,
            SessionErrorKind::StoreUnavailable,
            SessionErrorKind::Abandoned,
        ] {
            assert!(kind.is_session_scoped(), "{}", kind.as_str());
        }
        for kind in [
            SessionErrorKind::Normalization,
            SessionErrorKind::DuplicateRecord,
            SessionErrorKind::ApplyConflict,
            SessionErrorKind::Cancelled,
        ] {
            assert!(!kind.is_session_scoped(), "{}", kind.as_str());
        }
    }

    #[test]
    fn terminal_statuses_are_sealed() {
        for status in [
            SessionStatus::Succeeded,
            SessionStatus::Partial,
            SessionStatus::Failed,
        ] {
            assert!(status.is_terminal());
        }
        for status in [
            SessionStatus::Pending,
            SessionStatus::Fetching,
            SessionStatus::Diffing,
            SessionStatus::Applying,
        ] {
            assert!(!status.is_terminal());
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn failed_external_ids_filters_by_kind() {
        let mut session = SyncSession::new(0, None);
        session.record_error(SessionErrorKind::Normalization, Some("A"), "bad date");
        session.record_error(SessionErrorKind::ApplyConflict, Some("B"), "conflict");
        session.record_error(SessionErrorKind::Cancelled, None, "stop");

        assert_eq!(
            session.failed_external_ids(SessionErrorKind::ApplyConflict),
            vec!["B"]
        );
    }
}
