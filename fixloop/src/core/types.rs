//! Shared deterministic types for the fix/review cycle.
//!
//! These types define stable contracts between core components. They must not
//! depend on external state or I/O.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where a cycle stands after the most recent invocation touched it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pending,
    InProgress,
    PendingReview,
    Approve,
    ChangesRequested,
    Unknown,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Pending => "pending",
            Verdict::InProgress => "in_progress",
            Verdict::PendingReview => "pending_review",
            Verdict::Approve => "approve",
            Verdict::ChangesRequested => "changes_requested",
            Verdict::Unknown => "unknown",
        }
    }

    /// Lenient parse: anything unrecognised maps to `Unknown`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim() {
            "pending" => Verdict::Pending,
            "in_progress" => Verdict::InProgress,
            "pending_review" => Verdict::PendingReview,
            "approve" => Verdict::Approve,
            "changes_requested" => Verdict::ChangesRequested,
            _ => Verdict::Unknown,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single persisted record of a code/review cycle.
///
/// `max_iterations` and `created_at` are fixed at creation; `iteration` only
/// ever grows. Every mutation returns a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationState {
    /// `owner/name` of the repository being patched.
    pub target_repo: String,
    /// Locates the originating issue (its HTML URL).
    #[serde(rename = "source_issue_url")]
    pub source_reference: String,
    /// Completed attempts so far.
    pub iteration: u32,
    pub max_iterations: u32,
    pub last_verdict: Verdict,
    /// RFC 3339 timestamp, set once.
    pub created_at: String,
}

impl IterationState {
    /// Fresh state for a cycle with no prior persisted record.
    pub fn new(
        target_repo: impl Into<String>,
        source_reference: impl Into<String>,
        max_iterations: u32,
        created_at: impl Into<String>,
    ) -> Self {
        Self {
            target_repo: target_repo.into(),
            source_reference: source_reference.into(),
            iteration: 0,
            max_iterations,
            last_verdict: Verdict::Pending,
            created_at: created_at.into(),
        }
    }

    /// Consume one attempt and record `verdict`.
    pub fn advance(&self, verdict: Verdict) -> Self {
        Self {
            iteration: self.iteration.saturating_add(1),
            last_verdict: verdict,
            ..self.clone()
        }
    }

    /// Record `verdict` without consuming an attempt.
    pub fn with_verdict(&self, verdict: Verdict) -> Self {
        Self {
            last_verdict: verdict,
            ..self.clone()
        }
    }

    /// Continuation precondition: another attempt is allowed.
    pub fn can_iterate(&self) -> bool {
        self.iteration < self.max_iterations
    }
}

/// Result record of one external command, as read by the orchestration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Display form of the argument vector, secrets redacted.
    pub command: String,
    /// `None` when the process was killed or terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }

    /// Stdout and stderr joined, for substring checks.
    pub fn combined_output(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Test execution in a review checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestRun {
    /// Last command of the ladder that ran, if any ran at all.
    pub outcome: Option<CommandOutcome>,
    /// Explanation when no outcome exists.
    pub note: String,
    /// Test files synthesized before the run.
    pub generated_files: Vec<String>,
}

/// Soft failures of a fix attempt. The attempt is consumed and a retry may
/// be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixFailure {
    /// The model reply held no recoverable document.
    InvalidOutput,
    /// The document named no writable files.
    NoFiles,
    /// Files were written but the worktree did not change.
    NoChanges,
    /// `git commit` failed.
    NoCommit,
}

impl FixFailure {
    /// Stable reason code, also sent in retry payloads.
    pub fn reason(self) -> &'static str {
        match self {
            FixFailure::InvalidOutput => "invalid-output",
            FixFailure::NoFiles => "no-files",
            FixFailure::NoChanges => "no-changes",
            FixFailure::NoCommit => "no-commit",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            FixFailure::InvalidOutput => "Model output could not be parsed. PR not updated.",
            FixFailure::NoFiles => "No files changed by the model. PR not updated.",
            FixFailure::NoChanges => "No changes after applying the patch. PR not updated.",
            FixFailure::NoCommit => "Commit failed or nothing to commit. PR not updated.",
        }
    }
}

impl fmt::Display for FixFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}
