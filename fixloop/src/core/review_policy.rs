//! Override policy reconciling the model's verdict with objective checks.

use crate::core::payload::{ReviewVerdict, VerdictRecord};

/// Prefix for blocking items demoted to advisory notes.
pub const MANUAL_CHECK_PREFIX: &str = "Verify manually: ";

/// Result of the test run in a review checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    Passed,
    Failed,
    /// No test command could be run (no suite and none synthesized).
    NotRun,
}

impl TestStatus {
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => TestStatus::Passed,
            _ => TestStatus::Failed,
        }
    }
}

/// Objective outcome of one review run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckSummary {
    pub tests: TestStatus,
    /// All quality commands (and dependency install, if attempted) succeeded.
    pub checks_ok: bool,
}

impl CheckSummary {
    /// Tests ran and passed, and every check passed.
    pub fn is_clean(&self) -> bool {
        self.tests == TestStatus::Passed && self.checks_ok
    }

    pub fn has_failures(&self) -> bool {
        self.tests == TestStatus::Failed || !self.checks_ok
    }
}

/// Apply the override policy.
///
/// - Any failing test run or check forces `changes_requested`.
/// - A clean run where the model approved but listed blocking items stays
///   `approve`; the items move into notes as manual checks.
/// - Otherwise the model's verdict stands.
pub fn apply_override(record: VerdictRecord, checks: &CheckSummary) -> VerdictRecord {
    if checks.has_failures() {
        return VerdictRecord {
            verdict: ReviewVerdict::ChangesRequested,
            ..record
        };
    }
    if checks.is_clean() && record.verdict == ReviewVerdict::Approve && !record.blocking.is_empty()
    {
        let mut notes = record.notes;
        notes.extend(
            record
                .blocking
                .into_iter()
                .map(|item| format!("{MANUAL_CHECK_PREFIX}{item}")),
        );
        return VerdictRecord {
            verdict: ReviewVerdict::Approve,
            summary: record.summary,
            blocking: Vec::new(),
            notes,
        };
    }
    record
}
