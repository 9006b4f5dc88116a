//! Fire-and-forget signals that trigger the next invocation.
//!
//! A failed dispatch never fails the invocation that raised it; the work
//! already done stands and the failure is reported as a comment instead.
//! [`report_hard_failure`] does the same for errors that do end an invocation.

use anyhow::Result;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::core::report;
use crate::io::hosting::HostingApi;
use crate::io::state_store::StateHome;

/// Result of one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationOutcome {
    Sent,
    /// Dispatch failed; the message was reported on the notify target.
    Failed(String),
}

impl EscalationOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, EscalationOutcome::Sent)
    }
}

/// Payload asking the code-fix path to retry an issue.
pub fn retry_payload(issue_repo: &str, issue_number: u64, reason: &str) -> Value {
    json!({
        "repo": issue_repo,
        "issue_number": issue_number,
        "reason": reason,
    })
}

/// Payload asking the review path to look at a pull request.
pub fn review_payload(repo: &str, pr_number: u64) -> Value {
    json!({
        "repo": repo,
        "pr_number": pr_number,
    })
}

/// Send `event_type` to `repo`. On failure, comment on `notify` and return
/// [`EscalationOutcome::Failed`].
pub fn escalate(
    hosting: &dyn HostingApi,
    repo: &str,
    event_type: &str,
    payload: &Value,
    notify: &StateHome,
) -> EscalationOutcome {
    match hosting.dispatch_event(repo, event_type, payload) {
        Ok(()) => {
            info!(repo, event_type, "escalation dispatched");
            EscalationOutcome::Sent
        }
        Err(err) => {
            let message = format!("{err:#}");
            warn!(repo, event_type, error = %message, "escalation dispatch failed");
            let body = report::escalation_failure_message(event_type, &message);
            if let Err(comment_err) = hosting.post_comment(&notify.repo, notify.number, &body) {
                warn!(
                    repo = %notify.repo,
                    number = notify.number,
                    error = %format!("{comment_err:#}"),
                    "could not report escalation failure"
                );
            }
            EscalationOutcome::Failed(message)
        }
    }
}

/// Comment on `result`'s error through `post` before handing it back.
/// A failed comment is logged and the original error still wins.
pub fn report_hard_failure<T>(
    result: Result<T>,
    stage: &str,
    post: impl FnOnce(&str) -> Result<()>,
) -> Result<T> {
    result.inspect_err(|err| {
        let message = format!("{err:#}");
        if let Err(comment_err) = post(&report::hard_failure_comment(stage, &message)) {
            warn!(
                stage,
                error = %message,
                comment_error = %format!("{comment_err:#}"),
                "could not report hard failure"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeHosting;

    #[test]
    fn successful_dispatch_is_recorded() {
        let hosting = FakeHosting::new();
        let outcome = escalate(
            &hosting,
            "acme/agent",
            "issue_opened",
            &retry_payload("acme/agent", 7, "no-files"),
            &StateHome::new("acme/agent", 7),
        );
        assert_eq!(outcome, EscalationOutcome::Sent);
        let dispatches = hosting.dispatches();
        assert_eq!(dispatches.len(), 1);
        assert_eq!(dispatches[0].event_type, "issue_opened");
        assert_eq!(dispatches[0].payload["issue_number"], 7);
        assert_eq!(dispatches[0].payload["reason"], "no-files");
        assert!(hosting.comments_on("acme/agent", 7).is_empty());
    }

    /// Verifies a failed dispatch is reported as a comment and does not surface as an error.
    #[test]
    fn failed_dispatch_comments_on_notify_target() {
        let hosting = FakeHosting::new();
        hosting.fail_dispatch("workflow not found");
        let outcome = escalate(
            &hosting,
            "acme/agent",
            "issue_opened",
            &retry_payload("acme/agent", 7, "no-changes"),
            &StateHome::new("acme/agent", 7),
        );
        assert!(!outcome.is_sent());
        let comments = hosting.comments_on("acme/agent", 7);
        assert_eq!(comments.len(), 1);
        assert!(comments[0].starts_with("Failed to dispatch `issue_opened` event"));
        assert!(comments[0].contains("workflow not found"));
    }

    /// Verifies an error is commented and returned unchanged, even when the comment fails.
    #[test]
    fn hard_failure_is_commented_and_propagated() {
        let hosting = FakeHosting::new();
        let result: Result<()> = Err(anyhow::anyhow!("push rejected"));
        let err = report_hard_failure(result, "the fix attempt", |body| {
            hosting.post_comment("acme/agent", 7, body)
        })
        .expect_err("error kept");
        assert_eq!(err.to_string(), "push rejected");
        let comments = hosting.comments_on("acme/agent", 7);
        assert_eq!(comments.len(), 1);
        assert!(comments[0].starts_with("fixloop stopped during the fix attempt."));
        assert!(comments[0].contains("push rejected"));

        let result: Result<()> = Err(anyhow::anyhow!("model down"));
        let err = report_hard_failure(result, "the review", |_| Err(anyhow::anyhow!("api down")))
            .expect_err("error kept");
        assert_eq!(err.to_string(), "model down");

        let ok = report_hard_failure(Ok(3), "the review", |_| panic!("no comment on success"));
        assert_eq!(ok.expect("value"), 3);
    }
}
