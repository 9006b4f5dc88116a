//! Rendering of every user-visible comment, review, and PR text.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::payload::VerdictRecord;
use crate::core::state_codec;
use crate::core::types::{CommandOutcome, IterationState, TestRun};

/// Characters of command output quoted in comments.
pub const OUTPUT_QUOTE_CHARS: usize = 2000;

static ATTEMPT_LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^attempt \d+/\d+$").expect("valid label regex"));

pub fn attempt_label(iteration: u32, max_iterations: u32) -> String {
    format!("attempt {iteration}/{max_iterations}")
}

/// Matches labels owned by the attempt counter.
pub fn attempt_label_pattern() -> &'static Regex {
    &ATTEMPT_LABEL_RE
}

/// Body of the single state comment: a visible status line plus the hidden blob.
pub fn state_comment(state: &IterationState) -> String {
    format!(
        "fixloop status: attempt {}/{}, last verdict `{}`.\n\n{}",
        state.iteration,
        state.max_iterations,
        state.last_verdict,
        state_codec::encode(state)
    )
}

pub fn pr_title(issue_number: u64, issue_title: &str) -> String {
    format!("[fixloop] Issue #{issue_number}: {}", issue_title.trim())
}

pub fn pr_body(issue_url: &str, summary: &str, issue_body: &str) -> String {
    [
        "## fixloop PR".to_string(),
        format!("- Source issue: {issue_url}"),
        format!("- Summary: {}", or_na(summary)),
        String::new(),
        "### Issue context".to_string(),
        issue_body.trim().to_string(),
    ]
    .join("\n")
}

pub fn commit_message(iteration: u32, summary: &str) -> String {
    let summary = summary.lines().next().unwrap_or("").trim();
    let summary = if summary.is_empty() {
        "apply changes"
    } else {
        summary
    };
    format!("fixloop(iter={iteration}): {summary}")
}

/// Posted on the PR after a successful fix attempt.
pub fn run_report_pending(state: &IterationState) -> String {
    format!(
        "## fixloop run report\nAttempt {}/{}: changes pushed. Checks run during review.",
        state.iteration, state.max_iterations
    )
}

pub fn exhausted_message(state: &IterationState) -> String {
    format!(
        "Iteration limit reached ({}/{}). No further attempts will be made.",
        state.iteration, state.max_iterations
    )
}

/// Comment for a soft failure; `detail` is appended when non-empty.
pub fn failure_comment(message: &str, detail: &str) -> String {
    let detail = detail.trim();
    if detail.is_empty() {
        message.to_string()
    } else {
        format!("{message}\n\n```\n{}\n```", clip(detail, OUTPUT_QUOTE_CHARS))
    }
}

/// Comment for an invocation that stopped on an error.
pub fn hard_failure_comment(stage: &str, error: &str) -> String {
    failure_comment(&format!("fixloop stopped during {stage}."), error)
}

pub fn escalation_failure_message(event_type: &str, err: &str) -> String {
    format!("Failed to dispatch `{event_type}` event: {}", err.trim())
}

/// One command as a bullet plus a fenced excerpt of its output.
pub fn format_command(outcome: &CommandOutcome) -> String {
    let status = match outcome.exit_code {
        _ if outcome.timed_out => format!("TIMEOUT after {:.1}s", outcome.duration.as_secs_f64()),
        Some(0) => format!("OK in {:.1}s", outcome.duration.as_secs_f64()),
        Some(code) => format!("FAIL ({code})"),
        None => "FAIL (killed)".to_string(),
    };
    let output = if outcome.stdout.trim().is_empty() {
        outcome.stderr.trim()
    } else {
        outcome.stdout.trim()
    };
    format!(
        "- `{}` -> {status}\n```\n{}\n```",
        outcome.command,
        clip(output, OUTPUT_QUOTE_CHARS)
    )
}

/// Review body posted on the PR.
pub fn review_body(record: &VerdictRecord, checks: &[CommandOutcome], tests: &TestRun) -> String {
    let mut lines = vec![
        "## fixloop review".to_string(),
        format!("**Verdict:** {}", record.verdict.as_str()),
        String::new(),
    ];
    if !record.summary.is_empty() {
        lines.push(format!("**Summary:** {}", record.summary));
        lines.push(String::new());
    }
    push_section(&mut lines, "### Blocking issues", &record.blocking);
    push_section(&mut lines, "### Notes", &record.notes);
    lines.push("### Checks".to_string());
    push_checks(&mut lines, checks, tests);
    lines.join("\n")
}

/// Attempt summary posted on the originating issue.
pub fn attempt_comment(
    pr_url: &str,
    state: &IterationState,
    record: &VerdictRecord,
    checks: &[CommandOutcome],
    tests: &TestRun,
) -> String {
    let mut lines = vec![
        format!("Attempt {}/{}", state.iteration, state.max_iterations),
        format!("PR: {pr_url}"),
        format!("Verdict: {}", record.verdict.as_str()),
    ];
    if !record.summary.is_empty() {
        lines.push(format!("Summary: {}", record.summary));
    }
    push_section(&mut lines, "Blocking:", &record.blocking);
    push_section(&mut lines, "Notes:", &record.notes);
    lines.push("Checks:".to_string());
    push_checks(&mut lines, checks, tests);
    lines.join("\n")
}

fn push_section(lines: &mut Vec<String>, heading: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    lines.push(heading.to_string());
    lines.extend(items.iter().map(|item| format!("- {item}")));
    lines.push(String::new());
}

fn push_checks(lines: &mut Vec<String>, checks: &[CommandOutcome], tests: &TestRun) {
    if checks.is_empty() {
        lines.push("- Quality checks: none configured".to_string());
    } else {
        lines.extend(checks.iter().map(format_command));
    }
    match &tests.outcome {
        Some(outcome) => lines.push(format_command(outcome)),
        None => lines.push(format!("- Tests: {}", or_default(&tests.note, "not run"))),
    }
    if !tests.generated_files.is_empty() {
        lines.push(format!(
            "- Generated tests: {}",
            tests.generated_files.join(", ")
        ));
    }
}

/// Keep the first `limit` characters of `text`.
pub fn clip(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn or_na(value: &str) -> &str {
    or_default(value, "n/a")
}

fn or_default<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.trim().is_empty() {
        default
    } else {
        value
    }
}
