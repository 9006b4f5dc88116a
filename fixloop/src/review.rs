//! Orchestration for one review invocation.
//!
//! Checks run in a scratch checkout of the PR head. Their outcome overrides
//! the model's verdict where they disagree, and the result feeds back into the
//! cycle state and, on `changes_requested`, into another fix attempt.

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::code_fix::Collaborators;
use crate::core::output_parser::{OutputDefect, parse_document};
use crate::core::payload::{FileEditSet, ReviewVerdict, VerdictRecord};
use crate::core::refs::{IssueRef, parse_issue_url};
use crate::core::report;
use crate::core::review_policy::{CheckSummary, TestStatus, apply_override};
use crate::core::types::{CommandOutcome, IterationState, TestRun};
use crate::escalation::{EscalationOutcome, escalate, report_hard_failure, retry_payload};
use crate::exit_codes;
use crate::io::config::Settings;
use crate::io::git::{Git, authenticated_clone_url};
use crate::io::hosting::{ApiError, HostingApi, PullFile, PullRequest, ReviewDecision};
use crate::io::llm::CompletionRequest;
use crate::io::process::CommandSpec;
use crate::io::prompt::{PromptEngine, REVIEW_SYSTEM_PROMPT, ReviewInputs, TESTS_SYSTEM_PROMPT};
use crate::io::repo_files::{
    apply_file_edits, detect_install_commands, has_test_suite, python_path, scratch_dir,
};
use crate::io::state_store::{StateHome, load_state, persist_state};

const CHECKOUT_DIR: &str = "repo";

/// Which pull request to review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRequest {
    pub repo: String,
    pub pr_number: u64,
}

/// Terminal result of a review invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewOutcome {
    /// Verdict after the override policy.
    pub verdict: ReviewVerdict,
    /// Decision actually posted, after any fallback to a plain comment.
    pub decision: ReviewDecision,
    /// Updated cycle state; `None` when the PR carries no state.
    pub state: Option<IterationState>,
    /// Set when a fix retry was requested.
    pub retry: Option<EscalationOutcome>,
    /// The cycle ended on `changes_requested` with no attempts left.
    pub exhausted: bool,
}

impl ReviewOutcome {
    pub fn exit_code(&self) -> i32 {
        if self.exhausted {
            exit_codes::EXHAUSTED
        } else {
            exit_codes::OK
        }
    }

    pub fn summary(&self) -> String {
        let mut line = format!("{} ({})", self.verdict.as_str(), self.decision.as_event());
        if let Some(state) = &self.state {
            line.push_str(&format!(
                ", {}",
                report::attempt_label(state.iteration, state.max_iterations)
            ));
        }
        if self.exhausted {
            line.push_str(", exhausted");
        }
        line
    }
}

/// Objective results gathered in the checkout.
struct CheckRun {
    checks: Vec<CommandOutcome>,
    checks_ok: bool,
    tests: TestRun,
}

impl CheckRun {
    fn summary(&self) -> CheckSummary {
        let tests = match &self.tests.outcome {
            Some(outcome) => TestStatus::from_exit_code(outcome.exit_code),
            None => TestStatus::NotRun,
        };
        CheckSummary {
            tests,
            checks_ok: self.checks_ok,
        }
    }
}

/// Inputs shared by the checkout steps.
struct ReviewScope<'a> {
    settings: &'a Settings,
    pull: &'a PullRequest,
    issue_text: &'a str,
    diff: &'a str,
    files: &'a [PullFile],
}

/// Run one review invocation for `request`.
#[instrument(skip_all, fields(repo = %request.repo, pr = request.pr_number))]
pub fn run_review(
    collab: &Collaborators<'_>,
    settings: &Settings,
    request: &ReviewRequest,
) -> Result<ReviewOutcome> {
    let hosting = collab.hosting;
    let pull = hosting
        .get_pull(&request.repo, request.pr_number)
        .context("fetch pull request")?;
    let diff = hosting
        .get_pull_diff(&request.repo, pull.number)
        .context("fetch pull request diff")?;
    let files = hosting
        .get_pull_files(&request.repo, pull.number)
        .context("fetch pull request files")?;

    let pr_home = StateHome::new(&request.repo, pull.number);
    let state = load_state(hosting, &pr_home, settings.cycle.max_iterations)?;
    let issue_ref = state.as_ref().and_then(|s| parse_issue_url(&s.source_reference));
    let issue_text = match &issue_ref {
        Some(issue_ref) => {
            let issue = hosting
                .get_issue(&issue_ref.repo, issue_ref.number)
                .context("fetch originating issue")?;
            format!("{}\n\n{}", issue.title, issue.body)
        }
        None => format!("{}\n\n{}", pull.title, pull.body),
    };
    debug!(has_state = state.is_some(), has_issue = issue_ref.is_some(), "review inputs loaded");

    let scope = ReviewScope {
        settings,
        pull: &pull,
        issue_text: &issue_text,
        diff: &diff,
        files: &files,
    };
    let (run, raw) = report_hard_failure(review_in_checkout(collab, &scope), "the review", |body| {
        hosting
            .post_comment(&request.repo, pull.number, body)
            .context("comment on pull request")
    })?;
    let record = match parse_document(&raw) {
        Ok(document) => VerdictRecord::from_document(&document),
        Err(defect) => unparsable_verdict(&defect),
    };
    let model_verdict = record.verdict;
    let record = apply_override(record, &run.summary());
    if record.verdict != model_verdict {
        info!(
            model = model_verdict.as_str(),
            final_verdict = record.verdict.as_str(),
            "verdict overridden by checks"
        );
    }

    let body = report::review_body(&record, &run.checks, &run.tests);
    let decision = post_review(hosting, &request.repo, &pull, &body, record.verdict)?;

    let Some(state) = state else {
        info!("no cycle state on pull request, review only");
        return Ok(ReviewOutcome {
            verdict: record.verdict,
            decision,
            state: None,
            retry: None,
            exhausted: false,
        });
    };
    let state = state.with_verdict(record.verdict.as_verdict());
    persist_state(hosting, &pr_home, &state)?;

    let mut outcome = ReviewOutcome {
        verdict: record.verdict,
        decision,
        state: Some(state.clone()),
        retry: None,
        exhausted: false,
    };
    let Some(issue_ref) = issue_ref else {
        warn!(source = %state.source_reference, "originating issue unknown, cycle not continued");
        return Ok(outcome);
    };
    let issue_home = StateHome::new(&issue_ref.repo, issue_ref.number);
    hosting
        .post_comment(
            &issue_home.repo,
            issue_home.number,
            &report::attempt_comment(&pull.html_url, &state, &record, &run.checks, &run.tests),
        )
        .context("post attempt summary")?;

    if record.verdict == ReviewVerdict::ChangesRequested {
        if state.can_iterate() {
            outcome.retry = Some(request_fix(hosting, settings, &issue_ref, &issue_home));
        } else {
            let message = report::exhausted_message(&state);
            hosting
                .post_comment(&issue_home.repo, issue_home.number, &message)
                .context("report exhaustion on issue")?;
            hosting
                .post_comment(&request.repo, pull.number, &message)
                .context("report exhaustion on pull request")?;
            outcome.exhausted = true;
        }
    }
    Ok(outcome)
}

fn request_fix(
    hosting: &dyn HostingApi,
    settings: &Settings,
    issue_ref: &IssueRef,
    issue_home: &StateHome,
) -> EscalationOutcome {
    let dispatch_repo = settings
        .github
        .agent_repo
        .as_deref()
        .unwrap_or(&issue_ref.repo);
    escalate(
        hosting,
        dispatch_repo,
        &settings.github.code_event_type,
        &retry_payload(&issue_ref.repo, issue_ref.number, "changes_requested"),
        issue_home,
    )
}

fn unparsable_verdict(defect: &OutputDefect) -> VerdictRecord {
    warn!(%defect, "review output unrecoverable");
    VerdictRecord {
        verdict: ReviewVerdict::ChangesRequested,
        summary: "Reviewer output could not be parsed.".to_string(),
        blocking: vec![defect.to_string()],
        notes: Vec::new(),
    }
}

/// Clone the PR head, run checks and tests, and ask the model for a verdict.
/// Returns the check results and the raw model reply.
fn review_in_checkout(
    collab: &Collaborators<'_>,
    scope: &ReviewScope<'_>,
) -> Result<(CheckRun, String)> {
    let settings = scope.settings;
    let token = &settings.secrets.github_token;
    let scratch = scratch_dir("fixloop-review-")?;
    let url = authenticated_clone_url(&settings.github.git_host, &scope.pull.head_repo, token)?;
    let git = Git::clone_into(
        collab.runner,
        &url,
        scratch.path(),
        CHECKOUT_DIR,
        settings.commands.git_timeout(),
        token,
    )?;
    git.checkout_reset(&scope.pull.head_ref, &format!("origin/{}", scope.pull.head_ref))?;
    let checkout = CheckoutRunner {
        collab,
        settings,
        root: git.workdir(),
    };

    let mut checks = Vec::new();
    let mut checks_ok = true;
    if let Some(failed) = checkout.install_dependencies()? {
        checks_ok = false;
        checks.push(failed);
    }
    for argv in &settings.commands.quality {
        let Some(spec) = CommandSpec::from_argv(argv) else {
            continue;
        };
        let outcome = checkout.run(&spec, settings.commands.test_timeout())?;
        checks_ok &= outcome.success();
        checks.push(outcome);
    }

    let engine = PromptEngine::new()?;
    let rules = settings.context.ranker_rules(&scope.pull.head_repo);
    let mut generated_files = Vec::new();
    if !has_test_suite(checkout.root, &rules)? {
        generated_files = checkout.synthesize_tests(&engine, scope)?;
    }
    let mut tests = if has_test_suite(checkout.root, &rules)? {
        checkout.run_tests()?
    } else {
        TestRun {
            note: "no test suite found".to_string(),
            ..TestRun::default()
        }
    };
    tests.generated_files = generated_files;

    let check_lines: Vec<String> = checks.iter().map(report::format_command).collect();
    let test_line = match &tests.outcome {
        Some(outcome) => report::format_command(outcome),
        None => format!("- Tests: {}", tests.note),
    };
    let user = engine.render_review_context(&ReviewInputs {
        issue: scope.issue_text,
        diff: scope.diff,
        files: scope.files,
        checks: &check_lines,
        tests: &test_line,
        generated: &tests.generated_files,
    })?;
    let raw = collab
        .llm
        .complete(&CompletionRequest {
            system: REVIEW_SYSTEM_PROMPT.to_string(),
            user,
            temperature: settings.llm.temperature,
            max_tokens: settings.llm.max_tokens_review,
        })
        .context("request review from model")?;
    Ok((
        CheckRun {
            checks,
            checks_ok,
            tests,
        },
        raw,
    ))
}

/// Runs commands in the review checkout with the test environment applied.
struct CheckoutRunner<'a> {
    collab: &'a Collaborators<'a>,
    settings: &'a Settings,
    root: &'a std::path::Path,
}

impl CheckoutRunner<'_> {
    fn run(&self, spec: &CommandSpec, timeout: std::time::Duration) -> Result<CommandOutcome> {
        let spec = spec
            .clone()
            .env("PYTHONPATH", python_path(self.root))
            .redact(self.settings.secrets.github_token.clone());
        self.collab
            .runner
            .run(&spec, self.root, timeout)
            .with_context(|| format!("run {}", spec.display()))
    }

    /// First installer that succeeds wins. Returns the last failure when none does.
    fn install_dependencies(&self) -> Result<Option<CommandOutcome>> {
        let mut last_failure = None;
        for spec in detect_install_commands(self.root) {
            let outcome = self.run(&spec, self.settings.commands.install_timeout())?;
            if outcome.success() {
                debug!(command = %outcome.command, "dependencies installed");
                return Ok(None);
            }
            warn!(command = %outcome.command, exit = ?outcome.exit_code, "install failed");
            last_failure = Some(outcome);
        }
        Ok(last_failure)
    }

    /// Ask the model for tests and write them. Returns the paths written.
    fn synthesize_tests(&self, engine: &PromptEngine, scope: &ReviewScope<'_>) -> Result<Vec<String>> {
        info!("no test suite, synthesizing tests");
        let user = engine.render_test_context(scope.issue_text, scope.diff, scope.files)?;
        let raw = self
            .collab
            .llm
            .complete(&CompletionRequest {
                system: TESTS_SYSTEM_PROMPT.to_string(),
                user,
                temperature: self.settings.llm.temperature,
                max_tokens: self.settings.llm.max_tokens_tests,
            })
            .context("request tests from model")?;
        match parse_document(&raw) {
            Ok(document) => apply_file_edits(self.root, &FileEditSet::from_document(&document)),
            Err(defect) => {
                warn!(%defect, "test synthesis output unrecoverable");
                Ok(Vec::new())
            }
        }
    }

    /// Walk the test command ladder until one actually runs the suite.
    fn run_tests(&self) -> Result<TestRun> {
        let timeout = self.settings.commands.test_timeout();
        let mut runner_installed = false;
        let mut last = None;
        for spec in self.test_ladder() {
            let mut outcome = self.run(&spec, timeout)?;
            if test_runner_missing(&outcome) && !runner_installed {
                runner_installed = true;
                info!("test runner missing, installing pytest");
                let install = CommandSpec::new("python").args(["-m", "pip", "install", "pytest"]);
                self.run(&install, self.settings.commands.install_timeout())?;
                outcome = self.run(&spec, timeout)?;
            }
            if !test_runner_missing(&outcome) {
                return Ok(TestRun {
                    outcome: Some(outcome),
                    ..TestRun::default()
                });
            }
            last = Some(outcome);
        }
        Ok(TestRun {
            outcome: last,
            ..TestRun::default()
        })
    }

    /// Configured command, then plain pytest forms, then an in-process runner
    /// with the checkout on `sys.path`. Duplicates are dropped.
    fn test_ladder(&self) -> Vec<CommandSpec> {
        let root = self.root.display().to_string();
        let bootstrap = format!(
            "import sys; sys.path.insert(0, {src:?}); sys.path.insert(0, {root:?}); \
             import pytest; raise SystemExit(pytest.main(['-q']))",
            src = format!("{root}/src"),
        );
        let candidates = [
            CommandSpec::from_argv(&self.settings.commands.test),
            Some(CommandSpec::new("python").args(["-m", "pytest", "-q"])),
            Some(CommandSpec::new("pytest").arg("-q")),
            Some(CommandSpec::new("python").args(["-c".to_string(), bootstrap])),
        ];
        let mut ladder: Vec<CommandSpec> = Vec::new();
        for spec in candidates.into_iter().flatten() {
            if !ladder.contains(&spec) {
                ladder.push(spec);
            }
        }
        ladder
    }
}

/// The command never reached the test suite because pytest is absent.
fn test_runner_missing(outcome: &CommandOutcome) -> bool {
    if outcome.exit_code == Some(crate::io::process::NOT_FOUND_EXIT_CODE) {
        return true;
    }
    let output = outcome.combined_output().to_lowercase();
    output.contains("no module named pytest") || output.contains("pytest: not found")
}

/// Post the review, degrading to a plain comment on our own PR or when the
/// API refuses the decision.
fn post_review(
    hosting: &dyn HostingApi,
    repo: &str,
    pull: &PullRequest,
    body: &str,
    verdict: ReviewVerdict,
) -> Result<ReviewDecision> {
    let own_pull = match hosting.current_actor() {
        Ok(actor) => actor.eq_ignore_ascii_case(&pull.author),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "could not resolve current actor");
            false
        }
    };
    let decision = match verdict {
        _ if own_pull => ReviewDecision::Comment,
        ReviewVerdict::Approve => ReviewDecision::Approve,
        ReviewVerdict::ChangesRequested => ReviewDecision::RequestChanges,
    };
    match hosting.post_review(repo, pull.number, body, decision) {
        Ok(()) => Ok(decision),
        Err(err)
            if decision != ReviewDecision::Comment
                && err
                    .downcast_ref::<ApiError>()
                    .is_some_and(ApiError::is_unprocessable) =>
        {
            warn!(event = decision.as_event(), "review decision refused, posting as comment");
            hosting
                .post_review(repo, pull.number, body, ReviewDecision::Comment)
                .context("post review comment")?;
            Ok(ReviewDecision::Comment)
        }
        Err(err) => Err(err.context("post review")),
    }
}
