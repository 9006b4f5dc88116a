//! Review invocations driven end to end against in-memory collaborators.
//!
//! The fixture is a fix PR (`acme/widgets#100`) opened for issue
//! `acme/agent#7`, carrying state at attempt 1/5 unless a test says otherwise.

use fixloop::code_fix::Collaborators;
use fixloop::core::payload::ReviewVerdict;
use fixloop::core::report;
use fixloop::core::types::{IterationState, Verdict};
use fixloop::escalation::EscalationOutcome;
use fixloop::exit_codes;
use fixloop::io::hosting::{PullFile, ReviewDecision};
use fixloop::io::prompt::TESTS_SYSTEM_PROMPT;
use fixloop::io::state_store::{StateHome, load_state};
use fixloop::review::{ReviewRequest, run_review};
use fixloop::test_support::{FakeHosting, FakeRunner, ScriptedLlm, test_settings};

const AGENT: &str = "acme/agent";
const TARGET: &str = "acme/widgets";
const PR: u64 = 100;

const APPROVE: &str = r#"{"verdict":"approve","summary":"Looks good","blocking":[],"notes":[]}"#;
const CHANGES: &str =
    r#"{"verdict":"changes_requested","summary":"Edge case missed","blocking":["None input"],"notes":[]}"#;

fn state_at(iteration: u32) -> IterationState {
    IterationState {
        iteration,
        last_verdict: Verdict::PendingReview,
        ..IterationState::new(TARGET, "https://github.com/acme/agent/issues/7", 5, "t0")
    }
}

/// Issue, PR with diff, and (optionally) a state comment at `iteration`.
fn fixture(iteration: Option<u32>) -> FakeHosting {
    let hosting = FakeHosting::new();
    hosting.set_actor("review-bot");
    hosting.add_issue(AGENT, 7, "Parser crashes on empty input", "parse('') raises");
    hosting.add_pull(TARGET, PR, "fixloop/issue-7", "fixloop-bot");
    hosting.set_pull_diff(
        TARGET,
        PR,
        "diff --git a/widgets/parse.py b/widgets/parse.py\n+    return s[0] if s else None\n",
        vec![PullFile {
            path: "widgets/parse.py".to_string(),
            status: "modified".to_string(),
            additions: 1,
            deletions: 1,
        }],
    );
    if let Some(iteration) = iteration {
        hosting.add_comment(TARGET, PR, &report::state_comment(&state_at(iteration)));
    }
    hosting
}

fn runner_with_tests() -> FakeRunner {
    FakeRunner::with_repo(&[
        ("tests/test_parse.py", "def test_parse(): pass\n"),
        ("widgets/parse.py", "def parse(s):\n    return s[0] if s else None\n"),
    ])
}

fn request() -> ReviewRequest {
    ReviewRequest {
        repo: TARGET.to_string(),
        pr_number: PR,
    }
}

/// Failing tests override a model approval and send the PR back for a fix.
#[test]
fn failing_tests_force_changes_requested() {
    let hosting = fixture(Some(1));
    let runner = runner_with_tests().script("python -m pytest -q", 1, "1 failed, 2 passed");
    let llm = ScriptedLlm::new([APPROVE]);
    let collab = Collaborators {
        hosting: &hosting,
        llm: &llm,
        runner: &runner,
    };

    let outcome = run_review(&collab, &test_settings(), &request()).expect("review");

    assert_eq!(outcome.verdict, ReviewVerdict::ChangesRequested);
    assert_eq!(outcome.decision, ReviewDecision::RequestChanges);
    assert_eq!(outcome.retry, Some(EscalationOutcome::Sent));
    assert_eq!(outcome.exit_code(), exit_codes::OK);

    let reviews = hosting.reviews();
    assert_eq!(reviews.len(), 1);
    assert!(reviews[0].body.contains("**Verdict:** changes_requested"));
    assert!(reviews[0].body.contains("`python -m pytest -q` -> FAIL (1)"));

    let persisted = load_state(&hosting, &StateHome::new(TARGET, PR), 5)
        .expect("load")
        .expect("state");
    assert_eq!(persisted.last_verdict, Verdict::ChangesRequested);
    assert_eq!(persisted.iteration, 1);

    let dispatches = hosting.dispatches();
    assert_eq!(dispatches.len(), 1);
    assert_eq!(dispatches[0].event_type, "issue_opened");
    assert_eq!(dispatches[0].payload["repo"], AGENT);
    assert_eq!(dispatches[0].payload["issue_number"], 7);

    let issue_comments = hosting.comments_on(AGENT, 7);
    assert_eq!(issue_comments.len(), 1);
    assert!(issue_comments[0].starts_with("Attempt 1/5\nPR: https://github.com/acme/widgets/pull/100"));

    let test_cmd = runner
        .commands()
        .into_iter()
        .find(|c| c.command == "python -m pytest -q")
        .expect("test command ran");
    assert!(test_cmd.env.iter().any(|(k, _)| k == "PYTHONPATH"));
}

/// A clean run keeps an approval; blocking items become manual checks.
#[test]
fn clean_run_keeps_approval_and_demotes_blocking() {
    let hosting = fixture(Some(2));
    let runner = runner_with_tests();
    let llm = ScriptedLlm::new([
        r#"{"verdict":"approve","summary":"ok","blocking":["check unicode input"],"notes":["nice"]}"#,
    ]);
    let collab = Collaborators {
        hosting: &hosting,
        llm: &llm,
        runner: &runner,
    };

    let outcome = run_review(&collab, &test_settings(), &request()).expect("review");

    assert_eq!(outcome.verdict, ReviewVerdict::Approve);
    assert_eq!(outcome.decision, ReviewDecision::Approve);
    assert_eq!(outcome.retry, None);
    let body = &hosting.reviews()[0].body;
    assert!(body.contains("### Notes\n- nice\n- Verify manually: check unicode input"));
    assert!(!body.contains("### Blocking issues"));
    assert!(hosting.dispatches().is_empty());
    assert_eq!(
        outcome.state.map(|s| s.last_verdict),
        Some(Verdict::Approve)
    );
}

/// Reviewing our own PR degrades the decision to a plain comment review.
#[test]
fn own_pull_request_gets_comment_review() {
    let hosting = fixture(Some(1));
    hosting.set_actor("fixloop-bot");
    let runner = runner_with_tests();
    let llm = ScriptedLlm::new([APPROVE]);
    let collab = Collaborators {
        hosting: &hosting,
        llm: &llm,
        runner: &runner,
    };

    let outcome = run_review(&collab, &test_settings(), &request()).expect("review");

    assert_eq!(outcome.verdict, ReviewVerdict::Approve);
    assert_eq!(outcome.decision, ReviewDecision::Comment);
    assert_eq!(hosting.reviews()[0].decision, ReviewDecision::Comment);
}

/// A 422 refusal of a change request is retried as a comment review.
#[test]
fn refused_change_request_falls_back_to_comment() {
    let hosting = fixture(Some(1));
    hosting.refuse_request_changes();
    let runner = runner_with_tests();
    let llm = ScriptedLlm::new([CHANGES]);
    let collab = Collaborators {
        hosting: &hosting,
        llm: &llm,
        runner: &runner,
    };

    let outcome = run_review(&collab, &test_settings(), &request()).expect("review");

    assert_eq!(outcome.verdict, ReviewVerdict::ChangesRequested);
    assert_eq!(outcome.decision, ReviewDecision::Comment);
    let reviews = hosting.reviews();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].decision, ReviewDecision::Comment);
    assert_eq!(hosting.dispatches().len(), 1);
}

/// Changes requested on the last attempt end the cycle instead of retrying.
#[test]
fn changes_requested_at_cap_reports_exhaustion() {
    let hosting = fixture(Some(5));
    let runner = runner_with_tests();
    let llm = ScriptedLlm::new([CHANGES]);
    let collab = Collaborators {
        hosting: &hosting,
        llm: &llm,
        runner: &runner,
    };

    let outcome = run_review(&collab, &test_settings(), &request()).expect("review");

    assert!(outcome.exhausted);
    assert_eq!(outcome.exit_code(), exit_codes::EXHAUSTED);
    assert!(hosting.dispatches().is_empty());
    assert!(
        hosting
            .comments_on(AGENT, 7)
            .iter()
            .any(|c| c.starts_with("Iteration limit reached (5/5)"))
    );
}

/// Without a test suite the model writes tests first, and they are run.
#[test]
fn missing_suite_is_synthesized_then_run() {
    let hosting = fixture(Some(1));
    let runner = FakeRunner::with_repo(&[("widgets/parse.py", "def parse(s): ...\n")]);
    let llm = ScriptedLlm::new([
        r#"{"files":[{"path":"tests/test_generated_parse.py","content":"def test_empty():\n    assert True\n"}]}"#,
        APPROVE,
    ]);
    let collab = Collaborators {
        hosting: &hosting,
        llm: &llm,
        runner: &runner,
    };

    let outcome = run_review(&collab, &test_settings(), &request()).expect("review");

    let requests = llm.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].system, TESTS_SYSTEM_PROMPT);
    assert!(requests[1].user.contains("GENERATED_TESTS:\n- tests/test_generated_parse.py"));
    assert_eq!(outcome.verdict, ReviewVerdict::Approve);
    assert!(
        hosting.reviews()[0]
            .body
            .contains("- Generated tests: tests/test_generated_parse.py")
    );
    assert!(runner.command_lines().contains(&"python -m pytest -q".to_string()));
}

/// Missing pytest is installed once and the same command is retried.
#[test]
fn missing_test_runner_is_installed_once() {
    let hosting = fixture(Some(1));
    let runner = runner_with_tests().script_times(
        "python -m pytest -q",
        1,
        "/usr/bin/python: No module named pytest",
        1,
    );
    let llm = ScriptedLlm::new([APPROVE]);
    let collab = Collaborators {
        hosting: &hosting,
        llm: &llm,
        runner: &runner,
    };

    let outcome = run_review(&collab, &test_settings(), &request()).expect("review");

    let lines = runner.command_lines();
    let installs = lines
        .iter()
        .filter(|l| *l == "python -m pip install pytest")
        .count();
    assert_eq!(installs, 1);
    assert_eq!(
        lines.iter().filter(|l| *l == "python -m pytest -q").count(),
        2
    );
    assert_eq!(outcome.verdict, ReviewVerdict::Approve);
}

/// A failed dependency install counts as a failing check.
#[test]
fn failed_install_blocks_approval() {
    let hosting = fixture(Some(1));
    let runner = FakeRunner::with_repo(&[
        ("requirements.txt", "nonexistent-package==9.9\n"),
        ("tests/test_parse.py", "def test_parse(): pass\n"),
    ])
    .script("python -m pip install -r requirements.txt", 1, "ERROR: No matching distribution");
    let llm = ScriptedLlm::new([APPROVE]);
    let collab = Collaborators {
        hosting: &hosting,
        llm: &llm,
        runner: &runner,
    };

    let outcome = run_review(&collab, &test_settings(), &request()).expect("review");

    assert_eq!(outcome.verdict, ReviewVerdict::ChangesRequested);
    assert!(
        hosting.reviews()[0]
            .body
            .contains("`python -m pip install -r requirements.txt` -> FAIL (1)")
    );
}

/// Configured quality commands run and a failure overrides approval.
#[test]
fn failing_quality_command_overrides_approval() {
    let hosting = fixture(Some(1));
    let runner = runner_with_tests().script("ruff check .", 1, "E501 line too long");
    let llm = ScriptedLlm::new([APPROVE]);
    let collab = Collaborators {
        hosting: &hosting,
        llm: &llm,
        runner: &runner,
    };
    let mut settings = test_settings();
    settings.commands.quality = vec![vec!["ruff".to_string(), "check".to_string(), ".".to_string()]];

    let outcome = run_review(&collab, &settings, &request()).expect("review");

    assert_eq!(outcome.verdict, ReviewVerdict::ChangesRequested);
    assert!(llm.requests()[0].user.contains("QUALITY:\n- `ruff check .` -> FAIL (1)"));
}

/// Unparsable reviewer output becomes a change request naming the defect.
#[test]
fn unparsable_verdict_requests_changes() {
    let hosting = fixture(Some(1));
    let runner = runner_with_tests();
    let llm = ScriptedLlm::new(["I think this is fine overall."]);
    let collab = Collaborators {
        hosting: &hosting,
        llm: &llm,
        runner: &runner,
    };

    let outcome = run_review(&collab, &test_settings(), &request()).expect("review");

    assert_eq!(outcome.verdict, ReviewVerdict::ChangesRequested);
    assert!(
        hosting.reviews()[0]
            .body
            .contains("**Summary:** Reviewer output could not be parsed.")
    );
}

/// A PR without state is reviewed but the cycle is not touched.
#[test]
fn pull_without_state_is_review_only() {
    let hosting = fixture(None);
    let runner = runner_with_tests();
    let llm = ScriptedLlm::new([CHANGES]);
    let collab = Collaborators {
        hosting: &hosting,
        llm: &llm,
        runner: &runner,
    };

    let outcome = run_review(&collab, &test_settings(), &request()).expect("review");

    assert_eq!(outcome.state, None);
    assert_eq!(outcome.retry, None);
    assert_eq!(hosting.reviews().len(), 1);
    assert!(hosting.dispatches().is_empty());
    assert!(hosting.comments_on(AGENT, 7).is_empty());
    assert_eq!(
        load_state(&hosting, &StateHome::new(TARGET, PR), 5).expect("load"),
        None
    );
}

/// A model error during review is commented on the PR and still returned.
#[test]
fn model_error_is_commented_on_pull() {
    let hosting = fixture(Some(1));
    let runner = runner_with_tests();
    let llm = ScriptedLlm::new(Vec::<String>::new());
    let collab = Collaborators {
        hosting: &hosting,
        llm: &llm,
        runner: &runner,
    };

    let err = run_review(&collab, &test_settings(), &request()).expect_err("hard failure");

    assert!(format!("{err:#}").contains("request review from model"));
    assert!(hosting.reviews().is_empty());
    assert!(
        hosting
            .comments_on(TARGET, PR)
            .iter()
            .any(|c| c.starts_with("fixloop stopped during the review."))
    );
}
