//! Orchestration for one code-fix invocation.
//!
//! One invocation consumes at most one attempt: it recovers the cycle state,
//! asks the model for a patch in a scratch checkout, and either opens or
//! updates the pull request or reports a soft failure and schedules a retry.

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::output_parser::parse_document;
use crate::core::payload::FileEditSet;
use crate::core::refs::parse_target_repo;
use crate::core::report;
use crate::core::types::{FixFailure, IterationState, Verdict};
use crate::escalation::{
    EscalationOutcome, escalate, report_hard_failure, retry_payload, review_payload,
};
use crate::exit_codes;
use crate::io::config::Settings;
use crate::io::git::{Author, Git, authenticated_clone_url};
use crate::io::hosting::{HostingApi, Issue, PullRequest};
use crate::io::llm::{CompletionRequest, LanguageModel};
use crate::io::process::CommandRunner;
use crate::io::prompt::{CODE_SYSTEM_PROMPT, PromptEngine};
use crate::io::repo_files::{apply_file_edits, build_code_context, scratch_dir};
use crate::io::state_store::{StateHome, load_state, persist_state};

const CHECKOUT_DIR: &str = "repo";

/// External services one invocation talks to.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub hosting: &'a dyn HostingApi,
    pub llm: &'a dyn LanguageModel,
    pub runner: &'a dyn CommandRunner,
}

/// Which issue to work on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeFixRequest {
    /// Repository holding the issue (and receiving dispatch events).
    pub agent_repo: String,
    pub issue_number: u64,
}

/// Terminal result of a code-fix invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeFixOutcome {
    /// The cap was already reached; nothing was attempted.
    Exhausted { state: IterationState },
    /// The attempt was consumed without producing a commit.
    Failed {
        failure: FixFailure,
        state: IterationState,
        /// `None` when no retry was scheduled because the cap is reached.
        retry: Option<EscalationOutcome>,
    },
    /// Changes were pushed and the pull request is open.
    Opened {
        pr_number: u64,
        pr_url: String,
        state: IterationState,
    },
}

impl CodeFixOutcome {
    pub fn state(&self) -> &IterationState {
        match self {
            CodeFixOutcome::Exhausted { state }
            | CodeFixOutcome::Failed { state, .. }
            | CodeFixOutcome::Opened { state, .. } => state,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            CodeFixOutcome::Exhausted { .. } => exit_codes::EXHAUSTED,
            CodeFixOutcome::Failed { .. } => exit_codes::NO_EFFECT,
            CodeFixOutcome::Opened { .. } => exit_codes::OK,
        }
    }

    /// One-line summary for stdout.
    pub fn summary(&self) -> String {
        let state = self.state();
        let attempt = report::attempt_label(state.iteration, state.max_iterations);
        match self {
            CodeFixOutcome::Exhausted { .. } => format!("exhausted ({attempt})"),
            CodeFixOutcome::Failed { failure, retry, .. } => {
                let retry = match retry {
                    Some(outcome) if outcome.is_sent() => ", retry requested",
                    Some(_) => ", retry dispatch failed",
                    None => "",
                };
                format!("{failure} ({attempt}{retry})")
            }
            CodeFixOutcome::Opened { pr_url, .. } => format!("opened {pr_url} ({attempt})"),
        }
    }
}

/// Everything resolved before the checkout.
struct Cycle<'s> {
    settings: &'s Settings,
    agent_repo: String,
    issue: Issue,
    target_repo: String,
    branch: String,
    pull: Option<PullRequest>,
}

impl Cycle<'_> {
    fn issue_home(&self) -> StateHome {
        StateHome::new(&self.agent_repo, self.issue.number)
    }

    fn pull_home(&self, pull: &PullRequest) -> StateHome {
        StateHome::new(&self.target_repo, pull.number)
    }

    /// The open PR if there is one, else the originating issue.
    fn state_home(&self) -> StateHome {
        self.pull
            .as_ref()
            .map_or_else(|| self.issue_home(), |pull| self.pull_home(pull))
    }

    fn dispatch_repo(&self) -> &str {
        self.settings
            .github
            .agent_repo
            .as_deref()
            .unwrap_or(&self.agent_repo)
    }

    /// Post `body` on the issue and, when open, the pull request.
    fn notify(&self, hosting: &dyn HostingApi, body: &str) -> Result<()> {
        hosting
            .post_comment(&self.agent_repo, self.issue.number, body)
            .context("comment on issue")?;
        if let Some(pull) = &self.pull {
            hosting
                .post_comment(&self.target_repo, pull.number, body)
                .context("comment on pull request")?;
        }
        Ok(())
    }
}

/// What the checkout step produced.
enum Attempt {
    Pushed { base: String, summary: String },
    Soft { failure: FixFailure, detail: String },
}

/// Run one code-fix invocation for `request`.
#[instrument(skip_all, fields(repo = %request.agent_repo, issue = request.issue_number))]
pub fn run_code_fix(
    collab: &Collaborators<'_>,
    settings: &Settings,
    request: &CodeFixRequest,
) -> Result<CodeFixOutcome> {
    let hosting = collab.hosting;
    let issue = hosting
        .get_issue(&request.agent_repo, request.issue_number)
        .context("fetch issue")?;
    let target_repo = parse_target_repo(&issue.body).unwrap_or_else(|| request.agent_repo.clone());
    let branch = settings.github.branch_for_issue(issue.number);
    let pull = hosting
        .find_open_pull_by_branch(&target_repo, &branch)
        .context("look up open pull request")?;
    let cycle = Cycle {
        settings,
        agent_repo: request.agent_repo.clone(),
        issue,
        target_repo,
        branch,
        pull,
    };
    info!(target = %cycle.target_repo, branch = %cycle.branch, pr = ?cycle.pull.as_ref().map(|p| p.number), "resolved cycle");

    let state = recover_state(hosting, &cycle)?;
    if !state.can_iterate() {
        info!(iteration = state.iteration, "iteration cap reached");
        cycle.notify(hosting, &report::exhausted_message(&state))?;
        return Ok(CodeFixOutcome::Exhausted { state });
    }

    let state = state.advance(Verdict::InProgress);
    persist_state(hosting, &cycle.state_home(), &state)?;
    info!(iteration = state.iteration, max = state.max_iterations, "attempt started");

    let outcome = attempt_fix(collab, &cycle, &state).and_then(|attempt| match attempt {
        Attempt::Soft { failure, detail } => report_soft_failure(hosting, &cycle, state, failure, &detail),
        Attempt::Pushed { base, summary } => publish(hosting, &cycle, state, &base, &summary),
    });
    report_hard_failure(outcome, "the fix attempt", |body| cycle.notify(hosting, body))
}

/// State from the open PR, else from the issue, else a fresh cycle.
fn recover_state(hosting: &dyn HostingApi, cycle: &Cycle<'_>) -> Result<IterationState> {
    let default_max = cycle.settings.cycle.max_iterations;
    if let Some(pull) = &cycle.pull
        && let Some(state) = load_state(hosting, &cycle.pull_home(pull), default_max)?
    {
        return Ok(state);
    }
    if let Some(state) = load_state(hosting, &cycle.issue_home(), default_max)? {
        return Ok(state);
    }
    Ok(IterationState::new(
        &cycle.target_repo,
        &cycle.issue.html_url,
        default_max,
        Utc::now().to_rfc3339(),
    ))
}

/// Clone, patch, commit, and push inside a scratch directory that is removed
/// on every exit path.
fn attempt_fix(
    collab: &Collaborators<'_>,
    cycle: &Cycle<'_>,
    state: &IterationState,
) -> Result<Attempt> {
    let settings = cycle.settings;
    let token = &settings.secrets.github_token;
    let scratch = scratch_dir("fixloop-fix-")?;
    let url = authenticated_clone_url(&settings.github.git_host, &cycle.target_repo, token)?;
    let git = Git::clone_into(
        collab.runner,
        &url,
        scratch.path(),
        CHECKOUT_DIR,
        settings.commands.git_timeout(),
        token,
    )?;

    let base = git.default_branch()?;
    let start_point = if git.remote_branch_exists(&cycle.branch)? {
        format!("origin/{}", cycle.branch)
    } else {
        format!("origin/{base}")
    };
    git.checkout_reset(&cycle.branch, &start_point)?;

    let issue_text = format!("{}\n\n{}", cycle.issue.title, cycle.issue.body);
    let rules = settings.context.ranker_rules(&cycle.target_repo);
    let context = build_code_context(
        git.workdir(),
        &issue_text,
        &rules,
        settings.context.file_char_budget,
    )?;
    let user = PromptEngine::new()?.render_code_context(&issue_text, &context.summary, &context.files)?;
    let raw = collab
        .llm
        .complete(&CompletionRequest {
            system: CODE_SYSTEM_PROMPT.to_string(),
            user,
            temperature: settings.llm.temperature,
            max_tokens: settings.llm.max_tokens_fix,
        })
        .context("request patch from model")?;

    let document = match parse_document(&raw) {
        Ok(document) => document,
        Err(defect) => {
            warn!(%defect, "patch output unrecoverable");
            return Ok(Attempt::Soft {
                failure: FixFailure::InvalidOutput,
                detail: defect.to_string(),
            });
        }
    };
    let edits = FileEditSet::from_document(&document);
    let written = apply_file_edits(git.workdir(), &edits)?;
    if written.is_empty() {
        return Ok(soft(FixFailure::NoFiles));
    }
    if !git.has_changes()? {
        return Ok(soft(FixFailure::NoChanges));
    }

    git.add_all()?;
    let author = Author {
        name: settings.github.commit_author_name.clone(),
        email: settings.github.commit_author_email.clone(),
    };
    let commit = git.commit(&report::commit_message(state.iteration, &edits.summary), &author)?;
    if !commit.success() {
        return Ok(Attempt::Soft {
            failure: FixFailure::NoCommit,
            detail: commit.combined_output(),
        });
    }
    git.push(&cycle.branch)?;
    info!(files = written.len(), "changes pushed");
    Ok(Attempt::Pushed {
        base,
        summary: edits.summary,
    })
}

fn soft(failure: FixFailure) -> Attempt {
    Attempt::Soft {
        failure,
        detail: String::new(),
    }
}

/// Comment the failure and schedule a retry while attempts remain.
fn report_soft_failure(
    hosting: &dyn HostingApi,
    cycle: &Cycle<'_>,
    state: IterationState,
    failure: FixFailure,
    detail: &str,
) -> Result<CodeFixOutcome> {
    warn!(reason = failure.reason(), iteration = state.iteration, "attempt produced no commit");
    cycle.notify(hosting, &report::failure_comment(failure.message(), detail))?;
    let retry = if state.can_iterate() {
        Some(escalate(
            hosting,
            cycle.dispatch_repo(),
            &cycle.settings.github.code_event_type,
            &retry_payload(&cycle.agent_repo, cycle.issue.number, failure.reason()),
            &cycle.issue_home(),
        ))
    } else {
        cycle.notify(hosting, &report::exhausted_message(&state))?;
        None
    };
    Ok(CodeFixOutcome::Failed {
        failure,
        state,
        retry,
    })
}

/// Open or update the PR and record the attempt on it.
fn publish(
    hosting: &dyn HostingApi,
    cycle: &Cycle<'_>,
    state: IterationState,
    base: &str,
    summary: &str,
) -> Result<CodeFixOutcome> {
    let pull = hosting
        .create_or_update_pull(
            &cycle.target_repo,
            &cycle.branch,
            base,
            &report::pr_title(cycle.issue.number, &cycle.issue.title),
            &report::pr_body(&cycle.issue.html_url, summary, &cycle.issue.body),
        )
        .context("open or update pull request")?;
    let state = state.with_verdict(Verdict::PendingReview);
    let home = cycle.pull_home(&pull);
    persist_state(hosting, &home, &state)?;
    hosting
        .set_single_label_matching(
            &cycle.target_repo,
            pull.number,
            report::attempt_label_pattern(),
            &report::attempt_label(state.iteration, state.max_iterations),
        )
        .context("label pull request")?;
    hosting
        .post_comment(&cycle.target_repo, pull.number, &report::run_report_pending(&state))
        .context("post run report")?;
    if let Some(event_type) = &cycle.settings.github.review_event_type {
        escalate(
            hosting,
            cycle.dispatch_repo(),
            event_type,
            &review_payload(&cycle.target_repo, pull.number),
            &home,
        );
    }
    info!(pr = pull.number, "pull request ready for review");
    Ok(CodeFixOutcome::Opened {
        pr_number: pull.number,
        pr_url: pull.html_url,
        state,
    })
}
