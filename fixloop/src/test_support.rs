//! In-memory collaborators for orchestration tests.
//!
//! [`FakeHosting`] keeps issues, pull requests, comments and labels in maps
//! and records every review and dispatch. [`ScriptedLlm`] replays queued
//! replies. [`FakeRunner`] simulates git against a seeded file tree and
//! answers other commands from a script.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, anyhow};
use regex::Regex;
use serde_json::Value;
use walkdir::WalkDir;

use crate::core::types::CommandOutcome;
use crate::io::config::{Secrets, Settings};
use crate::io::hosting::{
    ApiError, Comment, HostingApi, Issue, PullFile, PullRequest, ReviewDecision,
};
use crate::io::llm::{CompletionRequest, LanguageModel};
use crate::io::process::{CommandRunner, CommandSpec};

pub const TEST_GITHUB_TOKEN: &str = "ghp_test_token";

/// Default settings with secrets filled in.
pub fn test_settings() -> Settings {
    Settings {
        secrets: Secrets {
            github_token: TEST_GITHUB_TOKEN.to_string(),
            llm_api_key: "llm-test-key".to_string(),
        },
        ..Settings::default()
    }
}

type Key = (String, u64);

fn key(repo: &str, number: u64) -> Key {
    (repo.to_string(), number)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedReview {
    pub repo: String,
    pub number: u64,
    pub body: String,
    pub decision: ReviewDecision,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedDispatch {
    pub repo: String,
    pub event_type: String,
    pub payload: Value,
}

struct HostingState {
    issues: BTreeMap<Key, Issue>,
    pulls: BTreeMap<Key, PullRequest>,
    diffs: BTreeMap<Key, String>,
    files: BTreeMap<Key, Vec<PullFile>>,
    comments: BTreeMap<Key, Vec<Comment>>,
    labels: BTreeMap<Key, Vec<String>>,
    reviews: Vec<RecordedReview>,
    dispatches: Vec<RecordedDispatch>,
    actor: String,
    dispatch_error: Option<String>,
    refuse_request_changes: bool,
    next_comment_id: u64,
    next_pull_number: u64,
}

/// Hosting API backed by maps.
pub struct FakeHosting {
    state: RefCell<HostingState>,
}

impl Default for FakeHosting {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHosting {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(HostingState {
                issues: BTreeMap::new(),
                pulls: BTreeMap::new(),
                diffs: BTreeMap::new(),
                files: BTreeMap::new(),
                comments: BTreeMap::new(),
                labels: BTreeMap::new(),
                reviews: Vec::new(),
                dispatches: Vec::new(),
                actor: "fixloop-bot".to_string(),
                dispatch_error: None,
                refuse_request_changes: false,
                next_comment_id: 1,
                next_pull_number: 100,
            }),
        }
    }

    pub fn add_issue(&self, repo: &str, number: u64, title: &str, body: &str) -> Issue {
        let issue = Issue {
            repo: repo.to_string(),
            number,
            title: title.to_string(),
            body: body.to_string(),
            html_url: format!("https://github.com/{repo}/issues/{number}"),
        };
        self.state
            .borrow_mut()
            .issues
            .insert(key(repo, number), issue.clone());
        issue
    }

    /// Register an open pull request whose head branch lives in `repo`.
    pub fn add_pull(&self, repo: &str, number: u64, head_ref: &str, author: &str) -> PullRequest {
        let pull = PullRequest {
            number,
            title: format!("PR {number}"),
            body: String::new(),
            html_url: format!("https://github.com/{repo}/pull/{number}"),
            author: author.to_string(),
            head_ref: head_ref.to_string(),
            head_repo: repo.to_string(),
        };
        self.state
            .borrow_mut()
            .pulls
            .insert(key(repo, number), pull.clone());
        pull
    }

    pub fn set_pull_diff(&self, repo: &str, number: u64, diff: &str, files: Vec<PullFile>) {
        let mut state = self.state.borrow_mut();
        state.diffs.insert(key(repo, number), diff.to_string());
        state.files.insert(key(repo, number), files);
    }

    pub fn add_comment(&self, repo: &str, number: u64, body: &str) {
        let mut state = self.state.borrow_mut();
        let id = state.next_comment_id;
        state.next_comment_id += 1;
        state.comments.entry(key(repo, number)).or_default().push(Comment {
            id,
            body: body.to_string(),
        });
    }

    pub fn add_label(&self, repo: &str, number: u64, label: &str) {
        self.state
            .borrow_mut()
            .labels
            .entry(key(repo, number))
            .or_default()
            .push(label.to_string());
    }

    pub fn set_actor(&self, login: &str) {
        self.state.borrow_mut().actor = login.to_string();
    }

    /// Make every dispatch fail with `message`.
    pub fn fail_dispatch(&self, message: &str) {
        self.state.borrow_mut().dispatch_error = Some(message.to_string());
    }

    /// Answer `REQUEST_CHANGES` reviews with HTTP 422.
    pub fn refuse_request_changes(&self) {
        self.state.borrow_mut().refuse_request_changes = true;
    }

    pub fn comments_on(&self, repo: &str, number: u64) -> Vec<String> {
        self.state
            .borrow()
            .comments
            .get(&key(repo, number))
            .map(|list| list.iter().map(|c| c.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn labels_on(&self, repo: &str, number: u64) -> Vec<String> {
        self.state
            .borrow()
            .labels
            .get(&key(repo, number))
            .cloned()
            .unwrap_or_default()
    }

    pub fn pulls(&self, repo: &str) -> Vec<PullRequest> {
        self.state
            .borrow()
            .pulls
            .iter()
            .filter(|((r, _), _)| r == repo)
            .map(|(_, pull)| pull.clone())
            .collect()
    }

    pub fn reviews(&self) -> Vec<RecordedReview> {
        self.state.borrow().reviews.clone()
    }

    pub fn dispatches(&self) -> Vec<RecordedDispatch> {
        self.state.borrow().dispatches.clone()
    }
}

impl HostingApi for FakeHosting {
    fn get_issue(&self, repo: &str, number: u64) -> Result<Issue> {
        self.state
            .borrow()
            .issues
            .get(&key(repo, number))
            .cloned()
            .ok_or_else(|| anyhow!("issue {repo}#{number} not found"))
    }

    fn get_pull(&self, repo: &str, number: u64) -> Result<PullRequest> {
        self.state
            .borrow()
            .pulls
            .get(&key(repo, number))
            .cloned()
            .ok_or_else(|| anyhow!("pull {repo}#{number} not found"))
    }

    fn get_pull_files(&self, repo: &str, number: u64) -> Result<Vec<PullFile>> {
        Ok(self
            .state
            .borrow()
            .files
            .get(&key(repo, number))
            .cloned()
            .unwrap_or_default())
    }

    fn get_pull_diff(&self, repo: &str, number: u64) -> Result<String> {
        Ok(self
            .state
            .borrow()
            .diffs
            .get(&key(repo, number))
            .cloned()
            .unwrap_or_default())
    }

    fn find_open_pull_by_branch(&self, repo: &str, branch: &str) -> Result<Option<PullRequest>> {
        Ok(self
            .pulls(repo)
            .into_iter()
            .find(|pull| pull.head_ref == branch))
    }

    fn create_or_update_pull(
        &self,
        repo: &str,
        branch: &str,
        _base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest> {
        if let Some(existing) = self.find_open_pull_by_branch(repo, branch)? {
            let mut state = self.state.borrow_mut();
            let pull = state
                .pulls
                .get_mut(&key(repo, existing.number))
                .ok_or_else(|| anyhow!("pull vanished"))?;
            pull.title = title.to_string();
            pull.body = body.to_string();
            return Ok(pull.clone());
        }
        let mut state = self.state.borrow_mut();
        let number = state.next_pull_number;
        state.next_pull_number += 1;
        let pull = PullRequest {
            number,
            title: title.to_string(),
            body: body.to_string(),
            html_url: format!("https://github.com/{repo}/pull/{number}"),
            author: state.actor.clone(),
            head_ref: branch.to_string(),
            head_repo: repo.to_string(),
        };
        state.pulls.insert(key(repo, number), pull.clone());
        Ok(pull)
    }

    fn post_comment(&self, repo: &str, number: u64, body: &str) -> Result<()> {
        self.add_comment(repo, number, body);
        Ok(())
    }

    fn post_review(
        &self,
        repo: &str,
        number: u64,
        body: &str,
        decision: ReviewDecision,
    ) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.refuse_request_changes && decision == ReviewDecision::RequestChanges {
            return Err(ApiError {
                status: 422,
                method: "POST",
                path: format!("/repos/{repo}/pulls/{number}/reviews"),
                body: "Unprocessable Entity".to_string(),
            }
            .into());
        }
        state.reviews.push(RecordedReview {
            repo: repo.to_string(),
            number,
            body: body.to_string(),
            decision,
        });
        Ok(())
    }

    fn find_comment_containing(
        &self,
        repo: &str,
        number: u64,
        marker: &str,
    ) -> Result<Option<Comment>> {
        Ok(self
            .state
            .borrow()
            .comments
            .get(&key(repo, number))
            .and_then(|list| list.iter().find(|c| c.body.contains(marker)).cloned()))
    }

    fn upsert_comment(&self, repo: &str, number: u64, marker: &str, body: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if let Some(existing) = state
            .comments
            .get_mut(&key(repo, number))
            .and_then(|list| list.iter_mut().find(|c| c.body.contains(marker)))
        {
            existing.body = body.to_string();
            return Ok(());
        }
        drop(state);
        self.add_comment(repo, number, body);
        Ok(())
    }

    fn set_single_label_matching(
        &self,
        repo: &str,
        number: u64,
        pattern: &Regex,
        label: &str,
    ) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let labels = state.labels.entry(key(repo, number)).or_default();
        labels.retain(|existing| existing == label || !pattern.is_match(existing));
        if !labels.iter().any(|existing| existing == label) {
            labels.push(label.to_string());
        }
        Ok(())
    }

    fn dispatch_event(&self, repo: &str, event_type: &str, payload: &Value) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if let Some(message) = &state.dispatch_error {
            return Err(anyhow!("dispatch {event_type} to {repo}: {message}"));
        }
        state.dispatches.push(RecordedDispatch {
            repo: repo.to_string(),
            event_type: event_type.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }

    fn current_actor(&self) -> Result<String> {
        Ok(self.state.borrow().actor.clone())
    }
}

/// Model that replays queued replies in order and records every request.
#[derive(Default)]
pub struct ScriptedLlm {
    replies: RefCell<VecDeque<String>>,
    requests: RefCell<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: RefCell::new(replies.into_iter().map(Into::into).collect()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.borrow().clone()
    }
}

impl LanguageModel for ScriptedLlm {
    fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.requests.borrow_mut().push(request.clone());
        self.replies
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted reply left"))
    }
}

/// A command the fake runner saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub command: String,
    pub workdir: PathBuf,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
struct ScriptedCommand {
    prefix: String,
    exit_code: i32,
    stdout: String,
    /// Remaining uses; `None` means unlimited.
    uses: Option<usize>,
}

/// Command runner that fakes git over a seeded file tree.
///
/// `git clone` writes the seed files into the target directory and
/// `git status` diffs the checkout against them. Other commands succeed with
/// empty output unless scripted with [`FakeRunner::script`].
#[derive(Default)]
pub struct FakeRunner {
    seed: BTreeMap<String, String>,
    remote_branches: Vec<String>,
    commit_exit_code: i32,
    scripted: RefCell<Vec<ScriptedCommand>>,
    commands: RefCell<Vec<RecordedCommand>>,
}

impl FakeRunner {
    pub fn with_repo(files: &[(&str, &str)]) -> Self {
        Self {
            seed: files
                .iter()
                .map(|(path, content)| ((*path).to_string(), (*content).to_string()))
                .collect(),
            ..Self::default()
        }
    }

    /// Pretend `origin/<branch>` exists.
    pub fn with_remote_branch(mut self, branch: &str) -> Self {
        self.remote_branches.push(branch.to_string());
        self
    }

    pub fn with_commit_exit_code(mut self, code: i32) -> Self {
        self.commit_exit_code = code;
        self
    }

    /// Commands whose display starts with `prefix` exit with `exit_code` and print `stdout`.
    pub fn script(self, prefix: &str, exit_code: i32, stdout: &str) -> Self {
        self.push_script(prefix, exit_code, stdout, None)
    }

    /// Like [`FakeRunner::script`], but only for the next `times` matches.
    pub fn script_times(self, prefix: &str, exit_code: i32, stdout: &str, times: usize) -> Self {
        self.push_script(prefix, exit_code, stdout, Some(times))
    }

    fn push_script(self, prefix: &str, exit_code: i32, stdout: &str, uses: Option<usize>) -> Self {
        self.scripted.borrow_mut().push(ScriptedCommand {
            prefix: prefix.to_string(),
            exit_code,
            stdout: stdout.to_string(),
            uses,
        });
        self
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.commands.borrow().clone()
    }

    /// Displayed command lines, in order.
    pub fn command_lines(&self) -> Vec<String> {
        self.commands
            .borrow()
            .iter()
            .map(|c| c.command.clone())
            .collect()
    }

    fn git(&self, args: &[String], workdir: &Path) -> Result<(i32, String)> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["clone", _, dir] => {
                let root = workdir.join(dir);
                for (path, content) in &self.seed {
                    let target = root.join(path);
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(target, content)?;
                }
                fs::create_dir_all(root.join(".git"))?;
                Ok((0, String::new()))
            }
            ["symbolic-ref", ..] => Ok((0, "refs/remotes/origin/main\n".to_string())),
            ["rev-parse", .., reference] => {
                let exists = reference
                    .strip_prefix("refs/remotes/origin/")
                    .is_some_and(|b| self.remote_branches.iter().any(|r| r == b));
                Ok((if exists { 0 } else { 1 }, String::new()))
            }
            ["status", ..] => Ok((0, self.status(workdir)?)),
            [.., "commit", "-m", _] => Ok((self.commit_exit_code, String::new())),
            _ => Ok((0, String::new())),
        }
    }

    fn status(&self, root: &Path) -> Result<String> {
        let mut lines = Vec::new();
        let mut present = Vec::new();
        for entry in WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git")
        {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)?
                .to_string_lossy()
                .replace('\\', "/");
            let content = fs::read_to_string(entry.path())?;
            match self.seed.get(&rel) {
                None => lines.push(format!("?? {rel}")),
                Some(seeded) if *seeded != content => lines.push(format!(" M {rel}")),
                Some(_) => {}
            }
            present.push(rel);
        }
        for path in self.seed.keys() {
            if !present.contains(path) {
                lines.push(format!(" D {path}"));
            }
        }
        Ok(lines.join("\n"))
    }

    fn scripted_reply(&self, command: &str) -> Option<(i32, String)> {
        let mut scripted = self.scripted.borrow_mut();
        let entry = scripted
            .iter_mut()
            .find(|s| command.starts_with(&s.prefix) && s.uses != Some(0))?;
        if let Some(uses) = entry.uses.as_mut() {
            *uses -= 1;
        }
        Some((entry.exit_code, entry.stdout.clone()))
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, spec: &CommandSpec, workdir: &Path, _timeout: Duration) -> Result<CommandOutcome> {
        let command = spec.display();
        self.commands.borrow_mut().push(RecordedCommand {
            command: command.clone(),
            workdir: workdir.to_path_buf(),
            env: spec.env.clone(),
        });
        let (exit_code, stdout) = match self.scripted_reply(&command) {
            Some(reply) => reply,
            None if spec.program == "git" => self.git(&spec.args, workdir)?,
            None => (0, String::new()),
        };
        Ok(CommandOutcome {
            command,
            exit_code: Some(exit_code),
            stdout,
            stderr: String::new(),
            duration: Duration::from_millis(10),
            timed_out: false,
        })
    }
}
