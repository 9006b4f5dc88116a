//! Git adapter for scratch checkouts.
//!
//! Every call goes through a [`CommandRunner`] so checkouts can be faked in
//! tests. The access token only ever appears in the clone URL and is masked in
//! logs and error messages.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::core::types::CommandOutcome;
use crate::io::process::{CommandRunner, CommandSpec};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Commit identity used for fix commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub name: String,
    pub email: String,
}

/// `https://x-access-token:<token>@host/owner/name.git`.
pub fn authenticated_clone_url(git_host: &str, repo: &str, token: &str) -> Result<String> {
    let base = Url::parse(git_host).with_context(|| format!("parse git host '{git_host}'"))?;
    let mut url = base
        .join(&format!("{repo}.git"))
        .with_context(|| format!("build clone url for {repo}"))?;
    url.set_username("x-access-token")
        .map_err(|()| anyhow!("git host '{git_host}' cannot carry credentials"))?;
    url.set_password(Some(token))
        .map_err(|()| anyhow!("git host '{git_host}' cannot carry credentials"))?;
    Ok(url.to_string())
}

/// Wrapper for executing git commands in one checkout.
pub struct Git<'a> {
    runner: &'a dyn CommandRunner,
    workdir: PathBuf,
    timeout: Duration,
    secret: String,
}

impl<'a> Git<'a> {
    pub fn new(runner: &'a dyn CommandRunner, workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            runner,
            workdir: workdir.into(),
            timeout,
            secret: String::new(),
        }
    }

    /// Mask `secret` in displayed commands and errors.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    /// Clone `url` into `parent/dir_name` and return a wrapper for it.
    #[instrument(skip_all, fields(dir = %dir_name))]
    pub fn clone_into(
        runner: &'a dyn CommandRunner,
        url: &str,
        parent: &Path,
        dir_name: &str,
        timeout: Duration,
        secret: &str,
    ) -> Result<Self> {
        let outer = Git::new(runner, parent, timeout).with_secret(secret);
        outer.run_checked(&["clone", url, dir_name])?;
        debug!("clone complete");
        Ok(Git::new(runner, parent.join(dir_name), timeout).with_secret(secret))
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Branch that `origin/HEAD` points to, `main` if unknown.
    pub fn default_branch(&self) -> Result<String> {
        let out = self.run(&["symbolic-ref", "refs/remotes/origin/HEAD"])?;
        if out.success()
            && let Some(name) = out.stdout.trim().strip_prefix("refs/remotes/origin/")
            && !name.is_empty()
        {
            return Ok(name.to_string());
        }
        warn!("origin/HEAD unresolved, assuming main");
        Ok("main".to_string())
    }

    pub fn remote_branch_exists(&self, branch: &str) -> Result<bool> {
        let reference = format!("refs/remotes/origin/{branch}");
        Ok(self
            .run(&["rev-parse", "--verify", "--quiet", &reference])?
            .success())
    }

    /// Check out `branch`, resetting it to `start_point`.
    #[instrument(skip_all, fields(branch = %branch, start_point = %start_point))]
    pub fn checkout_reset(&self, branch: &str, start_point: &str) -> Result<()> {
        debug!(branch, start_point, "checking out branch");
        self.run_checked(&["checkout", "-B", branch, start_point])?;
        Ok(())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_checked(&["status", "--porcelain=v1", "-uall"])?;
        out.stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_status_line)
            .collect()
    }

    pub fn has_changes(&self) -> Result<bool> {
        Ok(!self.status_porcelain()?.is_empty())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// Commit staged changes. A failed commit is returned as an outcome.
    #[instrument(skip_all)]
    pub fn commit(&self, message: &str, author: &Author) -> Result<CommandOutcome> {
        let name = format!("user.name={}", author.name);
        let email = format!("user.email={}", author.email);
        self.run(&["-c", &name, "-c", &email, "commit", "-m", message])
    }

    #[instrument(skip_all, fields(branch = %branch))]
    pub fn push(&self, branch: &str) -> Result<()> {
        debug!(branch, "pushing");
        self.run_checked(&["push", "-u", "origin", branch])?;
        Ok(())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutcome> {
        let outcome = self.run(args)?;
        if !outcome.success() {
            return Err(anyhow!(
                "{} failed ({}): {}",
                outcome.command,
                exit_label(&outcome),
                outcome.stderr.trim()
            ));
        }
        Ok(outcome)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutcome> {
        let spec = CommandSpec::new("git")
            .args(args.iter().copied())
            .redact(self.secret.clone());
        self.runner
            .run(&spec, &self.workdir, self.timeout)
            .with_context(|| format!("run {}", spec.display()))
    }
}

fn exit_label(outcome: &CommandOutcome) -> String {
    match outcome.exit_code {
        _ if outcome.timed_out => "timed out".to_string(),
        Some(code) => format!("exit {code}"),
        None => "killed".to_string(),
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 || !line.is_char_boundary(2) || !line.is_char_boundary(3) {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
