//! Hosting API: issues, pull requests, comments, reviews, labels, dispatch.
//!
//! [`HostingApi`] is the seam the orchestration talks to. [`GitHubClient`]
//! implements it over the GitHub REST API with blocking `ureq` calls.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use ureq::Agent;
use url::Url;

const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 50;
const ERROR_BODY_CHARS: usize = 500;

/// Issue as seen by the orchestration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    /// `owner/name` the issue lives in.
    pub repo: String,
    pub number: u64,
    pub title: String,
    pub body: String,
    pub html_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub html_url: String,
    /// Login of the author.
    pub author: String,
    pub head_ref: String,
    /// `owner/name` holding the head branch (differs from the base for forks).
    pub head_repo: String,
}

/// One changed file in a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullFile {
    pub path: String,
    pub status: String,
    pub additions: u64,
    pub deletions: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub id: u64,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approve,
    RequestChanges,
    Comment,
}

impl ReviewDecision {
    pub fn as_event(self) -> &'static str {
        match self {
            ReviewDecision::Approve => "APPROVE",
            ReviewDecision::RequestChanges => "REQUEST_CHANGES",
            ReviewDecision::Comment => "COMMENT",
        }
    }
}

/// A non-success HTTP response from the hosting API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{method} {path} returned HTTP {status}: {body}")]
pub struct ApiError {
    pub status: u16,
    pub method: &'static str,
    pub path: String,
    pub body: String,
}

impl ApiError {
    /// The API refused the request as semantically invalid.
    pub fn is_unprocessable(&self) -> bool {
        self.status == 422
    }
}

/// Operations the fix and review paths need from the hosting service.
pub trait HostingApi {
    fn get_issue(&self, repo: &str, number: u64) -> Result<Issue>;
    fn get_pull(&self, repo: &str, number: u64) -> Result<PullRequest>;
    fn get_pull_files(&self, repo: &str, number: u64) -> Result<Vec<PullFile>>;
    fn get_pull_diff(&self, repo: &str, number: u64) -> Result<String>;
    fn find_open_pull_by_branch(&self, repo: &str, branch: &str) -> Result<Option<PullRequest>>;
    /// Update the open PR for `branch`, or open one against `base`.
    fn create_or_update_pull(
        &self,
        repo: &str,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest>;
    fn post_comment(&self, repo: &str, number: u64, body: &str) -> Result<()>;
    fn post_review(&self, repo: &str, number: u64, body: &str, decision: ReviewDecision)
    -> Result<()>;
    /// First comment on an issue or PR whose body contains `marker`.
    fn find_comment_containing(&self, repo: &str, number: u64, marker: &str)
    -> Result<Option<Comment>>;
    /// Edit the first comment containing `marker`, or post `body` as a new one.
    fn upsert_comment(&self, repo: &str, number: u64, marker: &str, body: &str) -> Result<()>;
    /// Remove labels matching `pattern` (other than `label`) and ensure `label` is set.
    fn set_single_label_matching(
        &self,
        repo: &str,
        number: u64,
        pattern: &Regex,
        label: &str,
    ) -> Result<()>;
    fn dispatch_event(&self, repo: &str, event_type: &str, payload: &Value) -> Result<()>;
    /// Login of the authenticated identity.
    fn current_actor(&self) -> Result<String>;
}

#[derive(Deserialize)]
struct IssueWire {
    number: u64,
    title: String,
    body: Option<String>,
    html_url: String,
}

#[derive(Deserialize)]
struct UserWire {
    login: String,
}

#[derive(Deserialize)]
struct RepoWire {
    full_name: String,
}

#[derive(Deserialize)]
struct HeadWire {
    #[serde(rename = "ref")]
    ref_name: String,
    repo: Option<RepoWire>,
}

#[derive(Deserialize)]
struct PullWire {
    number: u64,
    title: String,
    body: Option<String>,
    html_url: String,
    user: Option<UserWire>,
    head: HeadWire,
}

impl PullWire {
    fn into_pull(self, repo: &str) -> PullRequest {
        PullRequest {
            number: self.number,
            title: self.title,
            body: self.body.unwrap_or_default(),
            html_url: self.html_url,
            author: self.user.map(|u| u.login).unwrap_or_default(),
            head_ref: self.head.ref_name,
            head_repo: self
                .head
                .repo
                .map(|r| r.full_name)
                .unwrap_or_else(|| repo.to_string()),
        }
    }
}

#[derive(Deserialize)]
struct FileWire {
    filename: String,
    status: String,
    #[serde(default)]
    additions: u64,
    #[serde(default)]
    deletions: u64,
}

#[derive(Deserialize)]
struct CommentWire {
    id: u64,
    body: Option<String>,
}

#[derive(Deserialize)]
struct LabelWire {
    name: String,
}

/// GitHub REST client.
pub struct GitHubClient {
    agent: Agent,
    api_base: Url,
    token: String,
}

impl GitHubClient {
    pub fn new(api_base: &str, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let api_base =
            Url::parse(api_base).with_context(|| format!("parse API base '{api_base}'"))?;
        let config = Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        Ok(Self {
            agent: Agent::new_with_config(config),
            api_base,
            token: token.into(),
        })
    }

    /// `api_base` plus percent-encoded path segments.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("API base cannot be a base URL"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn repo_endpoint(&self, repo: &str, rest: &[&str]) -> Result<Url> {
        let (owner, name) = repo
            .split_once('/')
            .ok_or_else(|| anyhow!("repository must be owner/name, got '{repo}'"))?;
        let mut segments = vec!["repos", owner, name];
        segments.extend_from_slice(rest);
        self.endpoint(&segments)
    }

    fn get_text(&self, url: &Url, accept: &str) -> Result<String> {
        let result = self
            .agent
            .get(url.as_str())
            .header("Authorization", &format!("Bearer {}", self.token))
            .header("Accept", accept)
            .header("X-GitHub-Api-Version", "2022-11-28")
            .call();
        finish("GET", url, result)
    }

    fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &Url) -> Result<T> {
        let text = self.get_text(url, "application/vnd.github+json")?;
        serde_json::from_str(&text).with_context(|| format!("decode response of GET {}", url.path()))
    }

    fn send_json(&self, method: &'static str, url: &Url, body: &Value) -> Result<String> {
        let auth = format!("Bearer {}", self.token);
        let result = match method {
            "POST" => self.agent.post(url.as_str()),
            "PATCH" => self.agent.patch(url.as_str()),
            "PUT" => self.agent.put(url.as_str()),
            other => return Err(anyhow!("unsupported method {other}")),
        }
        .header("Authorization", &auth)
        .header("Accept", "application/vnd.github+json")
        .header("X-GitHub-Api-Version", "2022-11-28")
        .send_json(body);
        finish(method, url, result)
    }

    fn delete(&self, url: &Url) -> Result<()> {
        let result = self
            .agent
            .delete(url.as_str())
            .header("Authorization", &format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .call();
        finish("DELETE", url, result).map(|_| ())
    }

    /// Fetch every page of a list endpoint.
    fn get_paginated<T: for<'de> Deserialize<'de>>(&self, base: Url) -> Result<Vec<T>> {
        let mut items = Vec::new();
        for page in 1..=MAX_PAGES {
            let mut url = base.clone();
            url.query_pairs_mut()
                .append_pair("per_page", &PAGE_SIZE.to_string())
                .append_pair("page", &page.to_string());
            let batch: Vec<T> = self.get_json(&url)?;
            let done = batch.len() < PAGE_SIZE;
            items.extend(batch);
            if done {
                return Ok(items);
            }
        }
        warn!(path = base.path(), "pagination limit reached");
        Ok(items)
    }

    fn comments(&self, repo: &str, number: u64) -> Result<Vec<CommentWire>> {
        let n = number.to_string();
        self.get_paginated(self.repo_endpoint(repo, &["issues", &n, "comments"])?)
    }
}

fn finish(
    method: &'static str,
    url: &Url,
    result: std::result::Result<ureq::http::Response<ureq::Body>, ureq::Error>,
) -> Result<String> {
    let mut resp = result.with_context(|| format!("{method} {}", url.path()))?;
    let status = resp.status().as_u16();
    let text = resp
        .body_mut()
        .read_to_string()
        .with_context(|| format!("read response of {method} {}", url.path()))?;
    if !(200..300).contains(&status) {
        let body: String = text.chars().take(ERROR_BODY_CHARS).collect();
        return Err(ApiError {
            status,
            method,
            path: url.path().to_string(),
            body,
        }
        .into());
    }
    debug!(method, path = url.path(), status, "hosting call ok");
    Ok(text)
}

impl HostingApi for GitHubClient {
    #[instrument(skip_all, fields(repo = %repo, number = number))]
    fn get_issue(&self, repo: &str, number: u64) -> Result<Issue> {
        let wire: IssueWire = self.get_json(&self.repo_endpoint(repo, &["issues", &number.to_string()])?)?;
        Ok(Issue {
            repo: repo.to_string(),
            number: wire.number,
            title: wire.title,
            body: wire.body.unwrap_or_default(),
            html_url: wire.html_url,
        })
    }

    #[instrument(skip_all, fields(repo = %repo, number = number))]
    fn get_pull(&self, repo: &str, number: u64) -> Result<PullRequest> {
        let wire: PullWire = self.get_json(&self.repo_endpoint(repo, &["pulls", &number.to_string()])?)?;
        Ok(wire.into_pull(repo))
    }

    fn get_pull_files(&self, repo: &str, number: u64) -> Result<Vec<PullFile>> {
        let n = number.to_string();
        let files: Vec<FileWire> = self.get_paginated(self.repo_endpoint(repo, &["pulls", &n, "files"])?)?;
        Ok(files
            .into_iter()
            .map(|f| PullFile {
                path: f.filename,
                status: f.status,
                additions: f.additions,
                deletions: f.deletions,
            })
            .collect())
    }

    fn get_pull_diff(&self, repo: &str, number: u64) -> Result<String> {
        let url = self.repo_endpoint(repo, &["pulls", &number.to_string()])?;
        self.get_text(&url, "application/vnd.github.v3.diff")
    }

    fn find_open_pull_by_branch(&self, repo: &str, branch: &str) -> Result<Option<PullRequest>> {
        let owner = repo.split('/').next().unwrap_or(repo);
        let mut url = self.repo_endpoint(repo, &["pulls"])?;
        url.query_pairs_mut()
            .append_pair("state", "open")
            .append_pair("head", &format!("{owner}:{branch}"));
        let pulls: Vec<PullWire> = self.get_json(&url)?;
        Ok(pulls.into_iter().next().map(|p| p.into_pull(repo)))
    }

    #[instrument(skip_all, fields(repo = %repo, branch = %branch))]
    fn create_or_update_pull(
        &self,
        repo: &str,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest> {
        let text = if let Some(existing) = self.find_open_pull_by_branch(repo, branch)? {
            debug!(number = existing.number, "updating existing pull request");
            let url = self.repo_endpoint(repo, &["pulls", &existing.number.to_string()])?;
            self.send_json("PATCH", &url, &json!({ "title": title, "body": body }))?
        } else {
            debug!(base, "opening pull request");
            let url = self.repo_endpoint(repo, &["pulls"])?;
            self.send_json(
                "POST",
                &url,
                &json!({ "title": title, "body": body, "head": branch, "base": base }),
            )?
        };
        let wire: PullWire = serde_json::from_str(&text).context("decode pull request")?;
        Ok(wire.into_pull(repo))
    }

    fn post_comment(&self, repo: &str, number: u64, body: &str) -> Result<()> {
        let url = self.repo_endpoint(repo, &["issues", &number.to_string(), "comments"])?;
        self.send_json("POST", &url, &json!({ "body": body }))?;
        Ok(())
    }

    #[instrument(skip_all, fields(repo = %repo, number = number, event = decision.as_event()))]
    fn post_review(
        &self,
        repo: &str,
        number: u64,
        body: &str,
        decision: ReviewDecision,
    ) -> Result<()> {
        let url = self.repo_endpoint(repo, &["pulls", &number.to_string(), "reviews"])?;
        self.send_json(
            "POST",
            &url,
            &json!({ "body": body, "event": decision.as_event() }),
        )?;
        Ok(())
    }

    fn find_comment_containing(
        &self,
        repo: &str,
        number: u64,
        marker: &str,
    ) -> Result<Option<Comment>> {
        Ok(self
            .comments(repo, number)?
            .into_iter()
            .map(|c| Comment {
                id: c.id,
                body: c.body.unwrap_or_default(),
            })
            .find(|c| c.body.contains(marker)))
    }

    fn upsert_comment(&self, repo: &str, number: u64, marker: &str, body: &str) -> Result<()> {
        match self.find_comment_containing(repo, number, marker)? {
            Some(existing) => {
                let url =
                    self.repo_endpoint(repo, &["issues", "comments", &existing.id.to_string()])?;
                self.send_json("PATCH", &url, &json!({ "body": body }))?;
            }
            None => self.post_comment(repo, number, body)?,
        }
        Ok(())
    }

    #[instrument(skip_all, fields(repo = %repo, number = number, label = %label))]
    fn set_single_label_matching(
        &self,
        repo: &str,
        number: u64,
        pattern: &Regex,
        label: &str,
    ) -> Result<()> {
        let n = number.to_string();
        let labels: Vec<LabelWire> =
            self.get_paginated(self.repo_endpoint(repo, &["issues", &n, "labels"])?)?;
        let mut present = false;
        for existing in labels {
            if existing.name == label {
                present = true;
            } else if pattern.is_match(&existing.name) {
                debug!(name = %existing.name, "removing stale label");
                self.delete(&self.repo_endpoint(repo, &["issues", &n, "labels", &existing.name])?)?;
            }
        }
        if !present {
            let url = self.repo_endpoint(repo, &["issues", &n, "labels"])?;
            self.send_json("POST", &url, &json!({ "labels": [label] }))?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(repo = %repo, event_type = %event_type))]
    fn dispatch_event(&self, repo: &str, event_type: &str, payload: &Value) -> Result<()> {
        let url = self.repo_endpoint(repo, &["dispatches"])?;
        self.send_json(
            "POST",
            &url,
            &json!({ "event_type": event_type, "client_payload": payload }),
        )?;
        Ok(())
    }

    fn current_actor(&self) -> Result<String> {
        let user: UserWire = self.get_json(&self.endpoint(&["user"])?)?;
        Ok(user.login)
    }
}
