//! Settings for one invocation, built once in `main` and passed by reference.
//!
//! Layering: built-in defaults, then the optional TOML file, then overrides
//! from an [`EnvVars`] snapshot. Secrets come only from the snapshot.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::ranker::{MAX_CONTEXT_FILES, RankerRules};
use crate::core::refs::is_repo_slug;

/// Default settings file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "fixloop.toml";

/// Fully resolved settings (TOML plus environment).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub github: GitHubSettings,
    pub llm: LlmSettings,
    pub cycle: CycleSettings,
    pub commands: CommandSettings,
    pub context: ContextSettings,
    #[serde(skip)]
    pub secrets: Secrets,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitHubSettings {
    pub api_base: String,
    /// Base URL used for `git clone`.
    pub git_host: String,
    /// Repository that receives dispatch events; defaults to the issue's repo.
    pub agent_repo: Option<String>,
    /// Dispatch event that triggers the code-fix path.
    pub code_event_type: String,
    /// Dispatch event sent after a successful fix. Unset disables it.
    pub review_event_type: Option<String>,
    pub branch_prefix: String,
    pub commit_author_name: String,
    pub commit_author_email: String,
    pub request_timeout_secs: u64,
}

impl Default for GitHubSettings {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            git_host: "https://github.com".to_string(),
            agent_repo: None,
            code_event_type: "issue_opened".to_string(),
            review_event_type: None,
            branch_prefix: "fixloop/issue-".to_string(),
            commit_author_name: "fixloop".to_string(),
            commit_author_email: "fixloop@users.noreply.github.com".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl GitHubSettings {
    pub fn branch_for_issue(&self, issue_number: u64) -> String {
        format!("{}{issue_number}", self.branch_prefix)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmSettings {
    /// OpenAI-compatible base URL (`/chat/completions` is appended).
    pub api_base: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens_fix: u32,
    pub max_tokens_review: u32,
    pub max_tokens_tests: u32,
    pub timeout_secs: u64,
    /// Extra attempts after the first on transient failures.
    pub retries: u32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_base: "https://api.mistral.ai/v1".to_string(),
            model: "codestral-latest".to_string(),
            temperature: 0.2,
            max_tokens_fix: 2048,
            max_tokens_review: 1024,
            max_tokens_tests: 1024,
            timeout_secs: 60,
            retries: 2,
        }
    }
}

impl LlmSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CycleSettings {
    /// Attempt cap stamped into new cycles.
    pub max_iterations: u32,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self { max_iterations: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandSettings {
    /// Preferred test command; the runner falls back to plain pytest forms.
    pub test: Vec<String>,
    /// Quality commands run before tests in review (e.g. `["ruff","check","."]`).
    pub quality: Vec<Vec<String>>,
    pub test_timeout_secs: u64,
    pub install_timeout_secs: u64,
    pub git_timeout_secs: u64,
    /// Bytes of stdout/stderr kept per command.
    pub output_limit_bytes: usize,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            test: split_command("python -m pytest -q"),
            quality: Vec::new(),
            test_timeout_secs: 900,
            install_timeout_secs: 600,
            git_timeout_secs: 300,
            output_limit_bytes: 100_000,
        }
    }
}

impl CommandSettings {
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextSettings {
    pub max_files: usize,
    /// Characters kept per embedded file.
    pub file_char_budget: usize,
    pub text_extensions: Vec<String>,
    pub source_extensions: Vec<String>,
    pub skip_dirs: Vec<String>,
}

impl Default for ContextSettings {
    fn default() -> Self {
        let rules = RankerRules::default();
        Self {
            max_files: MAX_CONTEXT_FILES,
            file_char_budget: 4000,
            text_extensions: rules.text_extensions,
            source_extensions: rules.source_extensions,
            skip_dirs: rules.skip_dirs,
        }
    }
}

impl ContextSettings {
    /// Ranking rules for a checkout of `repo` (`owner/name`).
    pub fn ranker_rules(&self, repo: &str) -> RankerRules {
        RankerRules {
            text_extensions: self.text_extensions.clone(),
            source_extensions: self.source_extensions.clone(),
            skip_dirs: self.skip_dirs.clone(),
            max_files: self.max_files,
            ..RankerRules::default()
        }
        .with_package_of(repo)
    }
}

/// Credentials; never serialized and redacted in `Debug`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secrets {
    pub github_token: String,
    pub llm_api_key: String,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("github_token", &redacted(&self.github_token))
            .field("llm_api_key", &redacted(&self.llm_api_key))
            .finish()
    }
}

fn redacted(value: &str) -> &'static str {
    if value.is_empty() { "<unset>" } else { "<redacted>" }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            github: GitHubSettings::default(),
            llm: LlmSettings::default(),
            cycle: CycleSettings::default(),
            commands: CommandSettings::default(),
            context: ContextSettings::default(),
            secrets: Secrets::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        for (name, url) in [
            ("github.api_base", &self.github.api_base),
            ("github.git_host", &self.github.git_host),
            ("llm.api_base", &self.llm.api_base),
        ] {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(anyhow!("{name} must be an http(s) URL, got '{url}'"));
            }
        }
        if let Some(repo) = &self.github.agent_repo
            && !is_repo_slug(repo)
        {
            return Err(anyhow!("github.agent_repo must be owner/name, got '{repo}'"));
        }
        if self.github.code_event_type.trim().is_empty() {
            return Err(anyhow!("github.code_event_type must be non-empty"));
        }
        if self.github.branch_prefix.trim().is_empty() {
            return Err(anyhow!("github.branch_prefix must be non-empty"));
        }
        if self.github.request_timeout_secs == 0 {
            return Err(anyhow!("github.request_timeout_secs must be > 0"));
        }
        if self.llm.model.trim().is_empty() {
            return Err(anyhow!("llm.model must be non-empty"));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(anyhow!("llm.temperature must be within 0..=2"));
        }
        if self.llm.timeout_secs == 0 {
            return Err(anyhow!("llm.timeout_secs must be > 0"));
        }
        if self.cycle.max_iterations == 0 {
            return Err(anyhow!("cycle.max_iterations must be > 0"));
        }
        let cmds = &self.commands;
        if cmds.test_timeout_secs == 0 || cmds.install_timeout_secs == 0 || cmds.git_timeout_secs == 0
        {
            return Err(anyhow!("command timeouts must be > 0"));
        }
        if cmds.output_limit_bytes == 0 {
            return Err(anyhow!("commands.output_limit_bytes must be > 0"));
        }
        if !is_command(&cmds.test) {
            return Err(anyhow!("commands.test must be a non-empty array"));
        }
        if !cmds.quality.iter().all(|cmd| is_command(cmd)) {
            return Err(anyhow!("commands.quality entries must be non-empty arrays"));
        }
        if self.context.max_files == 0 || self.context.file_char_budget == 0 {
            return Err(anyhow!("context.max_files and context.file_char_budget must be > 0"));
        }
        if self.secrets.github_token.is_empty() {
            return Err(anyhow!(
                "missing required environment variable GITHUB_TOKEN (or AGENT_GITHUB_TOKEN)"
            ));
        }
        if self.secrets.llm_api_key.is_empty() {
            return Err(anyhow!(
                "missing required environment variable LLM_API_KEY (or CODESTRAL_API_KEY)"
            ));
        }
        Ok(())
    }

    fn apply_env(&mut self, env: &EnvVars) -> Result<()> {
        if let Some(v) = env.first_of(&["GITHUB_API_BASE"]) {
            self.github.api_base = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = env.first_of(&["AGENT_REPO"]) {
            self.github.agent_repo = Some(v.to_string());
        }
        if let Some(v) = env.first_of(&["LLM_API_BASE", "CODESTRAL_API_BASE"]) {
            self.llm.api_base = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = env.first_of(&["LLM_MODEL", "CODESTRAL_MODEL"]) {
            self.llm.model = v.to_string();
        }
        if let Some(v) = env.parse_int::<u32>("MAX_ITERATIONS")? {
            self.cycle.max_iterations = v;
        }
        if let Some(v) = env.parse_int::<u64>("TEST_TIMEOUT_SEC")? {
            self.commands.test_timeout_secs = v;
        }
        if let Some(v) = env.parse_int::<u64>("PIP_TIMEOUT_SEC")? {
            self.commands.install_timeout_secs = v;
        }
        if let Some(v) = env.first_of(&["DEFAULT_TEST_CMD"]) {
            self.commands.test = split_command(v);
        }
        self.secrets = Secrets {
            github_token: env
                .first_of(&["GITHUB_TOKEN", "AGENT_GITHUB_TOKEN"])
                .unwrap_or_default()
                .to_string(),
            llm_api_key: env
                .first_of(&["LLM_API_KEY", "CODESTRAL_API_KEY"])
                .unwrap_or_default()
                .to_string(),
        };
        Ok(())
    }
}

/// Load settings from an optional TOML file and an environment snapshot.
///
/// A missing file means defaults.
pub fn load_settings(path: &Path, env: &EnvVars) -> Result<Settings> {
    let mut settings = if path.exists() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str::<Settings>(&contents)
            .with_context(|| format!("parse {}", path.display()))?
    } else {
        debug!(path = %path.display(), "settings file missing, using defaults");
        Settings::default()
    };
    settings.apply_env(env)?;
    settings.validate()?;
    Ok(settings)
}

/// Snapshot of environment variables, taken once at process start.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct EnvVars {
    vars: BTreeMap<String, String>,
}

impl fmt::Debug for EnvVars {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvVars")
            .field("keys", &self.vars.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EnvVars {
    /// Process environment plus the dotenv file named by `ENV_FILE`
    /// (default `.env`). Real variables win over file entries.
    pub fn capture() -> Result<Self> {
        let mut env = Self::from_pairs(std::env::vars());
        let dotenv = env.get("ENV_FILE").unwrap_or(".env").to_string();
        let dotenv = Path::new(&dotenv);
        if dotenv.is_file() {
            let contents = fs::read_to_string(dotenv)
                .with_context(|| format!("read {}", dotenv.display()))?;
            env.merge_dotenv(&contents);
            debug!(path = %dotenv.display(), "loaded dotenv file");
        }
        Ok(env)
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Add dotenv entries for keys not already present.
    pub fn merge_dotenv(&mut self, contents: &str) {
        for (key, value) in parse_dotenv(contents) {
            self.vars.entry(key).or_insert(value);
        }
    }

    /// Non-empty value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// First non-empty value among `keys`.
    pub fn first_of(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| self.get(key))
    }

    fn parse_int<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| anyhow!("invalid integer for {key}: '{raw}'")),
        }
    }
}

/// `KEY=value` lines; blank lines, comments, and lines without `=` are
/// skipped. Matching surrounding quotes are stripped.
pub fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim(), strip_quotes(value.trim())))
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn strip_quotes(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2
            && let Some(inner) = value
                .strip_prefix(quote)
                .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

/// Whitespace-split command line into an argument vector.
pub fn split_command(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_string).collect()
}

fn is_command(cmd: &[String]) -> bool {
    cmd.first().is_some_and(|program| !program.trim().is_empty())
}
