//! Deterministic context file ranking.
//!
//! Operates on relative `/`-separated paths in traversal order. Reading file
//! contents and clipping them lives in `io::repo_files`.

use std::collections::HashSet;

use crate::core::refs;

/// Upper bound on files embedded in one prompt.
pub const MAX_CONTEXT_FILES: usize = 12;

const DEFAULT_SKIP_DIRS: &[&str] = &[
    ".git",
    ".venv",
    "venv",
    "__pycache__",
    "node_modules",
    ".tox",
    ".mypy_cache",
    ".pytest_cache",
    ".ruff_cache",
    ".eggs",
    "build",
    "dist",
    "target",
];

/// Filtering and scoring rules for one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankerRules {
    /// Extensions (without dot) eligible for context at all.
    pub text_extensions: Vec<String>,
    /// Extensions treated as source code.
    pub source_extensions: Vec<String>,
    /// Directory names excluded by exact path-segment match.
    pub skip_dirs: Vec<String>,
    /// Path prefixes whose source files are always included.
    pub mandatory_dirs: Vec<String>,
    pub max_files: usize,
}

impl Default for RankerRules {
    fn default() -> Self {
        Self {
            text_extensions: to_strings(&["py", "md", "txt"]),
            source_extensions: to_strings(&["py"]),
            skip_dirs: to_strings(DEFAULT_SKIP_DIRS),
            mandatory_dirs: to_strings(&["tests"]),
            max_files: MAX_CONTEXT_FILES,
        }
    }
}

impl RankerRules {
    /// Add the primary package (`<pkg>` and `src/<pkg>`) derived from a
    /// repository name, e.g. `python-utils` -> `python_utils`.
    pub fn with_package_of(mut self, repo_name: &str) -> Self {
        let package = package_name(repo_name);
        if package.is_empty() {
            return self;
        }
        for dir in [package.clone(), format!("src/{package}")] {
            if !self.mandatory_dirs.contains(&dir) {
                self.mandatory_dirs.push(dir);
            }
        }
        self
    }

    /// True if `path` is eligible for the prompt context.
    pub fn is_candidate(&self, path: &str) -> bool {
        if path.split('/').any(|seg| self.skip_dirs.iter().any(|d| d == seg)) {
            return false;
        }
        extension(path).is_some_and(|ext| self.text_extensions.iter().any(|e| e == ext))
    }

    fn is_source(&self, path: &str) -> bool {
        extension(path).is_some_and(|ext| self.source_extensions.iter().any(|e| e == ext))
    }

    fn is_mandatory(&self, path: &str) -> bool {
        self.is_source(path)
            && self
                .mandatory_dirs
                .iter()
                .any(|dir| is_under(path, dir.trim_end_matches('/')))
    }
}

/// A candidate path with its relevance score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedFile {
    pub path: String,
    pub score: u32,
}

/// Select context files: mandatory ones first in traversal order, then the
/// rest by descending score (stable), capped at `rules.max_files`.
pub fn rank_files(paths: &[String], issue_text: &str, rules: &RankerRules) -> Vec<RankedFile> {
    let tokens = issue_tokens(issue_text);
    let candidates: Vec<RankedFile> = paths
        .iter()
        .filter(|p| rules.is_candidate(p))
        .map(|p| RankedFile {
            path: p.clone(),
            score: score_path(p, &tokens, rules),
        })
        .collect();

    let mut ranked = candidates.clone();
    ranked.sort_by(|a, b| b.score.cmp(&a.score));

    let mandatory = candidates.into_iter().filter(|f| rules.is_mandatory(&f.path));
    let mut seen = HashSet::new();
    mandatory
        .chain(ranked)
        .filter(|f| seen.insert(f.path.clone()))
        .take(rules.max_files)
        .collect()
}

/// Distinct lowercase tokens of at least three characters, in first-seen order.
pub fn issue_tokens(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let mut seen = HashSet::new();
    lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3)
        .filter(|t| seen.insert(*t))
        .map(str::to_string)
        .collect()
}

pub fn score_path(path: &str, tokens: &[String], rules: &RankerRules) -> u32 {
    let lowered = path.to_lowercase();
    let mut score = 0;
    if path.starts_with("tests/") {
        score += 5;
    }
    if path.starts_with("src/") || path.contains("/src/") {
        score += 3;
    }
    for token in tokens {
        if lowered.contains(token.as_str()) {
            score += 3;
        }
    }
    if rules.is_source(path) {
        score += 2;
    }
    if lowered == "readme.md" {
        score += 1;
    }
    score
}

/// Repository name to importable package name.
pub fn package_name(repo: &str) -> String {
    refs::repo_name(repo).trim().replace('-', "_")
}

fn extension(path: &str) -> Option<&str> {
    let file = path.rsplit('/').next()?;
    let (stem, ext) = file.rsplit_once('.')?;
    (!stem.is_empty()).then_some(ext)
}

fn is_under(path: &str, dir: &str) -> bool {
    path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}
