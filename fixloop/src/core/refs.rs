//! Parsing of repository and issue references found in issue text and state.

use std::sync::LazyLock;

use regex::Regex;

static TARGET_REPO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^\s*(?:Target repo|Целевой репозиторий)\s*:\s*([A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+)\s*$",
    )
    .expect("valid target repo regex")
});

/// Repository named by a `Target repo: owner/name` line, if any.
pub fn parse_target_repo(body: &str) -> Option<String> {
    TARGET_REPO_RE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Issue location recovered from an issue URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRef {
    pub repo: String,
    pub number: u64,
}

/// Parse `https://host/owner/name/issues/N` (API URLs of the form
/// `.../repos/owner/name/issues/N` work too).
pub fn parse_issue_url(url: &str) -> Option<IssueRef> {
    let parts: Vec<&str> = url.trim().trim_end_matches('/').split('/').collect();
    if parts.len() < 4 {
        return None;
    }
    let n = parts.len();
    let number = parts[n - 1].parse().ok()?;
    let (owner, name) = (parts[n - 4], parts[n - 3]);
    if owner.is_empty() || name.is_empty() || !is_repo_slug(&format!("{owner}/{name}")) {
        return None;
    }
    Some(IssueRef {
        repo: format!("{owner}/{name}"),
        number,
    })
}

/// True for `owner/name` with no empty or path-like parts.
pub fn is_repo_slug(value: &str) -> bool {
    let mut parts = value.split('/');
    let (Some(owner), Some(name), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    [owner, name].iter().all(|part| {
        !part.is_empty()
            && *part != "."
            && *part != ".."
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    })
}

/// Last path segment of `owner/name`.
pub fn repo_name(slug: &str) -> &str {
    slug.rsplit('/').next().unwrap_or(slug)
}
