//! Filesystem access to a repository checkout.
//!
//! Traversal is sorted so the context ranker sees a deterministic order.
//! Paths handed out are relative and `/`-separated.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tempfile::TempDir;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::core::payload::FileEditSet;
use crate::core::ranker::{RankerRules, rank_files};
use crate::core::report::clip;
use crate::io::process::CommandSpec;

const TRUNCATION_MARKER: &str = "\n... [truncated]\n";

/// One file embedded in a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextFile {
    pub path: String,
    pub content: String,
}

/// Everything the fix prompt needs from the checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeContext {
    pub summary: String,
    pub files: Vec<ContextFile>,
}

/// All regular files under `root`, sorted, relative. `.git` is not entered.
pub fn list_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.file_name() != ".git");
    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        files.push(to_slash_path(rel));
    }
    Ok(files)
}

/// Read `rel` lossily, keeping at most `budget` characters.
pub fn read_clipped(root: &Path, rel: &str, budget: usize) -> Result<ContextFile> {
    let path = root.join(rel);
    let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    let text = String::from_utf8_lossy(&bytes);
    let clipped = clip(&text, budget);
    let content = if clipped.len() < text.len() {
        format!("{clipped}{TRUNCATION_MARKER}")
    } else {
        text.into_owned()
    };
    Ok(ContextFile {
        path: rel.to_string(),
        content,
    })
}

/// `Top-level: a, b/, ...` with directories suffixed by `/`. Hidden entries are left out.
pub fn summarize_top_level(root: &Path) -> Result<String> {
    let mut names = Vec::new();
    for entry in fs::read_dir(root).with_context(|| format!("list {}", root.display()))? {
        let entry = entry.with_context(|| format!("list {}", root.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        names.push(if is_dir { format!("{name}/") } else { name });
    }
    names.sort();
    Ok(format!("Top-level: {}", names.join(", ")))
}

/// Rank the checkout against the issue and read the selected files.
pub fn build_code_context(
    root: &Path,
    issue_text: &str,
    rules: &RankerRules,
    file_char_budget: usize,
) -> Result<CodeContext> {
    let paths = list_files(root)?;
    let ranked = rank_files(&paths, issue_text, rules);
    debug!(
        candidates = paths.len(),
        selected = ranked.len(),
        "ranked context files"
    );
    let files = ranked
        .iter()
        .map(|f| read_clipped(root, &f.path, file_char_budget))
        .collect::<Result<Vec<_>>>()?;
    Ok(CodeContext {
        summary: summarize_top_level(root)?,
        files,
    })
}

/// Write every edit under `root`. Returns the paths written, in order.
///
/// Absolute paths and paths that climb out of the checkout are skipped.
pub fn apply_file_edits(root: &Path, edits: &FileEditSet) -> Result<Vec<String>> {
    let mut written = Vec::new();
    for edit in &edits.files {
        let Some(target) = resolve_inside(root, &edit.path) else {
            warn!(path = %edit.path, "refusing edit outside checkout");
            continue;
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
        fs::write(&target, &edit.content)
            .with_context(|| format!("write {}", target.display()))?;
        written.push(edit.path.clone());
    }
    debug!(written = written.len(), "applied file edits");
    Ok(written)
}

fn resolve_inside(root: &Path, rel: &str) -> Option<PathBuf> {
    let rel = Path::new(rel);
    let mut clean = PathBuf::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        return None;
    }
    Some(root.join(clean))
}

/// A `tests/` directory or any `test_*.py` file outside `rules.skip_dirs`.
pub fn has_test_suite(root: &Path, rules: &RankerRules) -> Result<bool> {
    if root.join("tests").is_dir() {
        return Ok(true);
    }
    let found = list_files(root)?.iter().any(|path| {
        let name = path.rsplit('/').next().unwrap_or(path);
        name.starts_with("test_") && name.ends_with(".py") && rules.is_candidate(path)
    });
    Ok(found)
}

/// Installer ladder for the checkout; the first command that succeeds wins.
pub fn detect_install_commands(root: &Path) -> Vec<CommandSpec> {
    let pip = || CommandSpec::new("python").args(["-m", "pip", "install"]);
    if root.join("pyproject.toml").is_file() {
        return vec![
            pip().args(["-e", ".[dev]"]),
            pip().args(["-e", "."]),
            pip().arg("."),
        ];
    }
    ["requirements-dev.txt", "requirements.txt"]
        .into_iter()
        .find(|name| root.join(name).is_file())
        .map(|name| vec![pip().args(["-r", name])])
        .unwrap_or_default()
}

/// `PYTHONPATH` for tests: the checkout, plus `src/` when present.
pub fn python_path(root: &Path) -> String {
    let src = root.join("src");
    if src.is_dir() {
        format!("{}:{}", root.display(), src.display())
    } else {
        root.display().to_string()
    }
}

/// Scoped scratch directory; removed when dropped.
pub fn scratch_dir(prefix: &str) -> Result<TempDir> {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()
        .with_context(|| format!("create scratch dir {prefix}"))
}

fn to_slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::payload::FileEdit;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write");
    }

    /// Verifies traversal is sorted, relative, and never enters `.git`.
    #[test]
    fn lists_files_sorted_without_git_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        write(root, "b.py", "");
        write(root, "a/z.py", "");
        write(root, "a/b.md", "");
        write(root, ".git/config", "");

        let files = list_files(root).expect("list");
        assert_eq!(files, vec!["a/b.md", "a/z.py", "b.py"]);
    }

    #[test]
    fn clips_long_files_with_marker() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "big.py", &"x".repeat(50));
        write(temp.path(), "small.py", "ok");

        let big = read_clipped(temp.path(), "big.py", 10).expect("read");
        assert_eq!(big.content, format!("{}\n... [truncated]\n", "x".repeat(10)));
        let small = read_clipped(temp.path(), "small.py", 10).expect("read");
        assert_eq!(small.content, "ok");
    }

    #[test]
    fn top_level_summary_skips_hidden_entries() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "setup.py", "");
        write(temp.path(), "pkg/__init__.py", "");
        write(temp.path(), ".github/ci.yml", "");

        let summary = summarize_top_level(temp.path()).expect("summary");
        assert_eq!(summary, "Top-level: pkg/, setup.py");
    }

    /// Verifies context building puts package and test files first and reads their content.
    #[test]
    fn builds_context_from_ranked_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        write(root, "README.md", "readme");
        write(root, "tests/test_parse.py", "def test_parse(): pass\n");
        write(root, "widget/parse.py", "def parse(): ...\n");
        write(root, "docs/notes.txt", "notes");

        let rules = RankerRules::default().with_package_of("acme/widget");
        let ctx = build_code_context(root, "parse crashes", &rules, 4000).expect("context");
        let paths: Vec<&str> = ctx.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["tests/test_parse.py", "widget/parse.py", "README.md", "docs/notes.txt"]
        );
        assert_eq!(ctx.files[1].content, "def parse(): ...\n");
        assert_eq!(ctx.summary, "Top-level: README.md, docs/, tests/, widget/");
    }

    #[test]
    fn applies_edits_and_refuses_escapes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("repo");
        fs::create_dir_all(&root).expect("mkdir");
        let edits = FileEditSet {
            files: vec![
                FileEdit {
                    path: "pkg/new.py".to_string(),
                    content: "X = 1\n".to_string(),
                },
                FileEdit {
                    path: "../outside.py".to_string(),
                    content: "bad".to_string(),
                },
                FileEdit {
                    path: "/etc/passwd".to_string(),
                    content: "bad".to_string(),
                },
            ],
            summary: String::new(),
        };

        let written = apply_file_edits(&root, &edits).expect("apply");
        assert_eq!(written, vec!["pkg/new.py"]);
        assert_eq!(fs::read_to_string(root.join("pkg/new.py")).expect("read"), "X = 1\n");
        assert!(!temp.path().join("outside.py").exists());
        assert!(resolve_inside(&root, "a/../../x").is_none());
        assert_eq!(resolve_inside(&root, "./a/b.py"), Some(root.join("a/b.py")));
    }

    #[test]
    fn detects_test_suite_by_dir_or_file_name() {
        let rules = RankerRules::default();
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(!has_test_suite(temp.path(), &rules).expect("check"));
        write(temp.path(), "pkg/test_core.py", "");
        assert!(has_test_suite(temp.path(), &rules).expect("check"));

        let other = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(other.path().join("tests")).expect("mkdir");
        assert!(has_test_suite(other.path(), &rules).expect("check"));
    }

    /// Verifies test files inside vendored or virtualenv dirs do not count as a suite.
    #[test]
    fn vendored_test_files_are_not_a_suite() {
        let rules = RankerRules::default();
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "app.py", "");
        write(temp.path(), "node_modules/x/test_vendor.py", "");
        write(temp.path(), ".venv/lib/test_site.py", "");
        assert!(!has_test_suite(temp.path(), &rules).expect("check"));
    }

    #[test]
    fn install_ladder_prefers_pyproject() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(detect_install_commands(temp.path()).is_empty());

        write(temp.path(), "requirements.txt", "");
        let cmds = detect_install_commands(temp.path());
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].display(), "python -m pip install -r requirements.txt");

        write(temp.path(), "pyproject.toml", "");
        let cmds: Vec<String> = detect_install_commands(temp.path())
            .iter()
            .map(CommandSpec::display)
            .collect();
        assert_eq!(
            cmds,
            vec![
                "python -m pip install -e .[dev]",
                "python -m pip install -e .",
                "python -m pip install .",
            ]
        );
    }

    #[test]
    fn python_path_adds_src_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        assert_eq!(python_path(root), root.display().to_string());
        fs::create_dir_all(root.join("src")).expect("mkdir");
        assert_eq!(
            python_path(root),
            format!("{}:{}", root.display(), root.join("src").display())
        );
    }
}
