//! Prompt rendering for the fix, review, and test-synthesis model calls.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::report::clip;
use crate::io::hosting::PullFile;
use crate::io::repo_files::ContextFile;

pub const CODE_SYSTEM_PROMPT: &str = include_str!("prompts/code_patch.md");
pub const REVIEW_SYSTEM_PROMPT: &str = include_str!("prompts/review.md");
pub const TESTS_SYSTEM_PROMPT: &str = include_str!("prompts/generate_tests.md");

const CODE_CONTEXT_TEMPLATE: &str = include_str!("prompts/code_context.md");
const REVIEW_CONTEXT_TEMPLATE: &str = include_str!("prompts/review_context.md");
const TEST_CONTEXT_TEMPLATE: &str = include_str!("prompts/test_context.md");

/// Diff characters shown to the reviewer.
const REVIEW_DIFF_CHARS: usize = 10_000;
/// Diff characters shown when synthesizing tests.
const TEST_DIFF_CHARS: usize = 8_000;

#[derive(Debug, Clone, Serialize)]
struct FileLine<'a> {
    path: &'a str,
    status: &'a str,
    additions: u64,
    deletions: u64,
}

/// Inputs for the review context.
#[derive(Debug, Clone, Copy)]
pub struct ReviewInputs<'a> {
    pub issue: &'a str,
    pub diff: &'a str,
    pub files: &'a [PullFile],
    /// Pre-rendered quality command results.
    pub checks: &'a [String],
    /// Pre-rendered test result or note.
    pub tests: &'a str,
    pub generated: &'a [String],
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("code_context", CODE_CONTEXT_TEMPLATE)
            .context("load code context template")?;
        env.add_template("review_context", REVIEW_CONTEXT_TEMPLATE)
            .context("load review context template")?;
        env.add_template("test_context", TEST_CONTEXT_TEMPLATE)
            .context("load test context template")?;
        Ok(Self { env })
    }

    /// Issue text, repository summary, and the selected files.
    pub fn render_code_context(
        &self,
        issue: &str,
        summary: &str,
        files: &[ContextFile],
    ) -> Result<String> {
        let rendered = self
            .env
            .get_template("code_context")?
            .render(context! {
                issue => issue.trim(),
                summary => summary,
                files => files,
            })
            .context("render code context")?;
        debug!(chars = rendered.len(), files = files.len(), "rendered code context");
        Ok(rendered)
    }

    pub fn render_review_context(&self, inputs: &ReviewInputs<'_>) -> Result<String> {
        let files: Vec<FileLine<'_>> = inputs
            .files
            .iter()
            .map(|f| FileLine {
                path: &f.path,
                status: &f.status,
                additions: f.additions,
                deletions: f.deletions,
            })
            .collect();
        let rendered = self
            .env
            .get_template("review_context")?
            .render(context! {
                issue => inputs.issue.trim(),
                diff => clip(inputs.diff, REVIEW_DIFF_CHARS),
                files => files,
                checks => inputs.checks,
                tests => inputs.tests,
                generated => inputs.generated,
            })
            .context("render review context")?;
        Ok(rendered)
    }

    pub fn render_test_context(&self, issue: &str, diff: &str, files: &[PullFile]) -> Result<String> {
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        let rendered = self
            .env
            .get_template("test_context")?
            .render(context! {
                issue => issue.trim(),
                diff => clip(diff, TEST_DIFF_CHARS),
                files => paths,
            })
            .context("render test context")?;
        Ok(rendered)
    }
}
