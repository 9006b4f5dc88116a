//! Typed views over recovered documents.
//!
//! Coercion never fails: missing or mistyped fields become defaults so one
//! sloppy field does not discard the rest of a model turn.

use serde_json::Value;

use crate::core::output_parser::Document;
use crate::core::types::Verdict;

/// One file the model wants written, with its full new content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEdit {
    pub path: String,
    pub content: String,
}

/// Ordered set of file edits plus the model's summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileEditSet {
    pub files: Vec<FileEdit>,
    pub summary: String,
}

impl FileEditSet {
    pub fn from_document(doc: &Document) -> Self {
        let files = doc
            .get("files")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(file_edit).collect())
            .unwrap_or_default();
        Self {
            files,
            summary: string_field(doc, "summary"),
        }
    }
}

fn file_edit(item: &Value) -> Option<FileEdit> {
    let path = item.get("path")?.as_str()?.trim();
    let content = item.get("content")?.as_str()?;
    if path.is_empty() {
        return None;
    }
    Some(FileEdit {
        path: path.to_string(),
        content: content.to_string(),
    })
}

/// Reviewer decision as reported by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewVerdict {
    Approve,
    ChangesRequested,
}

impl ReviewVerdict {
    pub fn as_verdict(self) -> Verdict {
        match self {
            ReviewVerdict::Approve => Verdict::Approve,
            ReviewVerdict::ChangesRequested => Verdict::ChangesRequested,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.as_verdict().as_str()
    }
}

/// Structured review result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerdictRecord {
    pub verdict: ReviewVerdict,
    pub summary: String,
    pub blocking: Vec<String>,
    pub notes: Vec<String>,
}

impl VerdictRecord {
    /// Anything other than an explicit approval counts as a change request.
    pub fn from_document(doc: &Document) -> Self {
        let verdict = match doc.get("verdict").and_then(Value::as_str) {
            Some(raw) if matches!(raw.trim().to_lowercase().as_str(), "approve" | "approved") => {
                ReviewVerdict::Approve
            }
            _ => ReviewVerdict::ChangesRequested,
        };
        Self {
            verdict,
            summary: string_field(doc, "summary"),
            blocking: string_list(doc, "blocking"),
            notes: string_list(doc, "notes"),
        }
    }
}

fn string_field(doc: &Document, key: &str) -> String {
    match doc.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn string_list(doc: &Document, key: &str) -> Vec<String> {
    let items = match doc.get(key) {
        Some(Value::Array(items)) => items.iter().map(render_item).collect(),
        Some(Value::String(s)) => vec![s.trim().to_string()],
        _ => Vec::new(),
    };
    items.into_iter().filter(|s: &String| !s.is_empty()).collect()
}

fn render_item(item: &Value) -> String {
    match item {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
