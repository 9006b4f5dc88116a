//! Recovers a JSON object from free-form model output.
//!
//! Model replies often *almost* contain valid JSON: wrapped in a markdown
//! fence, surrounded by prose, with trailing commas, or with raw newlines
//! inside string values. Each candidate extraction is tried strictly and then
//! after a repair pass; the first candidate that yields an object wins.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// Generic ordered key-value document recovered from a reply.
pub type Document = Map<String, Value>;

/// Characters of the original reply kept in a defect for diagnostics.
const EXCERPT_CHARS: usize = 200;

/// A model turn whose output could not be turned into a document.
///
/// Not retried within the same invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutputDefect {
    #[error("model returned an empty response")]
    Empty,
    #[error("no valid JSON object found in model response: {excerpt}")]
    Unrecoverable { excerpt: String },
}

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_+.-]*[ \t]*\r?\n?(.*?)```").expect("valid fence regex")
});

/// Parse `raw` into a document using the fallback ladder.
pub fn parse_document(raw: &str) -> Result<Document, OutputDefect> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(OutputDefect::Empty);
    }

    let mut candidates: Vec<&str> = vec![text];
    if let Some(fenced) = extract_fenced(text) {
        candidates.push(fenced);
    }
    if let Some(balanced) = extract_balanced_object(text) {
        candidates.push(balanced);
    }

    for (idx, candidate) in candidates.iter().enumerate() {
        if let Some(doc) = parse_object(candidate) {
            debug!(candidate = idx, repaired = false, "recovered document");
            return Ok(doc);
        }
        if let Some(doc) = parse_object(&repair(candidate)) {
            debug!(candidate = idx, repaired = true, "recovered document");
            return Ok(doc);
        }
    }

    Err(OutputDefect::Unrecoverable {
        excerpt: excerpt(text),
    })
}

fn parse_object(candidate: &str) -> Option<Document> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Contents of the first fenced block, with any language tag dropped.
fn extract_fenced(text: &str) -> Option<&str> {
    if !text.contains("```") {
        return None;
    }
    let inner = FENCE_RE.captures(text)?.get(1)?.as_str().trim();
    (!inner.is_empty()).then_some(inner)
}

/// Tracks whether a scan position is inside a JSON string literal.
#[derive(Default)]
struct StringScanner {
    in_string: bool,
    escaped: bool,
}

impl StringScanner {
    /// Feed one character; returns true if it belongs to a string literal
    /// (including its delimiting quotes).
    fn step(&mut self, ch: char) -> bool {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if ch == '\\' {
                self.escaped = true;
            } else if ch == '"' {
                self.in_string = false;
            }
            return true;
        }
        if ch == '"' {
            self.in_string = true;
            return true;
        }
        false
    }
}

/// First top-level balanced `{...}` span; braces inside strings are ignored.
fn extract_balanced_object(text: &str) -> Option<&str> {
    let mut scanner = StringScanner::default();
    let mut depth = 0usize;
    let mut start = None;
    for (idx, ch) in text.char_indices() {
        if scanner.step(ch) {
            continue;
        }
        match ch {
            '{' => {
                if depth == 0 {
                    start = Some(idx);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0
                    && let Some(begin) = start
                {
                    return Some(&text[begin..=idx]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Drop trailing commas before `}`/`]` and escape raw control whitespace
/// inside string literals. Text outside strings is otherwise untouched.
fn repair(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    let mut scanner = StringScanner::default();
    for (idx, &ch) in chars.iter().enumerate() {
        let was_in_string = scanner.in_string;
        if scanner.step(ch) {
            if was_in_string {
                match ch {
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    '\t' => out.push_str("\\t"),
                    _ => out.push(ch),
                }
            } else {
                out.push(ch);
            }
            continue;
        }
        if ch == ',' && closes_after_whitespace(&chars[idx + 1..]) {
            continue;
        }
        out.push(ch);
    }
    out
}

fn closes_after_whitespace(rest: &[char]) -> bool {
    rest.iter()
        .find(|c| !c.is_whitespace())
        .is_some_and(|c| *c == '}' || *c == ']')
}

fn excerpt(text: &str) -> String {
    let mut clipped: String = text.chars().take(EXCERPT_CHARS).collect();
    if text.chars().count() > EXCERPT_CHARS {
        clipped.push_str("...");
    }
    clipped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(doc: &Document) -> Option<&str> {
        doc.get("summary").and_then(Value::as_str)
    }

    #[test]
    fn parses_clean_json() {
        let doc = parse_document(r#"{"summary":"ok","files":[]}"#).expect("parse");
        assert_eq!(summary(&doc), Some("ok"));
        assert_eq!(doc.get("files"), Some(&Value::Array(Vec::new())));
    }

    #[test]
    fn parses_fenced_json_with_language_tag() {
        let doc = parse_document("Here you go:\n```json\n{\"summary\":\"x\"}\n```").expect("parse");
        assert_eq!(summary(&doc), Some("x"));
        assert_eq!(doc.len(), 1);
    }

    #[test]
    fn parses_fenced_json_without_tag() {
        let doc = parse_document("```\n{\"summary\":\"plain\"}\n```\nthanks").expect("parse");
        assert_eq!(summary(&doc), Some("plain"));
    }

    #[test]
    fn parses_object_surrounded_by_prose() {
        let raw = "Sure! The fix is below.\n{\"summary\":\"wrapped\",\"note\":\"a } in text\"}\nLet me know.";
        let doc = parse_document(raw).expect("parse");
        assert_eq!(summary(&doc), Some("wrapped"));
        assert_eq!(doc.get("note").and_then(Value::as_str), Some("a } in text"));
    }

    #[test]
    fn repairs_trailing_comma_and_raw_newline() {
        let doc = parse_document("{\"content\":\"line1\nline2\",}").expect("parse");
        assert_eq!(
            doc.get("content").and_then(Value::as_str),
            Some("line1\nline2")
        );
    }

    #[test]
    fn repairs_nested_trailing_commas() {
        let raw = "{\"files\":[{\"path\":\"a.py\",\"content\":\"x = 1\n\",},],\"summary\":\"s\",\n}";
        let doc = parse_document(raw).expect("parse");
        let files = doc.get("files").and_then(Value::as_array).expect("files");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0]["content"], "x = 1\n");
    }

    #[test]
    fn commas_inside_strings_are_preserved() {
        let doc = parse_document("{\"summary\":\"a, }\",\"tab\":\"x\ty\",}").expect("parse");
        assert_eq!(summary(&doc), Some("a, }"));
        assert_eq!(doc.get("tab").and_then(Value::as_str), Some("x\ty"));
    }

    #[test]
    fn escaped_quotes_do_not_confuse_scanner() {
        let raw = "prefix {\"summary\":\"say \\\"hi\\\" {\",\"n\":1} suffix";
        let doc = parse_document(raw).expect("parse");
        assert_eq!(summary(&doc), Some("say \"hi\" {"));
    }

    #[test]
    fn arrays_are_not_documents() {
        assert!(matches!(
            parse_document("[1, 2, 3]"),
            Err(OutputDefect::Unrecoverable { .. })
        ));
    }

    #[test]
    fn rejects_text_without_json() {
        let err = parse_document("not json at all").expect_err("defect");
        assert_eq!(
            err,
            OutputDefect::Unrecoverable {
                excerpt: "not json at all".to_string()
            }
        );
    }

    #[test]
    fn rejects_empty_output() {
        assert_eq!(parse_document("   \n"), Err(OutputDefect::Empty));
    }

    #[test]
    fn excerpt_is_truncated() {
        let raw = "x".repeat(500);
        let Err(OutputDefect::Unrecoverable { excerpt }) = parse_document(&raw) else {
            panic!("expected defect");
        };
        assert_eq!(excerpt.len(), EXCERPT_CHARS + 3);
    }
}
