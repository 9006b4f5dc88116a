//! Embeds an [`IterationState`] in free-form text (a comment body) and
//! recovers it later.
//!
//! The blob is a single line: an HTML comment carrying a fixed marker followed
//! by compact JSON, so rendered markdown hides it from readers.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::core::types::{IterationState, Verdict};

/// Opening of every state blob; locates the state comment among others.
pub const STATE_MARKER: &str = "<!-- FIXLOOP_STATE:";

static STATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<!--\s*FIXLOOP_STATE:\s*(\{.*?\})\s*-->").expect("valid state regex")
});

/// Render `state` as `<!-- FIXLOOP_STATE: {...} -->`.
pub fn encode(state: &IterationState) -> String {
    // Serializing a plain struct of strings and integers cannot fail.
    let payload = serde_json::to_string(state).unwrap_or_else(|_| "{}".to_string());
    // Angle brackets only occur inside JSON strings, where the escaped forms are
    // equivalent; this keeps a value from terminating the comment early.
    let payload = payload.replace('<', "\\u003c").replace('>', "\\u003e");
    format!("{STATE_MARKER} {payload} -->")
}

/// Find and parse the first state blob in `text`.
///
/// Returns `None` when no marker is present or the payload is not a JSON
/// object. Missing or mistyped fields fall back to defaults so that a damaged
/// comment degrades instead of wedging the cycle.
pub fn decode(text: &str, default_max_iterations: u32) -> Option<IterationState> {
    let caps = STATE_RE.captures(text)?;
    let payload = caps.get(1)?.as_str();
    let value: Value = serde_json::from_str(payload).ok()?;
    let Value::Object(fields) = value else {
        return None;
    };
    Some(state_from_fields(&fields, default_max_iterations))
}

fn state_from_fields(fields: &Map<String, Value>, default_max_iterations: u32) -> IterationState {
    let max_iterations = read_u32(fields, "max_iterations")
        .filter(|max| *max > 0)
        .unwrap_or(default_max_iterations);
    let last_verdict = fields
        .get("last_verdict")
        .and_then(Value::as_str)
        .map(Verdict::parse_lenient)
        .unwrap_or(Verdict::Unknown);
    IterationState {
        target_repo: read_string(fields, "target_repo"),
        source_reference: read_string(fields, "source_issue_url"),
        iteration: read_u32(fields, "iteration").unwrap_or(0),
        max_iterations,
        last_verdict,
        created_at: read_string(fields, "created_at"),
    }
}

fn read_string(fields: &Map<String, Value>, key: &str) -> String {
    match fields.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn read_u32(fields: &Map<String, Value>, key: &str) -> Option<u32> {
    match fields.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> IterationState {
        IterationState {
            target_repo: "acme/widgets".to_string(),
            source_reference: "https://github.com/acme/agent/issues/7".to_string(),
            iteration: 2,
            max_iterations: 5,
            last_verdict: Verdict::ChangesRequested,
            created_at: "2026-10-18T09:30:00+00:00".to_string(),
        }
    }

    #[test]
    fn round_trips_every_verdict() {
        for verdict in [
            Verdict::Pending,
            Verdict::InProgress,
            Verdict::PendingReview,
            Verdict::Approve,
            Verdict::ChangesRequested,
            Verdict::Unknown,
        ] {
            let state = sample().with_verdict(verdict);
            assert_eq!(decode(&encode(&state), 9), Some(state));
        }
    }

    #[test]
    fn encoding_is_single_line_with_stable_key_order() {
        let blob = encode(&sample());
        assert!(!blob.contains('\n'));
        assert_eq!(
            blob,
            "<!-- FIXLOOP_STATE: {\"target_repo\":\"acme/widgets\",\
             \"source_issue_url\":\"https://github.com/acme/agent/issues/7\",\
             \"iteration\":2,\"max_iterations\":5,\"last_verdict\":\"changes_requested\",\
             \"created_at\":\"2026-10-18T09:30:00+00:00\"} -->"
        );
    }

    #[test]
    fn values_cannot_close_the_comment() {
        let mut state = sample();
        state.target_repo = "weird --> name }".to_string();
        let blob = encode(&state);
        assert_eq!(blob.matches("-->").count(), 1);
        assert_eq!(decode(&blob, 5), Some(state));
    }

    #[test]
    fn finds_blob_inside_multiline_prose() {
        let state = sample();
        let text = format!(
            "Status update\n\nSome text with {{braces}}.\n{}\n\nMore prose.\n",
            encode(&state)
        );
        assert_eq!(decode(&text, 5), Some(state));
    }

    #[test]
    fn absent_marker_returns_none() {
        assert_eq!(decode("", 5), None);
        assert_eq!(decode("no state here {\"iteration\": 1}", 5), None);
        assert_eq!(decode("<!-- OTHER_STATE: {} -->", 5), None);
    }

    #[test]
    fn broken_payload_returns_none() {
        assert_eq!(decode("<!-- FIXLOOP_STATE: {\"iteration\": } -->", 5), None);
        assert_eq!(decode("<!-- FIXLOOP_STATE: {\"iteration\": 1", 5), None);
        assert_eq!(decode("<!-- FIXLOOP_STATE: {oops} -->", 5), None);
    }

    #[test]
    fn partial_payload_uses_defaults() {
        let state = decode("<!-- FIXLOOP_STATE: {\"target_repo\":\"a/b\"} -->", 7)
            .expect("state");
        assert_eq!(state.target_repo, "a/b");
        assert_eq!(state.source_reference, "");
        assert_eq!(state.iteration, 0);
        assert_eq!(state.max_iterations, 7);
        assert_eq!(state.last_verdict, Verdict::Unknown);
        assert_eq!(state.created_at, "");
    }

    #[test]
    fn mistyped_fields_degrade() {
        let state = decode(
            "<!-- FIXLOOP_STATE: {\"iteration\":\"3\",\"max_iterations\":-1,\"last_verdict\":42} -->",
            4,
        )
        .expect("state");
        assert_eq!(state.iteration, 3);
        assert_eq!(state.max_iterations, 4);
        assert_eq!(state.last_verdict, Verdict::Unknown);
    }
}
