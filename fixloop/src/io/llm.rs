//! Language model client.
//!
//! The orchestration only needs one call: system prompt plus user context in,
//! raw text out. Transient failures are retried here; callers see either the
//! final text or a terminal error.

use std::io::ErrorKind;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};
use ureq::Agent;

use crate::io::config::{LlmSettings, Secrets};

/// One chat completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// A chat-style model that turns a prompt into raw text.
pub trait LanguageModel {
    fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// Client for OpenAI-compatible `/chat/completions` endpoints.
pub struct ChatCompletionsClient {
    agent: Agent,
    url: String,
    api_key: String,
    model: String,
    retries: u32,
    backoff: Duration,
}

/// Outcome of one HTTP attempt.
enum Attempt {
    Done(String),
    Retry(String),
    Fail(anyhow::Error),
}

impl ChatCompletionsClient {
    pub fn new(settings: &LlmSettings, secrets: &Secrets) -> Self {
        let config = Agent::config_builder()
            .timeout_global(Some(settings.timeout()))
            .http_status_as_error(false)
            .build();
        Self {
            agent: Agent::new_with_config(config),
            url: format!("{}/chat/completions", settings.api_base.trim_end_matches('/')),
            api_key: secrets.llm_api_key.clone(),
            model: settings.model.clone(),
            retries: settings.retries,
            backoff: Duration::from_secs(1),
        }
    }

    fn attempt(&self, body: &Value) -> Attempt {
        let result = self
            .agent
            .post(&self.url)
            .header("Authorization", &format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .send_json(body);
        let mut resp = match result {
            Ok(resp) => resp,
            Err(e) if is_retryable_transport(&e) => return Attempt::Retry(e.to_string()),
            Err(e) => return Attempt::Fail(anyhow!(e).context("send chat completion")),
        };
        let status = resp.status().as_u16();
        let text = match resp.body_mut().read_to_string() {
            Ok(text) => text,
            Err(e) if is_retryable_transport(&e) => return Attempt::Retry(e.to_string()),
            Err(e) => return Attempt::Fail(anyhow!(e).context("read chat completion")),
        };
        if should_retry_status(status) {
            return Attempt::Retry(format!("HTTP {status}"));
        }
        if !(200..300).contains(&status) {
            let excerpt: String = text.chars().take(500).collect();
            return Attempt::Fail(anyhow!("LLM HTTP {status}: {excerpt}"));
        }
        match extract_content(&text) {
            Ok(content) => Attempt::Done(content),
            Err(e) => Attempt::Fail(e),
        }
    }
}

impl LanguageModel for ChatCompletionsClient {
    #[instrument(skip_all, fields(model = %self.model, max_tokens = request.max_tokens))]
    fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user },
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        let mut last = String::new();
        for attempt in 0..=self.retries {
            match self.attempt(&body) {
                Attempt::Done(content) => {
                    debug!(attempt, chars = content.len(), "completion received");
                    return Ok(content);
                }
                Attempt::Fail(err) => return Err(err),
                Attempt::Retry(reason) => {
                    last = reason;
                    if attempt < self.retries {
                        let delay = self.backoff * (attempt + 1);
                        warn!(attempt, reason = %last, ?delay, "transient LLM failure, retrying");
                        thread::sleep(delay);
                    }
                }
            }
        }
        Err(anyhow!(
            "LLM request failed after {} attempts: {last}",
            self.retries + 1
        ))
    }
}

/// `choices[0].message.content`, as a string or a list of text parts.
fn extract_content(text: &str) -> Result<String> {
    let data: Value = serde_json::from_str(text).context("decode chat completion")?;
    let content = data
        .pointer("/choices/0/message/content")
        .ok_or_else(|| anyhow!("chat completion has no choices[0].message.content"))?;
    match content {
        Value::String(s) => Ok(s.clone()),
        Value::Null => Ok(String::new()),
        Value::Array(parts) => Ok(parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("")),
        other => Err(anyhow!("unexpected content type in chat completion: {other}")),
    }
}

fn should_retry_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Timeouts and dropped connections are worth another try; refused
/// connections, DNS and TLS failures are not.
fn is_retryable_transport(error: &ureq::Error) -> bool {
    let mut source: Option<&dyn std::error::Error> = Some(error);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                ErrorKind::TimedOut | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
            );
        }
        source = err.source();
    }
    let lower = error.to_string().to_lowercase();
    lower.contains("timeout") || lower.contains("timed out")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_string_content() {
        let text = r#"{"choices":[{"message":{"role":"assistant","content":"{\"a\":1}"}}]}"#;
        assert_eq!(extract_content(text).expect("content"), "{\"a\":1}");
    }

    #[test]
    fn extracts_part_list_content() {
        let text = r#"{"choices":[{"message":{"content":[{"type":"text","text":"he"},{"type":"text","text":"llo"}]}}]}"#;
        assert_eq!(extract_content(text).expect("content"), "hello");
    }

    #[test]
    fn null_content_is_empty() {
        let text = r#"{"choices":[{"message":{"content":null}}]}"#;
        assert_eq!(extract_content(text).expect("content"), "");
    }

    #[test]
    fn missing_choices_is_an_error() {
        assert!(extract_content(r#"{"error":"x"}"#).is_err());
        assert!(extract_content("<html>").is_err());
    }

    #[test]
    fn retries_rate_limits_and_server_errors_only() {
        assert!(should_retry_status(429));
        assert!(should_retry_status(503));
        assert!(!should_retry_status(400));
        assert!(!should_retry_status(401));
        assert!(!should_retry_status(200));
    }

    #[test]
    fn builds_endpoint_from_base() {
        let settings = LlmSettings {
            api_base: "https://llm.example/v1/".to_string(),
            ..LlmSettings::default()
        };
        let client = ChatCompletionsClient::new(&settings, &Secrets::default());
        assert_eq!(client.url, "https://llm.example/v1/chat/completions");
        assert_eq!(client.retries, 2);
    }
}
