//! LLM prompt layer.
//!
//! A thin OpenAI-compatible chat client plus the typed prompt roles the
//! planner invokes. Transport failures retry with exponential backoff;
//! responses that do not match the role's schema are rejected as
//! `llm_malformed_response`.

pub mod prompts;

use crate::error::{Error, ErrorKind, Result};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

/// Maximum attempts for a single chat call (initial + retries).
const MAX_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff between attempts.
const BACKOFF_BASE_MS: u64 = 1_000;

/// Client for an OpenAI-compatible chat completions endpoint
pub struct LlmClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f64,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl LlmClient {
    /// Create a new client. `timeout` bounds a single HTTP round trip.
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        temperature: f64,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::new(ErrorKind::LlmUnreachable, format!("http client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            temperature,
        })
    }

    /// Send a chat completion and return the raw assistant text.
    ///
    /// Transport errors and timeouts retry up to [`MAX_ATTEMPTS`] with
    /// exponential backoff; HTTP error statuses do not retry.
    pub async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let mut last_err = None;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.chat_once(system, user).await {
                Ok(text) => return Ok(text),
                Err(e) if e.kind.is_retryable() && attempt < MAX_ATTEMPTS => {
                    let delay = Duration::from_millis(BACKOFF_BASE_MS * (1 << (attempt - 1)));
                    tracing::warn!(
                        "LLM call failed (attempt {}/{}), retrying in {:?}: {}",
                        attempt,
                        MAX_ATTEMPTS,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::new(ErrorKind::LlmUnreachable, "retries exhausted")))
    }

    async fn chat_once(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);

        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() {
                    ErrorKind::Timeout
                } else {
                    ErrorKind::LlmUnreachable
                };
                Error::new(kind, format!("chat request failed: {e}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::new(
                ErrorKind::LlmUnreachable,
                format!("LLM API error: {status} - {body}"),
            ));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            Error::new(
                ErrorKind::LlmMalformedResponse,
                format!("failed to parse chat response: {e}"),
            )
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::new(ErrorKind::LlmMalformedResponse, "empty choices array"))
    }

    /// Send a chat completion and deserialize the assistant text as JSON.
    ///
    /// The model may wrap JSON in a fenced code block or prose; extraction
    /// tries the raw text, then the first fenced block, then the outermost
    /// brace span.
    pub async fn chat_json<T: DeserializeOwned>(&self, system: &str, user: &str) -> Result<T> {
        let text = self.chat(system, user).await?;
        let json_text = extract_json(&text).ok_or_else(|| {
            Error::new(
                ErrorKind::LlmMalformedResponse,
                format!("no JSON object found in response: {}", truncate(&text, 200)),
            )
        })?;

        serde_json::from_str(json_text).map_err(|e| {
            Error::new(
                ErrorKind::LlmMalformedResponse,
                format!("schema mismatch: {e} in {}", truncate(json_text, 200)),
            )
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Locate a JSON object inside possibly-noisy model output.
fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed);
    }

    // Fenced code block, with or without a language tag
    if let Some(fence_start) = trimmed.find("```") {
        let after_fence = &trimmed[fence_start + 3..];
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_fence[body_start..];
        if let Some(fence_end) = body.find("```") {
            let candidate = body[..fence_end].trim();
            if candidate.starts_with('{') && candidate.ends_with('}') {
                return Some(candidate);
            }
        }
    }

    // Outermost brace span
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end > start {
        Some(trimmed[start..=end].trim())
    } else {
        None
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_plain() {
        let text = r#"{"mutants": []}"#;
        assert_eq!(extract_json(text), Some(r#"{"mutants": []}"#));
    }

    #[test]
    fn test_extract_json_fenced() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nDone.";
        assert_eq!(extract_json(text), Some("{\"a\": 1}"));
    }

    #[test]
    fn test_extract_json_fenced_no_lang() {
        let text = "```\n{\"a\": 1}\n```";
        assert_eq!(extract_json(text), Some("{\"a\": 1}"));
    }

    #[test]
    fn test_extract_json_embedded_in_prose() {
        let text = "The result is {\"a\": {\"b\": 2}} as requested.";
        assert_eq!(extract_json(text), Some("{\"a\": {\"b\": 2}}"));
    }

    #[test]
    fn test_extract_json_none() {
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json(""), None);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("ab", 10), "ab");
    }
}
