//! Minimal Anthropic Messages client behind the [`LlmClient`] trait.
//!
//! One system prompt, one user turn, text back. Calls are instrumented with
//! model names, latencies and response sizes (never contents or keys).

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::config::LlmConfig;
use crate::error::LlmError;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// A single-turn completion request.
#[derive(Clone, Debug)]
pub struct Completion {
  pub model: String,
  pub system: String,
  pub user: String,
  pub max_tokens: u32,
  pub temperature: f32,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
  /// Text of the first text block of the reply.
  async fn complete(&self, req: &Completion) -> Result<String, LlmError>;
}

/// Stand-in used when no API key is configured.
pub struct DisabledLlm;

#[async_trait]
impl LlmClient for DisabledLlm {
  async fn complete(&self, _req: &Completion) -> Result<String, LlmError> {
    Err(LlmError::Disabled)
  }
}

/// Client for the configured key, or [`DisabledLlm`].
pub fn build_client(cfg: &LlmConfig) -> Arc<dyn LlmClient> {
  match &cfg.api_key {
    Some(key) => match AnthropicClient::new(key.clone(), cfg.base_url.clone()) {
      Ok(client) => {
        info!(target: "aictutor_backend", base_url = %cfg.base_url, variant_model = %cfg.variant_model, tutor_model = %cfg.tutor_model, "LLM enabled.");
        Arc::new(client)
      }
      Err(e) => {
        error!(target: "aictutor_backend", error = %e, "failed to build HTTP client; LLM disabled");
        Arc::new(DisabledLlm)
      }
    },
    None => {
      info!(target: "aictutor_backend", "LLM disabled (no ANTHROPIC_API_KEY).");
      Arc::new(DisabledLlm)
    }
  }
}

#[derive(Clone)]
pub struct AnthropicClient {
  client: reqwest::Client,
  api_key: String,
  base_url: String,
}

impl AnthropicClient {
  pub fn new(api_key: String, base_url: String) -> Result<Self, LlmError> {
    let client = reqwest::Client::builder().timeout(Duration::from_secs(60)).build()?;
    Ok(Self { client, api_key, base_url: base_url.trim_end_matches('/').to_string() })
  }
}

#[async_trait]
impl LlmClient for AnthropicClient {
  #[instrument(level = "info", skip(self, req), fields(model = %req.model, user_len = req.user.len()))]
  async fn complete(&self, req: &Completion) -> Result<String, LlmError> {
    let url = format!("{}/messages", self.base_url);
    let body = MessagesRequest {
      model: &req.model,
      max_tokens: req.max_tokens,
      temperature: req.temperature,
      system: &req.system,
      messages: vec![MessageReq { role: "user", content: &req.user }],
    };

    let start = std::time::Instant::now();
    let res = self
      .client
      .post(&url)
      .header(USER_AGENT, "aictutor-backend/0.1")
      .header(CONTENT_TYPE, "application/json")
      .header("x-api-key", &self.api_key)
      .header("anthropic-version", ANTHROPIC_VERSION)
      .json(&body)
      .send()
      .await?;

    if !res.status().is_success() {
      let status = res.status();
      let body = res.text().await.unwrap_or_default();
      let message = extract_api_error(&body).unwrap_or(body);
      error!(%status, elapsed = ?start.elapsed(), "LLM call failed");
      return Err(LlmError::Http { status: status.as_u16(), message });
    }

    let body: MessagesResponse = res.json().await.map_err(|e| LlmError::Parse(e.to_string()))?;
    if let Some(usage) = &body.usage {
      info!(input_tokens = ?usage.input_tokens, output_tokens = ?usage.output_tokens, elapsed = ?start.elapsed(), "LLM usage");
    }
    body
      .content
      .into_iter()
      .find(|b| b.kind == "text")
      .and_then(|b| b.text)
      .ok_or_else(|| LlmError::Parse("no text block in response".into()))
  }
}

/// Strip a surrounding Markdown code fence (```json or bare ```), if any.
pub fn strip_code_fence(text: &str) -> &str {
  let t = text.trim();
  let Some(start) = t.find("```") else { return t };
  let after = &t[start + 3..];
  let after = after.strip_prefix("json").unwrap_or(after);
  match after.find("```") {
    Some(end) => after[..end].trim(),
    None => t,
  }
}

// --- Messages API DTOs ---

#[derive(Serialize)]
struct MessagesRequest<'a> {
  model: &'a str,
  max_tokens: u32,
  temperature: f32,
  system: &'a str,
  messages: Vec<MessageReq<'a>>,
}

#[derive(Serialize)]
struct MessageReq<'a> {
  role: &'static str,
  content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
  #[serde(default)]
  content: Vec<ContentBlock>,
  #[serde(default)]
  usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ContentBlock {
  #[serde(rename = "type")]
  kind: String,
  #[serde(default)]
  text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
  #[serde(default)]
  input_tokens: Option<u32>,
  #[serde(default)]
  output_tokens: Option<u32>,
}

/// Try to extract a clean error message from an API error body.
fn extract_api_error(body: &str) -> Option<String> {
  #[derive(Deserialize)]
  struct EWrap {
    error: EObj,
  }
  #[derive(Deserialize)]
  struct EObj {
    message: String,
  }
  serde_json::from_str::<EWrap>(body).ok().map(|w| w.error.message)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fences_are_stripped() {
    assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
    assert_eq!(strip_code_fence("Here:\n```\n[1]\n```\nthanks"), "[1]");
    assert_eq!(strip_code_fence("  {\"plain\":true} "), "{\"plain\":true}");
    assert_eq!(strip_code_fence("```json unterminated"), "```json unterminated");
  }

  #[test]
  fn api_error_message_is_extracted() {
    let body = r#"{"type":"error","error":{"type":"invalid_request_error","message":"bad model"}}"#;
    assert_eq!(extract_api_error(body).as_deref(), Some("bad model"));
    assert_eq!(extract_api_error("<html>"), None);
  }

  #[tokio::test]
  async fn disabled_client_reports_disabled() {
    let req = Completion {
      model: "m".into(),
      system: String::new(),
      user: String::new(),
      max_tokens: 1,
      temperature: 0.0,
    };
    assert!(matches!(DisabledLlm.complete(&req).await, Err(LlmError::Disabled)));
  }
}
