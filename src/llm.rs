//! Language model clients.
//!
//! Implements [`Completer`] over HTTP:
//! - **[`OpenAiCompleter`]** calls an OpenAI-compatible `/chat/completions`
//!   endpoint (OpenAI, Ollama, vLLM, ...).
//! - **[`AnthropicCompleter`]** calls the Anthropic `/messages` endpoint.
//! - **[`GoogleCompleter`]** calls the Gemini `generateContent` endpoint.
//!
//! Use [`create_completer`] to pick one from the `[model]` config section.
//!
//! # Retry Strategy
//!
//! Both clients use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Reasoning blocks (`<think>…</think>`) are stripped from every reply.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use quiknow_core::completion::{Completer, Prompt};
use quiknow_core::parse::strip_reasoning;
use quiknow_core::PipelineError;

use crate::config::ModelConfig;

/// Key sent to local Ollama servers, which ignore it.
const OLLAMA_KEY: &str = "ollama";
const ANTHROPIC_DEFAULT_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const GOOGLE_DEFAULT_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const MAX_OUTPUT_TOKENS: u32 = 4096;

/// Add a scheme when missing and drop trailing slashes.
pub fn normalize_base_url(url: &str) -> String {
    let url = url.trim();
    let url = if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    };
    url.trim_end_matches('/').to_string()
}

/// Whether `base_url` points at a local Ollama server.
pub fn is_local_ollama(base_url: &str) -> bool {
    base_url.contains("127.0.0.1:11434") || base_url.contains("localhost:11434")
}

/// Build the completer selected by `config.protocol`. `model_override`
/// replaces `config.name` (used by `check --model`).
pub fn create_completer(
    config: &ModelConfig,
    model_override: Option<&str>,
) -> Result<Arc<dyn Completer>> {
    let model = model_override.unwrap_or(&config.name).to_string();
    match config.protocol.as_str() {
        "openai" => Ok(Arc::new(OpenAiCompleter::new(config, model)?)),
        "anthropic" => Ok(Arc::new(AnthropicCompleter::new(config, model)?)),
        "google" => Ok(Arc::new(GoogleCompleter::new(config, model)?)),
        other => bail!("Unknown model protocol: {}", other),
    }
}

fn http_client(config: &ModelConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

/// POST `body` to `url` with retry/backoff and return the JSON reply.
async fn post_json(
    client: &reqwest::Client,
    url: &str,
    headers: &[(&str, String)],
    body: &serde_json::Value,
    max_retries: u32,
    provider: &str,
) -> Result<serde_json::Value, PipelineError> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            debug!(provider, attempt, ?delay, "retrying model call");
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, value);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response.json().await.map_err(|e| {
                        PipelineError::Completion(format!("{} returned invalid JSON: {}", provider, e))
                    });
                }

                // Rate limited or server error: retry
                let body_text = response.text().await.unwrap_or_default();
                let err = format!("{} API error {}: {}", provider, status, body_text);
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(err);
                    continue;
                }

                // Client error (not 429): fail now
                return Err(PipelineError::Completion(err));
            }
            Err(e) => {
                last_err = Some(format!("{} request failed: {}", provider, e));
                continue;
            }
        }
    }

    Err(PipelineError::Completion(last_err.unwrap_or_else(|| {
        format!("{} call failed after retries", provider)
    })))
}

/// Chat-completions client for OpenAI-compatible servers.
pub struct OpenAiCompleter {
    model: String,
    endpoint: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiCompleter {
    /// Local Ollama addresses get a placeholder key; other servers need
    /// the key named by `model.api_key_env`.
    pub fn new(config: &ModelConfig, model: String) -> Result<Self> {
        let base = normalize_base_url(&config.url);
        let api_key = match config.api_key() {
            Some(key) => key,
            None if is_local_ollama(&base) => OLLAMA_KEY.to_string(),
            None => bail!(
                "{} environment variable not set (required for {})",
                config.api_key_env,
                base
            ),
        };
        Ok(Self {
            model,
            endpoint: format!("{}/chat/completions", base),
            api_key,
            max_retries: config.max_retries,
            client: http_client(config)?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Completer for OpenAiCompleter {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String, PipelineError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user},
            ],
        });
        let headers = [("Authorization", format!("Bearer {}", self.api_key))];
        let json = post_json(
            &self.client,
            &self.endpoint,
            &headers,
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        parse_openai_reply(&json).map(|t| strip_reasoning(&t))
    }
}

/// Extract `choices[0].message.content`.
fn parse_openai_reply(json: &serde_json::Value) -> Result<String, PipelineError> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            PipelineError::Completion("Invalid OpenAI response: missing choices[0].message.content".to_string())
        })
}

/// Messages-API client for Anthropic models.
pub struct AnthropicCompleter {
    model: String,
    endpoint: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl AnthropicCompleter {
    pub fn new(config: &ModelConfig, model: String) -> Result<Self> {
        let api_key = config.api_key().ok_or_else(|| {
            anyhow::anyhow!("{} environment variable not set", config.api_key_env)
        })?;
        // The default URL points at a local Ollama server; use the public API instead.
        let base = if config.url.trim().is_empty() || is_local_ollama(&config.url) {
            ANTHROPIC_DEFAULT_URL.to_string()
        } else {
            normalize_base_url(&config.url)
        };
        Ok(Self {
            model,
            endpoint: format!("{}/messages", base),
            api_key,
            max_retries: config.max_retries,
            client: http_client(config)?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Completer for AnthropicCompleter {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String, PipelineError> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": MAX_OUTPUT_TOKENS,
            "system": prompt.system,
            "messages": [{"role": "user", "content": prompt.user}],
        });
        let headers = [
            ("x-api-key", self.api_key.clone()),
            ("anthropic-version", ANTHROPIC_VERSION.to_string()),
        ];
        let json = post_json(
            &self.client,
            &self.endpoint,
            &headers,
            &body,
            self.max_retries,
            "Anthropic",
        )
        .await?;
        parse_anthropic_reply(&json).map(|t| strip_reasoning(&t))
    }
}

/// Concatenate the `text` blocks of `content`.
fn parse_anthropic_reply(json: &serde_json::Value) -> Result<String, PipelineError> {
    let blocks = json
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| PipelineError::Completion("Invalid Anthropic response: missing content".to_string()))?;
    Ok(blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join(""))
}

/// Gemini client.
pub struct GoogleCompleter {
    model: String,
    endpoint: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl GoogleCompleter {
    pub fn new(config: &ModelConfig, model: String) -> Result<Self> {
        let api_key = config.api_key().ok_or_else(|| {
            anyhow::anyhow!("{} environment variable not set", config.api_key_env)
        })?;
        let base = if config.url.trim().is_empty() || is_local_ollama(&config.url) {
            GOOGLE_DEFAULT_URL.to_string()
        } else {
            normalize_base_url(&config.url)
        };
        Ok(Self {
            endpoint: format!("{}/models/{}:generateContent", base, model),
            model,
            api_key,
            max_retries: config.max_retries,
            client: http_client(config)?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Completer for GoogleCompleter {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String, PipelineError> {
        let body = serde_json::json!({
            "systemInstruction": {"parts": [{"text": prompt.system}]},
            "contents": [{"role": "user", "parts": [{"text": prompt.user}]}],
            "generationConfig": {"maxOutputTokens": MAX_OUTPUT_TOKENS},
        });
        let headers = [("x-goog-api-key", self.api_key.clone())];
        let json = post_json(
            &self.client,
            &self.endpoint,
            &headers,
            &body,
            self.max_retries,
            "Google",
        )
        .await?;
        parse_google_reply(&json).map(|t| strip_reasoning(&t))
    }
}

/// Concatenate the text parts of the first candidate.
fn parse_google_reply(json: &serde_json::Value) -> Result<String, PipelineError> {
    let parts = json
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .ok_or_else(|| {
            PipelineError::Completion("Invalid Google response: missing candidates[0].content.parts".to_string())
        })?;
    Ok(parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join(""))
}
