//! Language-model access.
//!
//! [`LanguageModel`] is the seam the summarize and digest stages call
//! through; [`OpenAiClient`] talks to any OpenAI-compatible
//! `/chat/completions` endpoint.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use refeed_shared::{LlmConfig, RefeedError, Result};

/// One-shot chat completion.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Send `prompt` as a single user message. `model` overrides the
    /// client's default model.
    async fn chat(&self, model: Option<&str>, prompt: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponseRaw {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// Client for an OpenAI-compatible chat API.
#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    timeout: Duration,
    max_prompt_chars: usize,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>, config: &LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("refeed/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RefeedError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            max_prompt_chars: config.max_prompt_chars,
        })
    }

    /// Point the client somewhere else (proxies, test servers).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn complete(&self, model: &str, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
        };
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| RefeedError::Llm(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, error = %body, "chat completion rejected");
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                return Err(RefeedError::config(format!(
                    "language model rejected the API key ({status})"
                )));
            }
            return Err(RefeedError::Llm(format!("HTTP {status}: {body}")));
        }

        let raw: ChatResponseRaw = response
            .json()
            .await
            .map_err(|e| RefeedError::Llm(format!("malformed completion: {e}")))?;
        if let Some(usage) = &raw.usage {
            debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "token usage"
            );
        }
        raw.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| RefeedError::Llm("empty completion".into()))
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    #[instrument(
        skip_all,
        fields(model = model.unwrap_or(self.model.as_str()), prompt_chars = prompt.len())
    )]
    async fn chat(&self, model: Option<&str>, prompt: &str) -> Result<String> {
        let model = model.unwrap_or(self.model.as_str());
        let prompt = truncate_prompt(prompt, self.max_prompt_chars);
        let started = Instant::now();

        // The timeout races the whole call, so a stalled connection fails the attempt.
        let content = tokio::time::timeout(self.timeout, self.complete(model, &prompt))
            .await
            .map_err(|_| RefeedError::Timeout {
                operation: format!("chat completion with {model}"),
                after: self.timeout,
            })??;

        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "chat completion");
        Ok(content)
    }
}

/// Cut `prompt` from the end to at most `max_chars` characters.
pub fn truncate_prompt(prompt: &str, max_chars: usize) -> String {
    match prompt.char_indices().nth(max_chars) {
        Some((cut, _)) => {
            warn!(from = prompt.chars().count(), to = max_chars, "shortening prompt");
            prompt[..cut].to_string()
        }
        None => prompt.to_string(),
    }
}
