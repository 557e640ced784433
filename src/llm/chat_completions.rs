//! OpenAI-compatible `/chat/completions` backend over reqwest.
//!
//! Works with Groq (the default), OpenAI, Mistral and anything else that
//! speaks the same wire format.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider,
};

/// Request timeout for one completion.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Chat completions client.
pub struct ChatCompletionsProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: SecretString,
    model: String,
    provider: String,
}

impl ChatCompletionsProvider {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: SecretString,
        model: impl Into<String>,
    ) -> Result<Self, LlmError> {
        let endpoint = endpoint.into();
        let provider = provider_label(&endpoint);
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: provider.clone(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            endpoint,
            api_key,
            model: model.into(),
            provider,
        })
    }

    fn map_status(&self, status: StatusCode, body: String, retry_after: Option<Duration>) -> LlmError {
        let provider = self.provider.clone();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::AuthFailed { provider },
            StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited {
                provider,
                retry_after,
            },
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                LlmError::Timeout { provider }
            }
            _ => LlmError::RequestFailed {
                provider,
                reason: format!("HTTP {status}: {}", truncate(&body, 300)),
            },
        }
    }
}

#[async_trait]
impl LlmProvider for ChatCompletionsProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        provider: self.provider.clone(),
                    }
                } else {
                    LlmError::RequestFailed {
                        provider: self.provider.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = resp.text().await.unwrap_or_default();
            return Err(self.map_status(status, text, retry_after));
        }

        let text = resp.text().await.map_err(|e| LlmError::InvalidResponse {
            provider: self.provider.clone(),
            reason: e.to_string(),
        })?;
        parse_chat_response(&self.provider, &text)
    }
}

// ── Wire format ─────────────────────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    id: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

fn parse_chat_response(provider: &str, text: &str) -> Result<CompletionResponse, LlmError> {
    let parsed: ChatResponse = serde_json::from_str(text).map_err(|e| LlmError::InvalidResponse {
        provider: provider.to_string(),
        reason: format!("Could not parse chat response: {e}"),
    })?;

    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: "No choices in response".into(),
        })?;

    let finish_reason = choice
        .finish_reason
        .as_deref()
        .map(FinishReason::parse)
        .unwrap_or(FinishReason::Unknown);
    let content = choice.message.content.unwrap_or_default().trim().to_string();
    let (input_tokens, output_tokens) = parsed
        .usage
        .map(|u| (u.prompt_tokens, u.completion_tokens))
        .unwrap_or((0, 0));

    debug!(
        provider,
        input_tokens,
        output_tokens,
        finish_reason = ?finish_reason,
        "Chat completion received"
    );

    Ok(CompletionResponse {
        content,
        input_tokens,
        output_tokens,
        finish_reason,
        response_id: parsed.id,
    })
}

/// Short provider label derived from the endpoint host.
fn provider_label(endpoint: &str) -> String {
    let host = endpoint
        .split("://")
        .nth(1)
        .unwrap_or(endpoint)
        .split('/')
        .next()
        .unwrap_or_default();
    let parts: Vec<&str> = host.split('.').collect();
    match parts.len() {
        0 | 1 => host.to_string(),
        n => parts[n - 2].to_string(),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
