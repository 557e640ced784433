//! LLM integration for the categorizer.
//!
//! One backend ships with the crate: an OpenAI-compatible chat completions
//! client ([`ChatCompletionsProvider`]), pointed at Groq unless configured
//! otherwise. Anything implementing [`LlmProvider`] can stand in for it.

pub mod chat_completions;
pub mod provider;

pub use chat_completions::ChatCompletionsProvider;
pub use provider::*;

use std::sync::Arc;

use secrecy::SecretString;

use crate::config::env_opt;
use crate::error::{ConfigError, LlmError};

/// Default endpoint (Groq's OpenAI-compatible API).
pub const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai/v1/chat/completions";

/// Default model.
pub const DEFAULT_MODEL: &str = "openai/gpt-oss-120b";

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: SecretString,
    pub model: String,
    pub base_url: String,
}

impl LlmConfig {
    /// Build config from environment variables.
    ///
    /// `SORTER_LLM_API_KEY` wins over `GROQ_API_KEY`; one of them is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = env_opt("SORTER_LLM_API_KEY")
            .or_else(|| env_opt("GROQ_API_KEY"))
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "SORTER_LLM_API_KEY".into(),
                hint: "Set SORTER_LLM_API_KEY or GROQ_API_KEY.".into(),
            })?;

        Ok(Self {
            api_key: SecretString::from(api_key),
            model: env_opt("SORTER_LLM_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: env_opt("SORTER_LLM_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let provider =
        ChatCompletionsProvider::new(&config.base_url, config.api_key.clone(), &config.model)?;
    tracing::info!("Using chat completions at {} (model: {})", config.base_url, config.model);
    Ok(Arc::new(provider))
}
