use crate::anthropic::{ANTHROPIC_BASE_URL, AnthropicClient};
use crate::error::{LlmError, Result};
use crate::openai::{OPENAI_BASE_URL, OpenAiClient};
use crate::types::{ChatMessage, ChatOptions, ChatResponse};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Anthropic,
}

impl Provider {
    pub fn from_model(model: &str) -> Self {
        if model.to_ascii_lowercase().starts_with("claude-") {
            Self::Anthropic
        } else {
            Self::OpenAI
        }
    }

    /// Environment variable conventionally holding this provider's key.
    pub fn api_key_env(self) -> &'static str {
        match self {
            Self::OpenAI => "OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAI => OPENAI_BASE_URL,
            Self::Anthropic => ANTHROPIC_BASE_URL,
        }
    }
}

#[derive(Clone)]
pub struct LlmClient {
    provider: Provider,
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all, fields(model = %model))]
    pub fn new(api_key: &str, model: &str, timeout: Duration) -> Result<Self> {
        if model.trim().is_empty() {
            return Err(LlmError::InvalidInput("model is empty".to_string()));
        }
        let provider = Provider::from_model(model);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Ok(Self {
            provider,
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: provider.default_base_url().to_string(),
            client,
        })
    }

    /// Points the client at an API-compatible gateway.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    #[tracing::instrument(level = "info", skip_all, fields(provider = ?self.provider, messages = messages.len()))]
    pub async fn chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<ChatResponse> {
        let resp = match self.provider {
            Provider::OpenAI => {
                OpenAiClient::new(self.client.clone(), &self.base_url, &self.api_key, &self.model)
                    .chat(messages, options)
                    .await?
            }
            Provider::Anthropic => {
                AnthropicClient::new(self.client.clone(), &self.base_url, &self.api_key, &self.model)
                    .chat(messages, options)
                    .await?
            }
        };
        tracing::debug!(
            prompt_tokens = resp.usage.prompt_tokens,
            completion_tokens = resp.usage.completion_tokens,
            finish_reason = %resp.finish_reason,
            "llm chat completed"
        );
        Ok(resp)
    }
}
