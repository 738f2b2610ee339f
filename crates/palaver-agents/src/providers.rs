use async_trait::async_trait;
use palaver_common::{Error, Result};
use palaver_config::{AppConfig, ConfigSnapshot, ProviderKind};
use serde::{Deserialize, Serialize};

pub use crate::anthropic::AnthropicProvider;
pub use crate::openai::OpenAiProvider;

/// Capability interface over the chat models Palaver can talk to.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g. "openai", "anthropic").
    fn provider_id(&self) -> &str;

    /// Model used when a request does not name one.
    fn current_model(&self) -> &str;

    fn set_model(&mut self, model_id: &str);

    /// Send a completion request and return the response.
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse>;

    /// Models that can be selected with [`set_model`](Self::set_model).
    async fn list_models(&self) -> Result<Vec<String>>;

    /// Pick up credentials, endpoint and model from a new config snapshot.
    fn reconfigure(&mut self, snapshot: &ConfigSnapshot) -> Result<()>;

    /// Check if the provider is reachable and configured.
    async fn health_check(&self) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

impl PromptRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One message of an assembled prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    /// Speaker label for multi-user conversations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::System,
            name: None,
            content: content.into(),
        }
    }

    pub fn user(name: Option<String>, content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::User,
            name,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::Assistant,
            name: None,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<PromptMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
}

impl LlmRequest {
    pub fn new(messages: Vec<PromptMessage>) -> Self {
        Self {
            model: String::new(),
            messages,
            max_tokens: None,
            temperature: None,
            presence_penalty: None,
            frequency_penalty: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub model: String,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Construct the provider selected by `bot.provider`.
pub fn build_provider(config: &AppConfig) -> Result<Box<dyn LlmProvider>> {
    match config.bot.provider {
        ProviderKind::OpenAi => Ok(Box::new(OpenAiProvider::from_config(&config.openai)?)),
        ProviderKind::Anthropic => Ok(Box::new(AnthropicProvider::from_config(
            &config.anthropic,
        )?)),
    }
}

/// Connection-level failures are worth retrying; anything else is the
/// provider rejecting or mangling the request.
pub(crate) fn transport_error(provider: &str, e: reqwest::Error) -> Error {
    if e.is_connect() || e.is_timeout() || e.is_request() {
        Error::TransientConnection(format!("{provider} request failed: {e}"))
    } else {
        Error::Provider(format!("{provider} request failed: {e}"))
    }
}

pub(crate) fn status_error(provider: &str, status: reqwest::StatusCode, body: &str) -> Error {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Error::TransientConnection(format!(
            "{provider} API error: status={status}, body={body}"
        ))
    } else {
        Error::Provider(format!("{provider} API error: status={status}, body={body}"))
    }
}

#[cfg(test)]
mod tests {
    use super::{PromptMessage, PromptRole, build_provider, status_error};
    use palaver_config::{AppConfig, ProviderKind};
    use reqwest::StatusCode;

    #[test]
    fn server_errors_and_rate_limits_are_retryable() {
        assert!(status_error("openai", StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(status_error("openai", StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(!status_error("openai", StatusCode::UNAUTHORIZED, "").is_retryable());
    }

    #[test]
    fn prompt_message_omits_absent_name() {
        let json = serde_json::to_value(PromptMessage::system("be kind")).unwrap();
        assert_eq!(json["role"], "system");
        assert!(json.get("name").is_none());
        assert_eq!(PromptRole::Assistant.as_str(), "assistant");
    }

    #[test]
    fn build_provider_follows_configured_kind() {
        let mut config = AppConfig::default();
        config.openai.api_key = Some("sk-test".into());
        config.anthropic.api_key = Some("ak-test".into());

        let provider = build_provider(&config).expect("openai should build");
        assert_eq!(provider.provider_id(), "openai");

        config.bot.provider = ProviderKind::Anthropic;
        let provider = build_provider(&config).expect("anthropic should build");
        assert_eq!(provider.provider_id(), "anthropic");
        assert_eq!(provider.current_model(), config.anthropic.model);
    }
}
