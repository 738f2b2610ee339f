use async_trait::async_trait;
use palaver_common::{Error, Result};
use palaver_config::{AnthropicConfig, ConfigSnapshot};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::providers::{
    LlmProvider, LlmRequest, LlmResponse, PromptRole, Usage, status_error, transport_error,
};

const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// The messages API has no public model listing; these are the ids offered
/// for selection.
const MODEL_CATALOGUE: &[&str] = &[
    "claude-3-5-haiku-latest",
    "claude-3-5-sonnet-latest",
    "claude-3-7-sonnet-latest",
    "claude-3-opus-latest",
    "claude-opus-4-0",
    "claude-sonnet-4-0",
];

/// Anthropic Claude provider.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(
        api_key: impl Into<String>,
        model: Option<String>,
        base_url: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    pub fn from_config(config: &AnthropicConfig) -> Result<Self> {
        let api_key = config.resolve_api_key().ok_or_else(|| {
            Error::Config(
                "no Anthropic API key (set anthropic.api_key in config or ANTHROPIC_API_KEY env var)"
                    .into(),
            )
        })?;
        Ok(Self::new(
            api_key,
            Some(config.model.clone()),
            config.base_url.clone(),
        ))
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }

    fn build_request(&self, request: &LlmRequest) -> AnthropicRequest {
        let model = if request.model.is_empty() {
            self.model.clone()
        } else {
            request.model.clone()
        };

        let mut system_parts = Vec::new();
        let mut messages: Vec<AnthropicMessage> = Vec::new();

        for message in &request.messages {
            let role = match message.role {
                PromptRole::System => {
                    system_parts.push(message.content.as_str());
                    continue;
                }
                PromptRole::User => "user",
                PromptRole::Assistant => "assistant",
            };

            let content = match &message.name {
                Some(name) => format!("{name}: {}", message.content),
                None => message.content.clone(),
            };

            // consecutive turns of one role are sent as a single message
            match messages.last_mut() {
                Some(last) if last.role == role => {
                    last.content.push_str("\n\n");
                    last.content.push_str(&content);
                }
                _ => messages.push(AnthropicMessage {
                    role: role.to_string(),
                    content,
                }),
            }
        }

        let mut system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };

        if messages.is_empty() {
            // Nothing to reply to yet; the instructions become the user turn.
            messages.push(AnthropicMessage {
                role: "user".to_string(),
                content: system.take().unwrap_or_default(),
            });
        } else if messages[0].role == "assistant" {
            messages.insert(
                0,
                AnthropicMessage {
                    role: "user".to_string(),
                    content: "(continue)".to_string(),
                },
            );
        }

        AnthropicRequest {
            model,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            messages,
            temperature: request.temperature,
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn provider_id(&self) -> &str {
        "anthropic"
    }

    fn current_model(&self) -> &str {
        &self.model
    }

    fn set_model(&mut self, model_id: &str) {
        info!("anthropic model set to {}", model_id);
        self.model = model_id.to_string();
    }

    #[instrument(skip(self, request), fields(model))]
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let body = self.build_request(request);

        tracing::Span::current().record("model", body.model.as_str());
        debug!("anthropic request: model={}", body.model);

        let response = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("anthropic", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("anthropic", status, &body));
        }

        let api_response: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("failed to parse anthropic response: {e}")))?;

        Ok(from_anthropic_response(api_response))
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(MODEL_CATALOGUE.iter().map(|m| m.to_string()).collect())
    }

    fn reconfigure(&mut self, snapshot: &ConfigSnapshot) -> Result<()> {
        let fresh = Self::from_config(&snapshot.config.anthropic)?;
        self.api_key = fresh.api_key;
        self.model = fresh.model;
        self.base_url = fresh.base_url;
        debug!(
            "anthropic provider reconfigured from snapshot v{}",
            snapshot.version
        );
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let mut request = LlmRequest::new(vec![crate::providers::PromptMessage::user(
            None, "ping",
        )]);
        request.max_tokens = Some(1);

        match self.complete(&request).await {
            Ok(_) => Ok(true),
            Err(e) => {
                info!("anthropic health check failed: {e}");
                Ok(false)
            }
        }
    }
}

fn from_anthropic_response(response: AnthropicResponse) -> LlmResponse {
    let text = response
        .content
        .into_iter()
        .filter_map(|block| match block {
            AnthropicBlock::Text { text } => Some(text),
            AnthropicBlock::Other => None,
        })
        .collect::<Vec<_>>()
        .join("");

    LlmResponse {
        text,
        model: response.model,
        usage: response.usage.map(|u| Usage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
        }),
    }
}

// --- Anthropic Wire Types (private) ---

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
    #[serde(default)]
    model: String,
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::PromptMessage;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn folds_system_turns_and_merges_roles() {
        let provider = AnthropicProvider::new("test-key", None, None);
        let request = LlmRequest::new(vec![
            PromptMessage::system("You are Kit."),
            PromptMessage::user(Some("Ann".into()), "hello"),
            PromptMessage::user(Some("Bo".into()), "hey"),
            PromptMessage::assistant("hi both"),
            PromptMessage::system("Reminder: be brief"),
        ]);

        let body = provider.build_request(&request);
        assert_eq!(body.model, DEFAULT_MODEL);
        assert_eq!(body.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(
            body.system.as_deref(),
            Some("You are Kit.\n\nReminder: be brief")
        );
        assert_eq!(body.messages.len(), 2);
        assert_eq!(body.messages[0].content, "Ann: hello\n\nBo: hey");
        assert_eq!(body.messages[1].role, "assistant");
    }

    #[test]
    fn instructions_alone_become_user_turn() {
        let provider = AnthropicProvider::new("test-key", None, None);
        let body = provider.build_request(&LlmRequest::new(vec![PromptMessage::system(
            "Introduce yourself.",
        )]));
        assert!(body.system.is_none());
        assert_eq!(body.messages.len(), 1);
        assert_eq!(body.messages[0].role, "user");
        assert_eq!(body.messages[0].content, "Introduce yourself.");
    }

    #[test]
    fn conversation_never_opens_with_assistant() {
        let provider = AnthropicProvider::new("test-key", None, None);
        let body = provider.build_request(&LlmRequest::new(vec![PromptMessage::assistant(
            "Welcome back.",
        )]));
        assert_eq!(body.messages[0].role, "user");
        assert_eq!(body.messages[1].role, "assistant");
    }

    #[tokio::test]
    async fn complete_joins_text_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_123",
                "type": "message",
                "role": "assistant",
                "model": "claude-test",
                "content": [
                    {"type": "text", "text": "Hello "},
                    {"type": "thinking", "thinking": "hmm"},
                    {"type": "text", "text": "from mock"}
                ],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 10, "output_tokens": 5}
            })))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new("test-key", None, Some(server.uri()));
        let response = provider
            .complete(&LlmRequest::new(vec![PromptMessage::user(None, "Hello")]))
            .await
            .expect("completion should succeed");

        assert_eq!(response.text, "Hello from mock");
        assert_eq!(response.model, "claude-test");
    }

    #[tokio::test]
    async fn list_models_uses_catalogue() {
        let provider = AnthropicProvider::new("test-key", None, None);
        let models = provider.list_models().await.unwrap();
        assert!(models.contains(&DEFAULT_MODEL.to_string()));
    }
}
