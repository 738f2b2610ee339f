use async_trait::async_trait;
use palaver_common::{Error, Result};
use palaver_config::{ConfigSnapshot, OpenAiConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::providers::{
    LlmProvider, LlmRequest, LlmResponse, PromptMessage, Usage, status_error, transport_error,
};

const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub(crate) const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// OpenAI Chat Completions provider.
/// Also works with OpenAI-compatible APIs via `base_url`.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiProvider {
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

    pub fn from_config(config: &OpenAiConfig) -> Result<Self> {
        let api_key = config.resolve_api_key().ok_or_else(|| {
            Error::Config(
                "no OpenAI API key (set openai.api_key in config or OPENAI_API_KEY env var)"
                    .into(),
            )
        })?;
        Ok(Self::new(
            api_key,
            Some(config.model.clone()),
            config.base_url.clone(),
        ))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn build_request(&self, request: &LlmRequest) -> OpenAiRequest {
        let model = if request.model.is_empty() {
            self.model.clone()
        } else {
            request.model.clone()
        };

        OpenAiRequest {
            model,
            messages: request.messages.iter().map(to_openai_message).collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            presence_penalty: request.presence_penalty,
            frequency_penalty: request.frequency_penalty,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_id(&self) -> &str {
        "openai"
    }

    fn current_model(&self) -> &str {
        &self.model
    }

    fn set_model(&mut self, model_id: &str) {
        info!("openai model set to {}", model_id);
        self.model = model_id.to_string();
    }

    #[instrument(skip(self, request), fields(model))]
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let body = self.build_request(request);

        tracing::Span::current().record("model", body.model.as_str());
        debug!(
            "openai request: model={}, messages={}",
            body.model,
            body.messages.len()
        );

        let response = self
            .client
            .post(self.endpoint("/v1/chat/completions"))
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("openai", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("openai", status, &body));
        }

        let api_response: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("failed to parse openai response: {e}")))?;

        if let Some(usage) = &api_response.usage {
            debug!("{} tokens used", usage.total_tokens);
        }

        Ok(from_openai_response(api_response))
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(self.endpoint("/v1/models"))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| transport_error("openai", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("openai", status, &body));
        }

        let list: ModelList = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("failed to parse openai model list: {e}")))?;

        let mut models: Vec<String> = list
            .data
            .into_iter()
            .map(|m| m.id)
            .filter(|id| !(id.contains("-search-") || id.contains("-similarity-")))
            .collect();
        models.sort();
        Ok(models)
    }

    fn reconfigure(&mut self, snapshot: &ConfigSnapshot) -> Result<()> {
        let fresh = Self::from_config(&snapshot.config.openai)?;
        self.api_key = fresh.api_key;
        self.model = fresh.model;
        self.base_url = fresh.base_url;
        debug!("openai provider reconfigured from snapshot v{}", snapshot.version);
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        match self.list_models().await {
            Ok(models) => Ok(models.iter().any(|m| m == &self.model)),
            Err(e) => {
                info!("openai health check failed: {e}");
                Ok(false)
            }
        }
    }
}

/// OpenAI only accepts `[A-Za-z0-9_-]{1,64}` as a participant name.
fn sanitize_name(name: &str) -> Option<String> {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect();

    if cleaned.chars().all(|c| c == '_') {
        None
    } else {
        Some(cleaned)
    }
}

fn to_openai_message(message: &PromptMessage) -> OpenAiMessage {
    OpenAiMessage {
        role: message.role.as_str().to_string(),
        content: message.content.clone(),
        name: message.name.as_deref().and_then(sanitize_name),
    }
}

fn from_openai_response(response: OpenAiResponse) -> LlmResponse {
    let text = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();

    LlmResponse {
        text,
        model: response.model,
        usage: response.usage.map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }),
    }
}

// --- OpenAI Wire Types (private) ---

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    model: String,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}
