use async_trait::async_trait;
use palaver_common::{Error, Result};
use palaver_config::{ConfigSnapshot, OpenAiConfig};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::openai::DEFAULT_BASE_URL;
use crate::providers::{status_error, transport_error};

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn provider_id(&self) -> &str;
    fn model(&self) -> &str;
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    fn reconfigure(&mut self, snapshot: &ConfigSnapshot) -> Result<()>;
}

/// OpenAI `/v1/embeddings` provider.
pub struct OpenAiEmbeddingProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiEmbeddingProvider {
    pub fn new(
        api_key: impl Into<String>,
        model: Option<String>,
        base_url: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.unwrap_or_else(|| "text-embedding-ada-002".to_string()),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    pub fn from_config(config: &OpenAiConfig) -> Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| Error::Config("embeddings need an OpenAI API key".into()))?;
        Ok(Self::new(
            api_key,
            Some(config.embedding_model.clone()),
            config.base_url.clone(),
        ))
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    fn provider_id(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = EmbeddingRequest {
            model: &self.model,
            input: text,
        };

        let response = self
            .client
            .post(self.endpoint())
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

        let payload: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("failed to decode embedding response: {e}")))?;

        let vector = payload
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| Error::Provider("openai returned no embedding".into()))?;

        debug!("embedded {} chars into {} dimensions", text.len(), vector.len());
        Ok(vector)
    }

    fn reconfigure(&mut self, snapshot: &ConfigSnapshot) -> Result<()> {
        *self = Self::from_config(&snapshot.config.openai)?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}
