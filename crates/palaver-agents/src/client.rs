use std::future::Future;

use palaver_common::{Error, Result};
use palaver_config::{AppConfig, ConfigSnapshot};
use tracing::{info, warn};

use crate::context::BuiltContext;
use crate::embeddings::{EmbeddingProvider, OpenAiEmbeddingProvider};
use crate::providers::{LlmProvider, LlmRequest, build_provider};

/// Sampling parameters sent with every completion.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSettings {
    pub max_attempts: u32,
    /// Completion length cap; 0 leaves it to the provider.
    pub max_tokens: usize,
    pub temperature: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
}

impl RequestSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.llm.max_attempts.max(1),
            max_tokens: config.llm.max_tokens,
            temperature: config.llm.temperature,
            presence_penalty: config.llm.presence_penalty,
            frequency_penalty: config.llm.frequency_penalty,
        }
    }
}

/// Remote completion and embedding calls with bounded immediate retry on
/// transient connection failures.
pub struct CompletionClient {
    provider: Box<dyn LlmProvider>,
    embedder: Option<Box<dyn EmbeddingProvider>>,
    settings: RequestSettings,
}

impl CompletionClient {
    pub fn new(
        provider: Box<dyn LlmProvider>,
        embedder: Option<Box<dyn EmbeddingProvider>>,
        settings: RequestSettings,
    ) -> Self {
        Self {
            provider,
            embedder,
            settings,
        }
    }

    /// Build the configured chat provider, plus the embedder when
    /// `openai.use_embeddings` is on and a key is available.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let provider = build_provider(config)?;
        Ok(Self::new(
            provider,
            embedder_for(config),
            RequestSettings::from_config(config),
        ))
    }

    pub fn provider(&self) -> &dyn LlmProvider {
        self.provider.as_ref()
    }

    pub fn provider_mut(&mut self) -> &mut dyn LlmProvider {
        self.provider.as_mut()
    }

    pub fn embeddings_enabled(&self) -> bool {
        self.embedder.is_some()
    }

    pub fn settings(&self) -> &RequestSettings {
        &self.settings
    }

    /// Generate a reply to `context`. Blank replies are an error.
    pub async fn complete(&self, context: &BuiltContext) -> Result<String> {
        let mut request = LlmRequest::new(context.messages.clone());
        request.model = self.provider.current_model().to_string();
        request.max_tokens = match self.settings.max_tokens {
            0 => None,
            n => Some(u32::try_from(n).unwrap_or(u32::MAX)),
        };
        request.temperature = Some(self.settings.temperature);
        request.presence_penalty = Some(self.settings.presence_penalty);
        request.frequency_penalty = Some(self.settings.frequency_penalty);

        let response = self
            .with_retry(self.provider.provider_id(), || self.provider.complete(&request))
            .await?;

        let text = response.text.trim();
        if text.is_empty() {
            return Err(Error::EmptyCompletion);
        }
        Ok(text.to_string())
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| Error::Config("embeddings are disabled".into()))?;
        self.with_retry(embedder.provider_id(), || embedder.embed(text))
            .await
    }

    /// Apply a new snapshot. A change of provider kind swaps the provider.
    pub fn reconfigure(&mut self, snapshot: &ConfigSnapshot) -> Result<()> {
        let config = &snapshot.config;
        if self.provider.provider_id() == config.bot.provider.as_str() {
            self.provider.reconfigure(snapshot)?;
        } else {
            info!(
                "switching provider from {} to {}",
                self.provider.provider_id(),
                config.bot.provider.as_str()
            );
            self.provider = build_provider(config)?;
        }

        self.embedder = match self.embedder.take() {
            Some(mut embedder) if config.openai.use_embeddings => {
                match embedder.reconfigure(snapshot) {
                    Ok(()) => Some(embedder),
                    Err(e) => {
                        warn!("disabling embeddings: {}", e);
                        None
                    }
                }
            }
            _ => embedder_for(config),
        };
        self.settings = RequestSettings::from_config(config);
        Ok(())
    }

    async fn with_retry<T, F, Fut>(&self, backend: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.settings.max_attempts => {
                    warn!(
                        backend = backend,
                        attempt = attempt,
                        max_attempts = self.settings.max_attempts,
                        "connection failure, retrying: {}",
                        e
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn embedder_for(config: &AppConfig) -> Option<Box<dyn EmbeddingProvider>> {
    if !config.openai.use_embeddings {
        return None;
    }
    match OpenAiEmbeddingProvider::from_config(&config.openai) {
        Ok(embedder) => Some(Box::new(embedder)),
        Err(e) => {
            warn!("embeddings disabled: {}", e);
            None
        }
    }
}
