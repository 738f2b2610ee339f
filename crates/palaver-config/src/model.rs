use palaver_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_INITIAL_PROMPT: &str = "Write {bot_name}'s next reply in a fictional chat \
between {bot_name} and {user_name}. Write 1 reply only in internet RP style, italicize actions, \
and avoid quotation marks. Be proactive, creative, and drive the plot and conversation forward. \
Write at least 1 paragraph, up to 4. Always stay in character and avoid repetition. \
{bot_identity} {user_identity}";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bot: BotConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub openai: OpenAiConfig,

    #[serde(default)]
    pub anthropic: AnthropicConfig,

    #[serde(default)]
    pub recall: RecallConfig,

    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub log_level: Option<String>,
}

impl AppConfig {
    /// Reject values that would make context assembly meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.llm.context_messages == 0 {
            return Err(Error::Config(
                "llm.context_messages must be greater than 0".into(),
            ));
        }
        if self.llm.max_attempts == 0 {
            return Err(Error::Config("llm.max_attempts must be at least 1".into()));
        }
        let threshold = self.recall.similarity_threshold;
        if !(-1.0..=1.0).contains(&threshold) {
            return Err(Error::Config(format!(
                "recall.similarity_threshold must be within [-1, 1], got {threshold}"
            )));
        }
        if self.bot.name.trim().is_empty() {
            return Err(Error::Config("bot.name cannot be empty".into()));
        }
        Ok(())
    }

    /// Model name of whichever provider `bot.provider` selects.
    pub fn active_model(&self) -> &str {
        match self.bot.provider {
            ProviderKind::OpenAi => &self.openai.model,
            ProviderKind::Anthropic => &self.anthropic.model,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_bot_name")]
    pub name: String,

    /// Persona description substituted for `{bot_identity}`.
    #[serde(default)]
    pub identity: String,

    #[serde(default = "default_initial_prompt")]
    pub initial_prompt: String,

    #[serde(default)]
    pub reminder: Option<String>,

    #[serde(default)]
    pub provider: ProviderKind,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: default_bot_name(),
            identity: String::new(),
            initial_prompt: default_initial_prompt(),
            reminder: None,
            provider: ProviderKind::default(),
        }
    }
}

fn default_bot_name() -> String {
    "Palaver".to_string()
}

fn default_initial_prompt() -> String {
    DEFAULT_INITIAL_PROMPT.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Size of the recency window, in turns.
    #[serde(default = "default_context_messages")]
    pub context_messages: usize,

    /// Tokens reserved for the completion itself.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Overrides the model family's known context window.
    #[serde(default)]
    pub context_window: Option<usize>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default)]
    pub presence_penalty: f32,

    #[serde(default)]
    pub frequency_penalty: f32,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            context_messages: default_context_messages(),
            max_tokens: default_max_tokens(),
            context_window: None,
            temperature: default_temperature(),
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_context_messages() -> usize {
    10
}

fn default_max_tokens() -> usize {
    400
}

fn default_temperature() -> f32 {
    0.9
}

fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_openai_model")]
    pub model: String,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Embed every turn so older history can be recalled.
    #[serde(default = "default_true")]
    pub use_embeddings: bool,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_openai_model(),
            base_url: None,
            embedding_model: default_embedding_model(),
            use_embeddings: true,
        }
    }
}

impl OpenAiConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_api_key(self.api_key.as_deref(), "OPENAI_API_KEY")
    }
}

fn default_openai_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-ada-002".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnthropicConfig {
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_anthropic_model")]
    pub model: String,

    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_anthropic_model(),
            base_url: None,
        }
    }
}

impl AnthropicConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_api_key(self.api_key.as_deref(), "ANTHROPIC_API_KEY")
    }
}

fn default_anthropic_model() -> String {
    "claude-3-5-haiku-latest".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: default_similarity_threshold(),
            max_results: default_max_results(),
        }
    }
}

fn default_similarity_threshold() -> f32 {
    0.83
}

fn default_max_results() -> usize {
    5
}

fn default_true() -> bool {
    true
}

/// Config file value first, then the environment variable.
fn resolve_api_key(config_key: Option<&str>, env_var: &str) -> Option<String> {
    if let Some(key) = config_key
        && !key.is_empty()
    {
        return Some(key.to_string());
    }

    std::env::var(env_var).ok().filter(|v| !v.is_empty())
}
