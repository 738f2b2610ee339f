pub mod loader;
pub mod model;
pub mod snapshot;

pub use loader::ConfigLoader;
pub use model::{
    AnthropicConfig, AppConfig, BotConfig, LlmConfig, OpenAiConfig, ProviderKind, RecallConfig,
};
pub use snapshot::{ConfigHandle, ConfigSnapshot};
