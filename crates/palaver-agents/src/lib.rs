pub mod anthropic;
pub mod client;
pub mod context;
pub mod embeddings;
pub mod openai;
pub mod providers;
pub mod runtime;
pub mod template;
pub mod tokenizer;

pub use client::CompletionClient;
pub use context::{BuiltContext, ContextBuilder, ContextSettings, StaticDirectory, UserDirectory};
pub use embeddings::{EmbeddingProvider, OpenAiEmbeddingProvider};
pub use providers::{
    AnthropicProvider, LlmProvider, LlmRequest, LlmResponse, OpenAiProvider, PromptMessage,
    PromptRole, build_provider,
};
pub use runtime::{ConversationRuntime, GenerationOutcome};
pub use tokenizer::{CharCounter, EstimateCounter, TiktokenCounter, TokenCounter};
