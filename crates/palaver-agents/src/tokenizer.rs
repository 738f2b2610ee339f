use palaver_common::{Error, Result};
use palaver_config::{AppConfig, ConfigSnapshot, ProviderKind};
use tiktoken_rs::CoreBPE;
use tracing::{debug, info};

use crate::providers::PromptMessage;

/// Token accounting for one model family.
///
/// `count_message` includes whatever per-message framing the family's wire
/// format adds; `reply_priming` is charged once per request.
pub trait TokenCounter: Send + Sync {
    fn count_text(&self, text: &str) -> usize;

    fn count_message(&self, message: &PromptMessage) -> usize;

    fn reply_priming(&self) -> usize {
        0
    }

    /// Rebind any model-specific state after a config swap.
    fn reconfigure(&mut self, _snapshot: &ConfigSnapshot) -> Result<()> {
        Ok(())
    }
}

/// Pick the counter matching the configured provider.
pub fn counter_for(config: &AppConfig) -> Result<Box<dyn TokenCounter>> {
    match config.bot.provider {
        ProviderKind::OpenAi => Ok(Box::new(TiktokenCounter::for_model(&config.openai.model)?)),
        ProviderKind::Anthropic => Ok(Box::new(EstimateCounter)),
    }
}

/// Known context window (prompt + completion) for a model id.
pub fn context_window_for(model: &str) -> usize {
    let model = model.to_ascii_lowercase();

    if model.starts_with("claude") {
        100_000
    } else if model.starts_with("gpt-4o")
        || model.starts_with("gpt-4.1")
        || model.starts_with("gpt-4-turbo")
    {
        128_000
    } else if model.starts_with("gpt-4") {
        if model.contains("32k") { 32_768 } else { 8_192 }
    } else if model.starts_with("gpt-3.5") {
        if model.contains("16k") { 16_384 } else { 4_096 }
    } else {
        2_048
    }
}

/// BPE counts for OpenAI chat models.
///
/// Each chat message costs its content and role tokens plus four framing
/// tokens; a named participant adds its name and one more token. Every reply
/// is primed with two tokens.
pub struct TiktokenCounter {
    model: String,
    bpe: CoreBPE,
}

impl TiktokenCounter {
    const TOKENS_PER_MESSAGE: usize = 4;
    const TOKENS_PER_NAME: usize = 1;
    const REPLY_PRIMING: usize = 2;

    pub fn for_model(model: &str) -> Result<Self> {
        let bpe = match tiktoken_rs::get_bpe_from_model(model) {
            Ok(bpe) => bpe,
            Err(e) => {
                debug!("no tokenizer registered for {model} ({e}), using cl100k_base");
                tiktoken_rs::cl100k_base()
                    .map_err(|e| Error::Config(format!("failed to load cl100k_base: {e}")))?
            }
        };

        Ok(Self {
            model: model.to_string(),
            bpe,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl TokenCounter for TiktokenCounter {
    fn count_text(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }

    fn count_message(&self, message: &PromptMessage) -> usize {
        let mut count = self.count_text(&message.content)
            + self.count_text(message.role.as_str())
            + Self::TOKENS_PER_MESSAGE;
        if let Some(name) = &message.name {
            count += self.count_text(name) + Self::TOKENS_PER_NAME;
        }
        count
    }

    fn reply_priming(&self) -> usize {
        Self::REPLY_PRIMING
    }

    fn reconfigure(&mut self, snapshot: &ConfigSnapshot) -> Result<()> {
        let model = &snapshot.config.openai.model;
        if *model != self.model {
            info!("updating tokenizer encoding for {}", model);
            *self = Self::for_model(model)?;
        }
        Ok(())
    }
}

/// Roughly four characters per token, for families without a local tokenizer.
pub struct EstimateCounter;

impl TokenCounter for EstimateCounter {
    fn count_text(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }

    fn count_message(&self, message: &PromptMessage) -> usize {
        // names are inlined as "Name: " by providers without a name field
        let name = message
            .name
            .as_deref()
            .map_or(0, |n| self.count_text(n) + 1);
        self.count_text(&message.content) + name
    }
}

/// One token per character of content. Deterministic budgets for tests.
pub struct CharCounter;

impl TokenCounter for CharCounter {
    fn count_text(&self, text: &str) -> usize {
        text.chars().count()
    }

    fn count_message(&self, message: &PromptMessage) -> usize {
        self.count_text(&message.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_config::AppConfig;

    #[test]
    fn tiktoken_adds_framing_per_message() {
        let counter = TiktokenCounter::for_model("gpt-3.5-turbo").unwrap();
        let plain = PromptMessage::user(None, "hello world");
        let named = PromptMessage::user(Some("Ann".into()), "hello world");

        let base = counter.count_text("hello world") + counter.count_text("user");
        assert_eq!(counter.count_message(&plain), base + 4);
        assert_eq!(
            counter.count_message(&named),
            base + 4 + counter.count_text("Ann") + 1
        );
        assert_eq!(counter.reply_priming(), 2);
    }

    #[test]
    fn unknown_model_falls_back_to_cl100k() {
        let counter = TiktokenCounter::for_model("definitely-not-a-model").unwrap();
        assert!(counter.count_text("hello world") > 0);
        assert_eq!(counter.model(), "definitely-not-a-model");
    }

    #[test]
    fn reconfigure_rebinds_model() {
        let mut counter = TiktokenCounter::for_model("gpt-3.5-turbo").unwrap();
        let mut config = AppConfig::default();
        config.openai.model = "gpt-4".into();
        counter
            .reconfigure(&ConfigSnapshot { version: 2, config })
            .unwrap();
        assert_eq!(counter.model(), "gpt-4");
    }

    #[test]
    fn char_and_estimate_counters() {
        let message = PromptMessage::user(Some("Bo".into()), "0123456789");
        assert_eq!(CharCounter.count_message(&message), 10);
        assert_eq!(EstimateCounter.count_text("0123456789"), 3);
        assert_eq!(EstimateCounter.count_message(&message), 3 + 1 + 1);
        assert_eq!(EstimateCounter.reply_priming(), 0);
    }

    #[test]
    fn context_windows_by_family() {
        assert_eq!(context_window_for("gpt-3.5-turbo"), 4_096);
        assert_eq!(context_window_for("gpt-3.5-turbo-16k"), 16_384);
        assert_eq!(context_window_for("gpt-4"), 8_192);
        assert_eq!(context_window_for("gpt-4-32k"), 32_768);
        assert_eq!(context_window_for("gpt-4o-mini"), 128_000);
        assert_eq!(context_window_for("claude-3-opus-latest"), 100_000);
        assert_eq!(context_window_for("text-davinci-003"), 2_048);
    }
}
