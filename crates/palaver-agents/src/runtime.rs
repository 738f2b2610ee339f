use std::sync::Arc;

use palaver_common::{AuthorId, Error, MessageId, Result, Turn};
use palaver_config::ConfigSnapshot;
use palaver_db::{Identity, MemoryDb};
use tracing::{debug, info, instrument, warn};

use crate::client::CompletionClient;
use crate::context::{BuiltContext, ContextBuilder, ContextSettings, UserDirectory};
use crate::tokenizer::{TokenCounter, context_window_for, counter_for};

/// A generated reply, not yet committed to the log.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub text: String,
    pub context_tokens: usize,
    /// History had to be cut to fit the model's window.
    pub truncated: bool,
    /// Older turns pulled in by similarity.
    pub recalled: usize,
}

/// Drives one conversation: records turns, keeps the embedding index in
/// step with the log, and produces replies.
///
/// Calls for one conversation must not overlap; run one runtime per
/// conversation and drive it from a single task.
pub struct ConversationRuntime {
    db: MemoryDb,
    client: CompletionClient,
    counter: Box<dyn TokenCounter>,
    users: Arc<dyn UserDirectory>,
    bot_id: AuthorId,
    snapshot: Arc<ConfigSnapshot>,
}

impl ConversationRuntime {
    pub fn new(
        db: MemoryDb,
        snapshot: Arc<ConfigSnapshot>,
        bot_id: AuthorId,
        users: Arc<dyn UserDirectory>,
    ) -> Result<Self> {
        let client = CompletionClient::from_config(&snapshot.config)?;
        let counter = counter_for(&snapshot.config)?;
        Ok(Self::with_parts(db, snapshot, bot_id, users, client, counter))
    }

    /// Assemble a runtime from already-built collaborators.
    pub fn with_parts(
        db: MemoryDb,
        snapshot: Arc<ConfigSnapshot>,
        bot_id: AuthorId,
        users: Arc<dyn UserDirectory>,
        client: CompletionClient,
        counter: Box<dyn TokenCounter>,
    ) -> Self {
        info!(
            "conversation runtime ready: provider={}, model={}, embeddings={}",
            client.provider().provider_id(),
            client.provider().current_model(),
            client.embeddings_enabled()
        );
        Self {
            db,
            client,
            counter,
            users,
            bot_id,
            snapshot,
        }
    }

    pub fn db(&self) -> &MemoryDb {
        &self.db
    }

    pub fn bot_id(&self) -> AuthorId {
        self.bot_id
    }

    pub fn snapshot(&self) -> &Arc<ConfigSnapshot> {
        &self.snapshot
    }

    /// The model's total window (M), honouring `llm.context_window`.
    pub fn context_window(&self) -> usize {
        self.snapshot
            .config
            .llm
            .context_window
            .unwrap_or_else(|| context_window_for(self.client.provider().current_model()))
    }

    fn settings(&self) -> ContextSettings {
        ContextSettings::from_config(&self.snapshot.config, self.bot_id, self.context_window())
    }

    /// Append a posted message and index it.
    pub async fn record_message(
        &self,
        author_id: AuthorId,
        content: &str,
        message_id: MessageId,
    ) -> Result<()> {
        let turn = Turn::new(author_id, content, message_id);
        self.db.messages().append_turn(&turn)?;
        self.index_turn(&turn).await;
        Ok(())
    }

    /// Append a turn that was spoken rather than posted. It has no platform
    /// message and is never embedded.
    pub async fn record_speech(&self, author_id: AuthorId, content: &str) -> Result<()> {
        self.record_message(author_id, content, MessageId::EPHEMERAL)
            .await
    }

    /// Append a speaker-less narration turn.
    pub async fn record_system(&self, content: &str, message_id: MessageId) -> Result<()> {
        self.record_message(AuthorId::SYSTEM, content, message_id)
            .await
    }

    /// Embed a turn if embeddings are on. Failures are logged and swallowed;
    /// the turn stays in the log either way.
    async fn index_turn(&self, turn: &Turn) {
        if !self.client.embeddings_enabled() || turn.message_id.is_ephemeral() {
            return;
        }

        match self.client.embed(&turn.content).await {
            Ok(vector) => {
                if let Err(e) = self.db.embeddings().insert(
                    turn.message_id,
                    turn.author_id,
                    &turn.content,
                    &vector,
                ) {
                    warn!("failed to store embedding for {}: {}", turn.message_id, e);
                }
            }
            Err(e) => warn!("failed to embed message {}: {}", turn.message_id, e),
        }
    }

    /// The prompt that `generate` would send right now.
    pub fn build_context(&self, invoker: Option<AuthorId>) -> Result<BuiltContext> {
        let settings = self.settings();
        ContextBuilder::new(&self.db, self.counter.as_ref(), self.users.as_ref(), &settings)
            .build(invoker)
    }

    #[instrument(skip(self), fields(invoker = ?invoker))]
    pub async fn generate(&self, invoker: Option<AuthorId>) -> Result<GenerationOutcome> {
        let context = self.build_context(invoker)?;
        let text = self.client.complete(&context).await?;

        debug!(
            "generated {} chars from {} context tokens",
            text.len(),
            context.token_count
        );

        Ok(GenerationOutcome {
            text,
            context_tokens: context.token_count,
            truncated: context.truncated,
            recalled: context.recalled,
        })
    }

    /// Record an incoming message and generate a reply to it. If generation
    /// fails the message is taken back out of the log.
    pub async fn respond(
        &self,
        author_id: AuthorId,
        content: &str,
        message_id: MessageId,
    ) -> Result<GenerationOutcome> {
        self.record_message(author_id, content, message_id).await?;

        match self.generate(Some(author_id)).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if message_id.is_ephemeral() {
                    warn!("generation failed; ephemeral turn cannot be rolled back");
                } else {
                    self.db.messages().remove(message_id)?;
                    info!("generation failed, rolled back message {}", message_id);
                }
                Err(e)
            }
        }
    }

    /// Store the bot's reply once it has been posted as `message_id`.
    pub async fn commit_reply(&self, message_id: MessageId, text: &str) -> Result<()> {
        self.record_message(self.bot_id, text, message_id).await
    }

    /// Regenerate the bot's last reply. When the newest turn is the bot's it
    /// is removed first; the id of the removed turn is returned alongside.
    pub async fn retry_last(
        &self,
        invoker: Option<AuthorId>,
    ) -> Result<(GenerationOutcome, Option<MessageId>)> {
        let mut replaced = None;
        if let Some(last) = self.db.messages().last()?
            && last.author_id == self.bot_id
        {
            self.db.messages().remove(last.message_id)?;
            replaced = Some(last.message_id);
        }

        let outcome = self.generate(invoker).await?;
        Ok((outcome, replaced))
    }

    /// Apply an edit made on the platform. Returns whether the turn existed.
    pub async fn on_edit(&self, message_id: MessageId, content: &str) -> Result<bool> {
        if !self.db.messages().edit(message_id, content)? {
            return Ok(false);
        }
        if let Some(turn) = self.db.messages().get(message_id)? {
            self.index_turn(&turn).await;
        }
        Ok(true)
    }

    /// Apply a deletion made on the platform.
    pub fn on_delete(&self, message_id: MessageId) -> Result<usize> {
        self.db.messages().remove(message_id)
    }

    pub fn purge(&self) -> Result<()> {
        info!("purging conversation history");
        self.db.messages().clear()
    }

    pub fn history(&self, count: usize) -> Result<Vec<Turn>> {
        self.db.messages().recent(count)
    }

    pub fn set_identity(&self, user_id: AuthorId, name: &str, description: &str) -> Result<()> {
        self.db.identities().set(user_id, name, description)
    }

    pub fn identity(&self, user_id: AuthorId) -> Result<Option<Identity>> {
        self.db.identities().get(user_id)
    }

    pub async fn list_models(&self) -> Result<Vec<String>> {
        self.client.provider().list_models().await
    }

    /// Switch the active model. The id must be one the provider offers.
    pub async fn set_model(&mut self, model_id: &str) -> Result<()> {
        let models = self.list_models().await?;
        if !models.iter().any(|m| m == model_id) {
            return Err(Error::NotFound(format!("model {model_id}")));
        }

        self.client.provider_mut().set_model(model_id);

        let mut config = self.snapshot.config.clone();
        match config.bot.provider {
            palaver_config::ProviderKind::OpenAi => config.openai.model = model_id.to_string(),
            palaver_config::ProviderKind::Anthropic => {
                config.anthropic.model = model_id.to_string()
            }
        }
        self.snapshot = Arc::new(ConfigSnapshot {
            version: self.snapshot.version,
            config,
        });
        self.counter.reconfigure(&self.snapshot)?;
        Ok(())
    }

    /// Adopt a newer config snapshot. Stale snapshots are ignored.
    pub fn reconfigure(&mut self, snapshot: Arc<ConfigSnapshot>) -> Result<()> {
        if snapshot.version < self.snapshot.version {
            debug!(
                "ignoring stale config v{} (have v{})",
                snapshot.version, self.snapshot.version
            );
            return Ok(());
        }

        let provider_changed = snapshot.config.bot.provider != self.snapshot.config.bot.provider;
        self.client.reconfigure(&snapshot)?;
        if provider_changed {
            self.counter = counter_for(&snapshot.config)?;
        } else {
            self.counter.reconfigure(&snapshot)?;
        }

        info!("runtime reconfigured to config v{}", snapshot.version);
        self.snapshot = snapshot;
        Ok(())
    }
}
