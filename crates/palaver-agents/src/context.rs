use std::collections::HashMap;

use chrono::{DateTime, Local};
use palaver_common::{AuthorId, Error, MessageId, Result, Turn};
use palaver_config::AppConfig;
use palaver_db::{Identity, MemoryDb};
use tracing::{debug, warn};

use crate::providers::PromptMessage;
use crate::template::{self, TemplateSlots};
use crate::tokenizer::TokenCounter;

/// Display names as known to the chat platform.
pub trait UserDirectory: Send + Sync {
    fn display_name(&self, user_id: AuthorId) -> Option<String>;
}

/// A fixed id-to-name table.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    names: HashMap<AuthorId, String>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, user_id: AuthorId, name: impl Into<String>) -> Self {
        self.names.insert(user_id, name.into());
        self
    }
}

impl UserDirectory for StaticDirectory {
    fn display_name(&self, user_id: AuthorId) -> Option<String> {
        self.names.get(&user_id).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecallSettings {
    pub threshold: f32,
    pub max_results: usize,
}

/// Everything that shapes a context apart from the log itself.
#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub bot_id: AuthorId,
    pub bot_name: String,
    pub bot_identity: String,
    pub initial_prompt: String,
    pub reminder: Option<String>,
    /// Number of most recent turns always considered (R).
    pub recency_window: usize,
    /// Model context window (M).
    pub max_context_tokens: usize,
    /// Tokens held back for the reply (C).
    pub reserved_completion_tokens: usize,
    /// `None` disables semantic recall.
    pub recall: Option<RecallSettings>,
}

impl ContextSettings {
    pub fn from_config(config: &AppConfig, bot_id: AuthorId, max_context_tokens: usize) -> Self {
        let recall = config.recall.enabled.then_some(RecallSettings {
            threshold: config.recall.similarity_threshold,
            max_results: config.recall.max_results,
        });

        Self {
            bot_id,
            bot_name: config.bot.name.clone(),
            bot_identity: config.bot.identity.clone(),
            initial_prompt: config.bot.initial_prompt.clone(),
            reminder: config.bot.reminder.clone().filter(|r| !r.trim().is_empty()),
            recency_window: config.llm.context_messages,
            max_context_tokens,
            reserved_completion_tokens: config.llm.max_tokens,
            recall,
        }
    }

    /// Largest prompt allowed once the reply is reserved.
    pub fn prompt_budget(&self) -> usize {
        self.max_context_tokens
            .saturating_sub(self.reserved_completion_tokens)
    }
}

/// A prompt ready to send, with the bookkeeping that produced it.
#[derive(Debug, Clone)]
pub struct BuiltContext {
    pub messages: Vec<PromptMessage>,
    /// Total cost by the counter used, reply priming included.
    pub token_count: usize,
    /// History was cut short to fit the budget.
    pub truncated: bool,
    /// Recalled turns that made it into `messages`.
    pub recalled: usize,
}

/// Assembles the prompt for one generation from the stored conversation.
pub struct ContextBuilder<'a> {
    db: &'a MemoryDb,
    counter: &'a dyn TokenCounter,
    users: &'a dyn UserDirectory,
    settings: &'a ContextSettings,
    now: DateTime<Local>,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(
        db: &'a MemoryDb,
        counter: &'a dyn TokenCounter,
        users: &'a dyn UserDirectory,
        settings: &'a ContextSettings,
    ) -> Self {
        Self {
            db,
            counter,
            users,
            settings,
            now: Local::now(),
        }
    }

    /// Render time-based slots as of `now` instead of the wall clock.
    pub fn at(mut self, now: DateTime<Local>) -> Self {
        self.now = now;
        self
    }

    pub fn build(&self, invoker: Option<AuthorId>) -> Result<BuiltContext> {
        let mut identities = IdentityCache::new(self.db);
        let slots = self.slots(invoker, &mut identities)?;

        let initial = PromptMessage::system(template::render(&self.settings.initial_prompt, &slots));
        let reminder = self
            .settings
            .reminder
            .as_deref()
            .map(|r| PromptMessage::system(template::render_reminder(r, &slots)));

        let minimum = self.counter.count_message(&initial)
            + reminder
                .as_ref()
                .map_or(0, |r| self.counter.count_message(r))
            + self.counter.reply_priming();
        let budget = self.settings.max_context_tokens;
        let reserved = self.settings.reserved_completion_tokens;

        if minimum + reserved > budget {
            return Err(Error::ConfigurationTooLarge {
                tokens: minimum,
                limit: self.settings.prompt_budget(),
            });
        }

        let log = self.db.messages().all()?;
        let split = log.len().saturating_sub(self.settings.recency_window);
        let (older, recent) = log.split_at(split);

        let recalled = self.recall(older, recent)?;
        let recalled_count = recalled.len();

        let mut messages = vec![initial];
        let mut running = minimum;
        let mut truncated = false;
        let mut included_recalled = 0;

        for (index, turn) in recalled.iter().chain(recent.iter()).enumerate() {
            let message = self.render_turn(turn, &mut identities)?;
            let cost = self.counter.count_message(&message);

            if running + cost + reserved > budget {
                warn!(
                    "maximum token count reached ({} + {} + {} > {}); context will be shorter than expected",
                    running, cost, reserved, budget
                );
                truncated = true;
                break;
            }

            running += cost;
            messages.push(message);
            if index < recalled_count {
                included_recalled += 1;
            }
        }

        if let Some(reminder) = reminder {
            messages.push(reminder);
        }

        debug!(
            "calculated prompt token count: {} ({} messages, {} recalled)",
            running,
            messages.len(),
            included_recalled
        );

        Ok(BuiltContext {
            messages,
            token_count: running,
            truncated,
            recalled: included_recalled,
        })
    }

    fn slots(
        &self,
        invoker: Option<AuthorId>,
        identities: &mut IdentityCache<'_>,
    ) -> Result<TemplateSlots> {
        let (user_name, user_identity) = match invoker {
            Some(user_id) => match identities.get(user_id)? {
                Some(identity) => (identity.name, identity.description),
                None => {
                    let name = self
                        .users
                        .display_name(user_id)
                        .unwrap_or_else(|| "the user".to_string());
                    let nudge = template::identity_nudge(&name);
                    (name, nudge)
                }
            },
            None => ("the user".to_string(), String::new()),
        };

        Ok(TemplateSlots {
            bot_name: self.settings.bot_name.clone(),
            bot_identity: self.settings.bot_identity.clone(),
            user_name,
            user_identity,
            now: self.now,
        })
    }

    /// Older turns similar to the newest spoken turn, oldest first.
    fn recall(&self, older: &[Turn], recent: &[Turn]) -> Result<Vec<Turn>> {
        let Some(settings) = self.settings.recall else {
            return Ok(Vec::new());
        };
        if older.is_empty() {
            return Ok(Vec::new());
        }
        let Some(seed) = recent.iter().rev().find(|t| t.has_speaker()) else {
            return Ok(Vec::new());
        };

        let embeddings = self.db.embeddings();
        let query = match embeddings.require(seed.message_id) {
            Ok(vector) => vector,
            Err(e @ Error::MissingEmbedding(_)) => {
                warn!("skipping recall: {}", e);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let candidates: Vec<MessageId> = older.iter().map(|t| t.message_id).collect();
        let scored =
            embeddings.most_similar(&query, &candidates, settings.threshold, settings.max_results)?;

        let position: HashMap<MessageId, usize> = older
            .iter()
            .enumerate()
            .map(|(i, t)| (t.message_id, i))
            .collect();

        // Present the current text of each turn, in log order.
        let mut recalled: Vec<(usize, Turn)> = scored
            .into_iter()
            .filter_map(|s| {
                let index = *position.get(&s.turn.message_id)?;
                Some((index, older[index].clone()))
            })
            .collect();
        recalled.sort_by_key(|(index, _)| *index);

        debug!("recalled {} older turn(s)", recalled.len());
        Ok(recalled.into_iter().map(|(_, turn)| turn).collect())
    }

    fn render_turn(&self, turn: &Turn, identities: &mut IdentityCache<'_>) -> Result<PromptMessage> {
        if turn.author_id.is_system() {
            return Ok(PromptMessage::system(turn.content.clone()));
        }
        if turn.author_id == self.settings.bot_id {
            return Ok(PromptMessage::assistant(turn.content.clone()));
        }

        let name = match identities.get(turn.author_id)? {
            Some(identity) => Some(identity.name),
            None => self.users.display_name(turn.author_id),
        };
        Ok(PromptMessage::user(name, turn.content.clone()))
    }
}

/// Per-build memo of identity lookups.
struct IdentityCache<'a> {
    db: &'a MemoryDb,
    cache: HashMap<AuthorId, Option<Identity>>,
}

impl<'a> IdentityCache<'a> {
    fn new(db: &'a MemoryDb) -> Self {
        Self {
            db,
            cache: HashMap::new(),
        }
    }

    fn get(&mut self, user_id: AuthorId) -> Result<Option<Identity>> {
        if let Some(hit) = self.cache.get(&user_id) {
            return Ok(hit.clone());
        }
        let identity = self.db.identities().get(user_id)?;
        self.cache.insert(user_id, identity.clone());
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::PromptRole;
    use crate::tokenizer::CharCounter;
    use chrono::TimeZone;

    const BOT: AuthorId = AuthorId::new(0);
    const ANN: AuthorId = AuthorId::new(1);

    fn settings(initial: &str, window: usize, budget: usize) -> ContextSettings {
        ContextSettings {
            bot_id: BOT,
            bot_name: "Kit".into(),
            bot_identity: String::new(),
            initial_prompt: initial.into(),
            reminder: None,
            recency_window: window,
            max_context_tokens: budget,
            reserved_completion_tokens: 0,
            recall: None,
        }
    }

    fn users() -> StaticDirectory {
        StaticDirectory::new().with(ANN, "Ann")
    }

    fn build(db: &MemoryDb, settings: &ContextSettings, invoker: Option<AuthorId>) -> Result<BuiltContext> {
        let users = users();
        ContextBuilder::new(db, &CharCounter, &users, settings)
            .at(Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap())
            .build(invoker)
    }

    fn append(db: &MemoryDb, author: AuthorId, content: &str, id: i64) {
        db.messages()
            .append(author, content, MessageId::new(id))
            .unwrap();
    }

    fn contents(ctx: &BuiltContext) -> Vec<&str> {
        ctx.messages.iter().map(|m| m.content.as_str()).collect()
    }

    #[test]
    fn empty_log_yields_initial_prompt_only() {
        let db = MemoryDb::in_memory().unwrap();
        let ctx = build(&db, &settings("Hello {user_name}", 10, 100), Some(ANN)).unwrap();
        assert_eq!(contents(&ctx), vec!["Hello Ann"]);
        assert_eq!(ctx.token_count, 9);
        assert!(!ctx.truncated);
    }

    #[test]
    fn reminder_follows_history() {
        let db = MemoryDb::in_memory().unwrap();
        append(&db, ANN, "hi", 1);
        let mut s = settings("init", 10, 100);
        s.reminder = Some("be {bot_name}".into());

        let ctx = build(&db, &s, Some(ANN)).unwrap();
        assert_eq!(contents(&ctx), vec!["init", "hi", "Reminder: be Kit"]);
        assert_eq!(ctx.messages[2].role, PromptRole::System);
    }

    #[test]
    fn oversized_prompt_is_a_configuration_error() {
        let db = MemoryDb::in_memory().unwrap();
        let mut s = settings("0123456789", 10, 12);
        s.reminder = Some("abc".into());

        let err = build(&db, &s, None).unwrap_err();
        assert!(matches!(
            err,
            Error::ConfigurationTooLarge { tokens: 23, limit: 12 }
        ));
    }

    #[test]
    fn reserved_completion_counts_against_budget() {
        let db = MemoryDb::in_memory().unwrap();
        let mut s = settings("01234", 10, 10);
        s.reserved_completion_tokens = 6;
        assert!(matches!(
            build(&db, &s, None),
            Err(Error::ConfigurationTooLarge { tokens: 5, limit: 4 })
        ));
    }

    #[test]
    fn roles_follow_authors() {
        let db = MemoryDb::in_memory().unwrap();
        append(&db, ANN, "question", 1);
        append(&db, BOT, "answer", 2);
        append(&db, AuthorId::SYSTEM, "a bell rings", 3);
        append(&db, AuthorId::new(9), "stranger", 4);

        let ctx = build(&db, &settings("init", 10, 200), Some(ANN)).unwrap();
        let roles: Vec<PromptRole> = ctx.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                PromptRole::System,
                PromptRole::User,
                PromptRole::Assistant,
                PromptRole::System,
                PromptRole::User,
            ]
        );
        assert_eq!(ctx.messages[1].name.as_deref(), Some("Ann"));
        assert_eq!(ctx.messages[4].name, None);
    }

    #[test]
    fn identity_overrides_display_name_and_fills_slots() {
        let db = MemoryDb::in_memory().unwrap();
        db.identities().set(ANN, "Annabel", "a lighthouse keeper").unwrap();
        append(&db, ANN, "hello", 1);

        let ctx = build(&db, &settings("{user_name}: {user_identity}", 10, 200), Some(ANN)).unwrap();
        assert_eq!(ctx.messages[0].content, "Annabel: a lighthouse keeper");
        assert_eq!(ctx.messages[1].name.as_deref(), Some("Annabel"));
    }

    #[test]
    fn unset_identity_renders_nudge() {
        let db = MemoryDb::in_memory().unwrap();
        let ctx = build(&db, &settings("{user_identity}", 10, 500), Some(ANN)).unwrap();
        assert_eq!(ctx.messages[0].content, template::identity_nudge("Ann"));

        let ctx = build(&db, &settings("[{user_name}|{user_identity}]", 10, 500), None).unwrap();
        assert_eq!(ctx.messages[0].content, "[the user|]");
    }

    #[test]
    fn walk_stops_at_first_overflow() {
        let db = MemoryDb::in_memory().unwrap();
        append(&db, ANN, "aaaaa", 1);
        append(&db, ANN, "bbbbbbbbbbbbbbbbbbbb", 2);
        append(&db, ANN, "c", 3);

        let ctx = build(&db, &settings("init", 10, 15), None).unwrap();
        assert_eq!(contents(&ctx), vec!["init", "aaaaa"]);
        assert!(ctx.truncated);
        assert_eq!(ctx.token_count, 9);
    }

    #[test]
    fn recency_window_limits_history() {
        let db = MemoryDb::in_memory().unwrap();
        for i in 1..=5 {
            append(&db, ANN, &format!("t{i}"), i);
        }
        let ctx = build(&db, &settings("init", 2, 100), Some(ANN)).unwrap();
        assert_eq!(contents(&ctx), vec!["init", "t4", "t5"]);
    }

    #[test]
    fn recall_prepends_similar_older_turns_in_log_order() {
        let db = MemoryDb::in_memory().unwrap();
        let vectors: [(i64, &str, [f32; 2]); 5] = [
            (1, "about boats", [1.0, 0.1]),
            (2, "about cats", [0.0, 1.0]),
            (3, "more boats", [1.0, 0.2]),
            (4, "filler", [0.0, 1.0]),
            (5, "boats again?", [1.0, 0.15]),
        ];
        for (id, content, vector) in vectors {
            append(&db, ANN, content, id);
            db.embeddings()
                .insert(MessageId::new(id), ANN, content, &vector)
                .unwrap();
        }

        let mut s = settings("init", 2, 500);
        s.recall = Some(RecallSettings {
            threshold: 0.83,
            max_results: 5,
        });

        let ctx = build(&db, &s, Some(ANN)).unwrap();
        assert_eq!(
            contents(&ctx),
            vec!["init", "about boats", "more boats", "filler", "boats again?"]
        );
        assert_eq!(ctx.recalled, 2);
    }

    #[test]
    fn missing_seed_embedding_skips_recall() {
        let db = MemoryDb::in_memory().unwrap();
        append(&db, ANN, "old", 1);
        db.embeddings()
            .insert(MessageId::new(1), ANN, "old", &[1.0, 0.0])
            .unwrap();
        append(&db, ANN, "new", 2);

        let mut s = settings("init", 1, 500);
        s.recall = Some(RecallSettings {
            threshold: 0.0,
            max_results: 5,
        });

        let ctx = build(&db, &s, Some(ANN)).unwrap();
        assert_eq!(contents(&ctx), vec!["init", "new"]);
        assert_eq!(ctx.recalled, 0);
    }

    #[test]
    fn recall_seed_skips_speakerless_turns() {
        let db = MemoryDb::in_memory().unwrap();
        for (id, author, content, vector) in [
            (1, ANN, "lighthouse lore", [1.0_f32, 0.0]),
            (2, ANN, "tell me about lighthouses", [0.95, 0.05]),
            (3, AuthorId::SYSTEM, "thunder rolls", [0.0, 1.0]),
        ] {
            append(&db, author, content, id);
            db.embeddings()
                .insert(MessageId::new(id), author, content, &vector)
                .unwrap();
        }

        let mut s = settings("init", 2, 500);
        s.recall = Some(RecallSettings {
            threshold: 0.83,
            max_results: 5,
        });

        let ctx = build(&db, &s, Some(ANN)).unwrap();
        assert_eq!(ctx.recalled, 1);
        assert_eq!(ctx.messages[1].content, "lighthouse lore");
    }
}
