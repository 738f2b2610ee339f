use std::sync::Arc;

use anyhow::Result;
use palaver_agents::{ConversationRuntime, GenerationOutcome};
use palaver_common::{AuthorId, Error, MessageId, Turn};
use palaver_config::{ConfigHandle, ConfigSnapshot, ProviderKind};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

/// A line typed at the chat prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Empty,
    Message(String),
    Command(SlashCommand),
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SlashCommand {
    Retry,
    ShowIdentity,
    SetIdentity { name: String, description: String },
    System(String),
    Models,
    SetModel(String),
    History(usize),
    Purge,
    Reload,
    Help,
    Quit,
}

const HELP: &str = "\
/retry                     regenerate the last reply
/identity [name | about]   show or set who you are
/system <text>             add a narration turn
/model [id]                list models or switch to one
/history [n]               show the last n turns (default 10)
/purge                     forget the whole conversation
/reload                    re-read the config file
/quit                      leave";

impl Input {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Input::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Input::Message(line.to_string());
        };

        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };

        let command = match (name, args) {
            ("retry", "") => SlashCommand::Retry,
            ("identity", "") => SlashCommand::ShowIdentity,
            ("identity", args) => match args.split_once('|') {
                Some((name, description)) if !name.trim().is_empty() => {
                    SlashCommand::SetIdentity {
                        name: name.trim().to_string(),
                        description: description.trim().to_string(),
                    }
                }
                _ => return Input::Invalid("usage: /identity <name> | <description>".into()),
            },
            ("system", "") => return Input::Invalid("usage: /system <text>".into()),
            ("system", text) => SlashCommand::System(text.to_string()),
            ("model" | "models", "") => SlashCommand::Models,
            ("model", id) => SlashCommand::SetModel(id.to_string()),
            ("history", "") => SlashCommand::History(10),
            ("history", n) => match n.parse() {
                Ok(n) => SlashCommand::History(n),
                Err(_) => return Input::Invalid(format!("not a count: {n}")),
            },
            ("purge", "") => SlashCommand::Purge,
            ("reload", "") => SlashCommand::Reload,
            ("help" | "?", _) => SlashCommand::Help,
            ("quit" | "exit", _) => SlashCommand::Quit,
            _ => return Input::Invalid(format!("unknown command /{name}; try /help")),
        };
        Input::Command(command)
    }
}

/// Interactive conversation between the local user and the bot.
pub struct ChatSession {
    runtime: ConversationRuntime,
    config: Arc<ConfigHandle>,
    updates: watch::Receiver<Arc<ConfigSnapshot>>,
    user_id: AuthorId,
    user_name: String,
    last_id: i64,
}

impl ChatSession {
    pub fn new(
        runtime: ConversationRuntime,
        config: Arc<ConfigHandle>,
        user_id: AuthorId,
        user_name: String,
    ) -> Result<Self> {
        let last_id = runtime
            .history(0)?
            .iter()
            .map(|t| t.message_id.get())
            .max()
            .unwrap_or(0);
        let updates = config.subscribe();

        Ok(Self {
            runtime,
            config,
            updates,
            user_id,
            user_name,
            last_id,
        })
    }

    fn next_message_id(&mut self) -> MessageId {
        self.last_id += 1;
        MessageId::new(self.last_id)
    }

    fn bot_name(&self) -> String {
        self.runtime.snapshot().config.bot.name.clone()
    }

    pub async fn run(&mut self) -> Result<()> {
        println!(
            "Chatting with {} as {}. Type /help for commands.",
            self.bot_name(),
            self.user_name
        );

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("> ");
            std::io::Write::flush(&mut std::io::stdout())?;

            let Some(line) = lines.next_line().await? else {
                break;
            };
            self.apply_config_updates();

            match Input::parse(&line) {
                Input::Empty => {}
                Input::Invalid(msg) => println!("{msg}"),
                Input::Message(text) => self.send(&text).await,
                Input::Command(SlashCommand::Quit) => break,
                Input::Command(command) => {
                    if let Err(e) = self.command(command).await {
                        println!("error: {e}");
                    }
                }
            }
        }

        info!("chat session ended");
        Ok(())
    }

    /// Pick up snapshots published by the file watcher or by `/model`.
    fn apply_config_updates(&mut self) {
        if !self.updates.has_changed().unwrap_or(false) {
            return;
        }
        let snapshot = self.updates.borrow_and_update().clone();
        if let Err(e) = self.runtime.reconfigure(snapshot) {
            warn!("could not apply new config: {}", e);
        }
    }

    async fn send(&mut self, text: &str) {
        let message_id = self.next_message_id();
        match self.runtime.respond(self.user_id, text, message_id).await {
            Ok(outcome) => self.post_reply(outcome).await,
            Err(e) => report(&e),
        }
    }

    async fn post_reply(&mut self, outcome: GenerationOutcome) {
        println!("{}: {}", self.bot_name(), outcome.text);
        if outcome.truncated {
            println!("(older messages were left out to fit the model's context window)");
        }

        let reply_id = self.next_message_id();
        if let Err(e) = self.runtime.commit_reply(reply_id, &outcome.text).await {
            report(&e);
        }
    }

    async fn command(&mut self, command: SlashCommand) -> Result<()> {
        match command {
            SlashCommand::Retry => {
                let (outcome, _) = self.runtime.retry_last(Some(self.user_id)).await?;
                self.post_reply(outcome).await;
            }
            SlashCommand::ShowIdentity => match self.runtime.identity(self.user_id)? {
                Some(identity) => println!("{}: {}", identity.name, identity.description),
                None => println!("no identity set; use /identity <name> | <description>"),
            },
            SlashCommand::SetIdentity { name, description } => {
                self.runtime
                    .set_identity(self.user_id, &name, &description)?;
                println!("identity saved for {name}");
            }
            SlashCommand::System(text) => {
                let message_id = self.next_message_id();
                self.runtime.record_system(&text, message_id).await?;
            }
            SlashCommand::Models => {
                let current = self.runtime.snapshot().config.active_model().to_string();
                for model in self.runtime.list_models().await? {
                    let marker = if model == current { "*" } else { " " };
                    println!("{marker} {model}");
                }
            }
            SlashCommand::SetModel(id) => {
                self.runtime.set_model(&id).await?;
                let provider = self.runtime.snapshot().config.bot.provider;
                self.config.update(|config| match provider {
                    ProviderKind::OpenAi => config.openai.model = id.clone(),
                    ProviderKind::Anthropic => config.anthropic.model = id.clone(),
                })?;
                println!("model set to {id}");
            }
            SlashCommand::History(count) => {
                let bot_name = self.bot_name();
                for turn in self.runtime.history(count)? {
                    let line = format_turn(&turn, self.runtime.bot_id(), &bot_name, &self.user_name);
                    println!("{line}");
                }
            }
            SlashCommand::Purge => {
                self.runtime.purge()?;
                println!("conversation forgotten");
            }
            SlashCommand::Reload => {
                let snapshot = self.config.reload()?;
                println!("loaded config v{}", snapshot.version);
            }
            SlashCommand::Help => println!("{HELP}"),
            SlashCommand::Quit => {}
        }
        Ok(())
    }
}

fn report(error: &Error) {
    match error {
        Error::ConfigurationTooLarge { .. } => println!("config problem: {error}"),
        Error::EmptyCompletion => println!("the model had nothing to say; try /retry"),
        other => println!("error: {other}"),
    }
}

/// One line of history as shown to the user.
pub fn format_turn(turn: &Turn, bot_id: AuthorId, bot_name: &str, user_name: &str) -> String {
    if turn.author_id.is_system() {
        format!("* {}", turn.content)
    } else if turn.author_id == bot_id {
        format!("{bot_name}: {}", turn.content)
    } else {
        format!("{user_name}: {}", turn.content)
    }
}
