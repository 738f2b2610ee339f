mod chat;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use palaver_agents::{ConversationRuntime, StaticDirectory, build_provider};
use palaver_common::AuthorId;
use palaver_config::{AppConfig, ConfigHandle, ConfigLoader};
use palaver_db::MemoryDb;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::chat::{ChatSession, format_turn};

const BOT_ID: AuthorId = AuthorId::new(0);
const USER_ID: AuthorId = AuthorId::new(1);
const DB_FILE: &str = "conversation.db";

#[derive(Parser)]
#[command(
    name = "palaver",
    version,
    about = "Palaver - a chat bot that remembers the conversation"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error); overrides `log_level` in config
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Directory holding config.yml (defaults to ~/.config/palaver)
    #[arg(long, env = "PALAVER_CONFIG_DIR", global = true)]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file and create the data directory
    Init,

    /// Start an interactive chat
    Chat {
        /// Name the bot knows you by until you set an identity
        #[arg(long, default_value = "User")]
        name: String,
    },

    /// Print recent conversation history
    History {
        /// Number of turns to show (0 for all)
        #[arg(long, short, default_value = "20")]
        count: usize,
    },

    /// Manage the identity the bot knows you by
    Identity {
        #[command(subcommand)]
        action: IdentityCommands,
    },

    /// Forget the whole conversation
    Purge {
        /// Skip the confirmation
        #[arg(long)]
        yes: bool,
    },

    /// List models offered by the configured provider
    Models,

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum IdentityCommands {
    /// Show the stored identity
    Show,
    /// Set name and description
    Set { name: String, description: String },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective config with secrets hidden
    Show,
    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let loader = match cli.config_dir {
        Some(dir) => ConfigLoader::with_dir(dir),
        None => ConfigLoader::new(),
    };

    let level = cli
        .log_level
        .or_else(|| loader.load().ok().and_then(|c| c.log_level))
        .unwrap_or_else(|| "warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level)),
        )
        .init();

    match cli.command {
        Commands::Init => init(&loader),
        command => run(command, Arc::new(ConfigHandle::load(loader)?)).await,
    }
}

async fn run(command: Commands, handle: Arc<ConfigHandle>) -> Result<()> {
    let config = handle.current().config.clone();

    match command {
        Commands::Init => init(handle.loader())?,
        Commands::Chat { name } => {
            let db = open_db(&handle, &config)?;
            let users = StaticDirectory::new().with(USER_ID, name.clone());
            let runtime = ConversationRuntime::new(db, handle.current(), BOT_ID, Arc::new(users))?;

            // the watcher must stay alive for the length of the session
            let _watcher = match handle.watch_file() {
                Ok((watcher, _task)) => Some(watcher),
                Err(e) => {
                    warn!("live config reload unavailable: {}", e);
                    None
                }
            };

            let mut session = ChatSession::new(runtime, Arc::clone(&handle), USER_ID, name)?;
            session.run().await?;
        }
        Commands::History { count } => {
            let db = open_db(&handle, &config)?;
            let user_name = db
                .identities()
                .get(USER_ID)?
                .map_or_else(|| "User".to_string(), |i| i.name);
            let turns = db.messages().recent(count)?;
            if turns.is_empty() {
                println!("(no conversation yet)");
            }
            for turn in turns {
                println!("{}", format_turn(&turn, BOT_ID, &config.bot.name, &user_name));
            }
        }
        Commands::Identity { action } => {
            let db = open_db(&handle, &config)?;
            match action {
                IdentityCommands::Show => match db.identities().get(USER_ID)? {
                    Some(identity) => println!("{}: {}", identity.name, identity.description),
                    None => println!("no identity set"),
                },
                IdentityCommands::Set { name, description } => {
                    db.identities().set(USER_ID, &name, &description)?;
                    println!("identity saved for {name}");
                }
            }
        }
        Commands::Purge { yes } => {
            if !yes {
                anyhow::bail!("this deletes the whole conversation; re-run with --yes");
            }
            let db = open_db(&handle, &config)?;
            db.messages().clear()?;
            println!("conversation forgotten");
        }
        Commands::Models => {
            let provider = build_provider(&config)?;
            let current = provider.current_model().to_string();
            for model in provider.list_models().await? {
                let marker = if model == current { "*" } else { " " };
                println!("{marker} {model}");
            }
        }
        Commands::Config { action } => match action {
            ConfigCommands::Show => {
                print!("{}", serde_yaml::to_string(&redacted(config))?);
            }
            ConfigCommands::Path => match handle.loader().config_path() {
                Some(path) => println!("{}", path.display()),
                None => println!(
                    "no config file in {} (using defaults)",
                    handle.loader().config_dir().display()
                ),
            },
        },
    }

    Ok(())
}

fn init(loader: &ConfigLoader) -> Result<()> {
    println!("Config directory: {}", loader.config_dir().display());
    let config = match loader.config_path() {
        Some(path) => {
            println!("Keeping existing {}", path.display());
            loader.load()?
        }
        None => {
            let config = AppConfig::default();
            let path = loader.save(&config)?;
            println!("Wrote {}", path.display());
            config
        }
    };
    loader.ensure_dirs(&config)?;
    println!("Data directory: {}", loader.data_dir(&config).display());
    println!("Set OPENAI_API_KEY (or edit the config) and run `palaver chat`.");
    Ok(())
}

fn open_db(handle: &ConfigHandle, config: &AppConfig) -> Result<MemoryDb> {
    let loader = handle.loader();
    loader.ensure_dirs(config)?;
    let path = loader.data_dir(config).join(DB_FILE);
    MemoryDb::open(&path).with_context(|| format!("opening {}", path.display()))
}

fn redacted(mut config: AppConfig) -> AppConfig {
    let hide = |key: &mut Option<String>| {
        if key.is_some() {
            *key = Some("********".into());
        }
    };
    hide(&mut config.openai.api_key);
    hide(&mut config.anthropic.api_key);
    config
}
