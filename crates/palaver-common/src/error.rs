use thiserror::Error;

use crate::types::MessageId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    /// The initial prompt (plus reminder) cannot fit the model's window on its own.
    #[error(
        "initial prompt and reminder need {tokens} tokens but only {limit} are available; \
         shorten the initial prompt or reminder"
    )]
    ConfigurationTooLarge { tokens: usize, limit: usize },

    #[error("database error: {0}")]
    Database(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("transient connection failure: {0}")]
    TransientConnection(String),

    #[error("model returned an empty completion")]
    EmptyCompletion,

    #[error("no embedding stored for message {0}")]
    MissingEmbedding(MessageId),

    #[error("embedding for message {0} already exists")]
    DuplicateEmbedding(MessageId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the failed operation may succeed if issued again unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientConnection(_))
    }
}
