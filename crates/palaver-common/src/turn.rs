use serde::{Deserialize, Serialize};

use crate::types::{AuthorId, MessageId};

/// One entry of the conversation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub author_id: AuthorId,
    pub content: String,
    pub message_id: MessageId,
}

impl Turn {
    pub fn new(author_id: AuthorId, content: impl Into<String>, message_id: MessageId) -> Self {
        Self {
            author_id,
            content: content.into(),
            message_id,
        }
    }

    /// A narration turn with no speaker.
    pub fn system(content: impl Into<String>, message_id: MessageId) -> Self {
        Self::new(AuthorId::SYSTEM, content, message_id)
    }

    /// A turn that was spoken but never posted as a platform message.
    pub fn ephemeral(author_id: AuthorId, content: impl Into<String>) -> Self {
        Self::new(author_id, content, MessageId::EPHEMERAL)
    }

    pub fn has_speaker(&self) -> bool {
        !self.author_id.is_system()
    }
}
