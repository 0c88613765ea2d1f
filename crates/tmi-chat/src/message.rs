//! Chat message and event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single chat line as retained by the clip keeper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Platform message id, unique per message.
    pub id: String,
    /// Author login (lowercase), the name moderation events refer to.
    pub author_name: String,
    pub text: String,
    /// Server send time.
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(
        id: impl Into<String>,
        author_name: impl Into<String>,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            author_name: author_name.into(),
            text: text.into(),
            timestamp,
        }
    }
}

/// Items delivered by a chat connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatEvent {
    Message(ChatMessage),
    /// A moderator deleted a message by, or timed out/banned, `username`.
    MessageRemoved { username: String },
}
