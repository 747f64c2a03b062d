//! Message - one turn in a conversation
//!
//! A message is created in memory first and only receives a durable
//! [`MessageId`] once the store has written it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";
pub const ROLE_SYSTEM: &str = "system";

/// Durable identity of a stored message
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageId(pub i64);

/// Durable identity of a stored chat
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ChatId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single conversation turn
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    /// `None` until the message has been persisted
    pub id: Option<MessageId>,
    /// Generating model, empty for user turns
    pub model: String,
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create an empty message for `role`, stamped with the current time
    pub fn new(role: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: None,
            model: model.into(),
            role: role.into(),
            content: String::new(),
            timestamp: Utc::now(),
        }
    }

    /// Create a user turn carrying `content`
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::new(ROLE_USER, String::new())
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    pub fn is_user(&self) -> bool {
        self.role == ROLE_USER
    }
}

/// A stored conversation header
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Chat {
    pub id: ChatId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Chat {
    /// Longest name derived from a prompt, counted in characters
    pub const NAME_LIMIT: usize = 64;

    /// Name for a chat opened by `prompt`: its leading characters
    pub fn name_from_prompt(prompt: &str) -> String {
        prompt.chars().take(Self::NAME_LIMIT).collect()
    }
}
