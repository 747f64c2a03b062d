//! Wire shapes of the chat API
//!
//! Requests go out as one JSON body; replies come back as a stream of
//! newline separated [`ChatRecord`] objects.

use serde::{Deserialize, Serialize};

/// One role-tagged turn in an outbound transcript
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub role: String,
    pub content: String,
}

/// Body of `POST <base>/chat`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<TranscriptEntry>,
}

/// One decoded record of the response stream
///
/// Every field is optional on the wire; a record without any recognised
/// field decodes to the default value and is a no-op downstream.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ChatRecord {
    pub model: String,
    pub done: bool,
    pub message: RecordMessage,
    /// Server side failure report, e.g. an unknown model
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct RecordMessage {
    pub role: String,
    pub content: String,
}

impl ChatRecord {
    pub fn role(&self) -> &str {
        &self.message.role
    }

    pub fn content(&self) -> &str {
        &self.message.content
    }

    pub fn has_content(&self) -> bool {
        !self.message.content.is_empty()
    }
}
