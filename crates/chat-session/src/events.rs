use chat_core::{ChatId, Message};

use crate::exchange::ExchangeId;

/// Notifications published by a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The message log changed; read it again
    ConversationChanged,
    CurrentChatChanged(Option<ChatId>),
    AutoAnswerModelChanged(Option<String>),
    ExchangeFinished(ExchangeId),
    ExchangeFailed { exchange: ExchangeId, error: String },
    /// The server reported an error inside the response stream
    ServerError { exchange: ExchangeId, error: String },
}

/// Point-in-time copy of session state
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub current_chat: Option<ChatId>,
    pub auto_answer_model: Option<String>,
    pub streaming: bool,
    pub messages: Vec<Message>,
}

/// Prompt to send on behalf of the auto-answer partner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowUp {
    /// Model of the exchange that produced the reply
    pub model: String,
    pub prompt: String,
    pub auto_chained: bool,
}
