//! Message module - conversation turns and chat identities
//!
//! Shared message types used across the system.

mod turn;

pub use turn::{Chat, ChatId, Message, MessageId, ROLE_ASSISTANT, ROLE_SYSTEM, ROLE_USER};
