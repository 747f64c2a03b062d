//! chat_core - Core types for the streaming chat client
//!
//! This crate provides the foundational types shared by the other chat crates:
//! - `message` - conversation turns, chat identities and role names
//! - `wire` - request and response-record shapes of the chat API
//! - `config` - resolved connection and session settings

pub mod config;
pub mod message;
pub mod paths;
pub mod wire;

// Re-export commonly used types
pub use config::{Config, ConfigError};
pub use message::{Chat, ChatId, Message, MessageId, ROLE_ASSISTANT, ROLE_SYSTEM, ROLE_USER};
pub use wire::{ChatRecord, ChatRequest, RecordMessage, TranscriptEntry};
