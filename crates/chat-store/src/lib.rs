//! # Chat Store
//!
//! Durable storage for chats and their messages. Writes are grouped into
//! implicit transactions that commit after a short quiet period.

pub mod error;
pub mod sqlite;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use sqlite::SqliteChatStore;
pub use store::ChatStore;
