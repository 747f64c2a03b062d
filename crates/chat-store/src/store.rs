use async_trait::async_trait;
use chat_core::{Chat, ChatId, Message, MessageId};

use crate::error::StoreResult;

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Create or migrate the schema
    async fn init(&self) -> StoreResult<()>;

    async fn create_chat(&self, name: &str) -> StoreResult<ChatId>;

    /// All chats, newest first
    async fn list_chats(&self) -> StoreResult<Vec<Chat>>;

    /// Delete a chat together with its messages
    async fn remove_chat(&self, chat_id: ChatId) -> StoreResult<()>;

    /// Delete every chat and message
    async fn clear(&self) -> StoreResult<()>;

    /// Insert `message` when it has no id, otherwise replace the row with its id
    async fn insert_or_update_message(
        &self,
        chat_id: ChatId,
        message: &Message,
    ) -> StoreResult<MessageId>;

    /// Messages of `chat_id`, oldest first
    async fn load_messages(&self, chat_id: ChatId) -> StoreResult<Vec<Message>>;

    async fn delete_message(&self, id: MessageId) -> StoreResult<()>;

    /// Open a write transaction unless one is already open
    async fn begin(&self) -> StoreResult<()>;

    /// Commit the open transaction, if any
    async fn commit(&self) -> StoreResult<()>;
}
