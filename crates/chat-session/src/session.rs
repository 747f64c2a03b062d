//! Session orchestrator
//!
//! Owns the message log of the current chat and at most one active
//! exchange. Starting a new exchange supersedes the active one: the old
//! reply keeps streaming into its own messages and is still saved when it
//! completes, but it no longer drives the session.

use std::collections::HashMap;
use std::sync::Arc;

use chat_core::{
    Chat, ChatId, ChatRequest, Message, TranscriptEntry, ROLE_ASSISTANT, ROLE_SYSTEM, ROLE_USER,
};
use chat_store::ChatStore;
use tokio::sync::broadcast;

use crate::error::{Result, SessionError};
use crate::events::{FollowUp, SessionEvent, SessionSnapshot};
use crate::exchange::{Exchange, ExchangeId, OutboundExchange};

const EVENT_CAPACITY: usize = 256;

pub struct ChatSession {
    store: Arc<dyn ChatStore>,
    events: broadcast::Sender<SessionEvent>,
    current_chat: Option<ChatId>,
    auto_answer_model: Option<String>,
    messages: Vec<Message>,
    active: Option<Exchange>,
    superseded: HashMap<ExchangeId, Exchange>,
    next_exchange: u64,
}

impl ChatSession {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self::with_event_capacity(store, EVENT_CAPACITY)
    }

    pub fn with_event_capacity(store: Arc<dyn ChatStore>, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            store,
            events,
            current_chat: None,
            auto_answer_model: None,
            messages: Vec::new(),
            active: None,
            superseded: HashMap::new(),
            next_exchange: 1,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<SessionEvent> {
        self.events.clone()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn current_chat(&self) -> Option<ChatId> {
        self.current_chat
    }

    pub fn auto_answer_model(&self) -> Option<&str> {
        self.auto_answer_model.as_deref()
    }

    pub fn active_exchange(&self) -> Option<ExchangeId> {
        self.active.as_ref().map(|exchange| exchange.id)
    }

    pub fn is_streaming(&self) -> bool {
        self.active.is_some()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            current_chat: self.current_chat,
            auto_answer_model: self.auto_answer_model.clone(),
            streaming: self.is_streaming(),
            messages: self.messages.clone(),
        }
    }

    /// Configure the auto-answer partner; `None` or a blank name disables chaining
    pub fn set_auto_answer_model(&mut self, model: Option<String>) {
        let model = model
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty());
        if self.auto_answer_model == model {
            return;
        }
        log::info!("Auto-answer partner set to {:?}", model);
        self.auto_answer_model = model.clone();
        self.emit(SessionEvent::AutoAnswerModelChanged(model));
    }

    /// Start an exchange for `prompt` and return the request to issue.
    ///
    /// A human prompt is appended to the log and saved right away. Chained
    /// prompts are not; the reply they answer is already the last message.
    pub async fn send_prompt(
        &mut self,
        model: &str,
        prompt: &str,
        human: bool,
        auto_chained: bool,
    ) -> Result<OutboundExchange> {
        if let Err(e) = self.store.begin().await {
            log::error!("Failed to open chat store transaction: {}", e);
        }

        let chat_id = match self.current_chat {
            Some(chat_id) => chat_id,
            None => {
                let chat_id = self
                    .store
                    .create_chat(&Chat::name_from_prompt(prompt))
                    .await?;
                log::info!("Created chat {}", chat_id);
                self.current_chat = Some(chat_id);
                self.emit(SessionEvent::CurrentChatChanged(Some(chat_id)));
                chat_id
            }
        };

        let request_model = match (&self.auto_answer_model, auto_chained) {
            (Some(partner), true) => partner.clone(),
            _ => model.to_string(),
        };

        if human {
            self.messages.push(Message::user(prompt));
            let index = self.messages.len() - 1;
            match self
                .store
                .insert_or_update_message(chat_id, &self.messages[index])
                .await
            {
                Ok(id) => self.messages[index].id = Some(id),
                Err(e) => log::error!("Failed to save prompt in chat {}: {}", chat_id, e),
            }
        }

        let request = ChatRequest {
            model: request_model,
            messages: build_transcript(&self.messages, human),
        };

        if let Some(previous) = self.active.take() {
            log::debug!("Exchange {} superseded", previous.id);
            self.superseded.insert(previous.id, previous);
        }

        let id = ExchangeId(self.next_exchange);
        self.next_exchange += 1;
        self.active = Some(Exchange::new(id, chat_id, model.to_string(), auto_chained));
        log::info!(
            "Exchange {} started with model '{}' ({} messages, human: {}, auto-chained: {})",
            id,
            request.model,
            request.messages.len(),
            human,
            auto_chained
        );

        self.emit(SessionEvent::ConversationChanged);
        Ok(OutboundExchange { id, request })
    }

    /// Feed response bytes delivered for exchange `id`
    pub fn on_chunk(&mut self, id: ExchangeId, bytes: &[u8]) {
        if let Some(exchange) = self.active.as_mut().filter(|exchange| exchange.id == id) {
            absorb(exchange, Some(bytes), &mut self.messages, true, &self.events);
        } else if let Some(exchange) = self.superseded.get_mut(&id) {
            absorb(exchange, Some(bytes), &mut self.messages, false, &self.events);
        } else {
            log::debug!("Ignoring {} bytes for stale exchange {}", bytes.len(), id);
        }
    }

    /// Finish exchange `id` after its transport completed.
    ///
    /// Returns the auto-answer follow-up to schedule, if any. Only the
    /// active exchange can produce one.
    pub async fn on_complete(&mut self, id: ExchangeId) -> Option<FollowUp> {
        let (exchange, was_active) = self.finalize(id).await?;
        self.emit(SessionEvent::ExchangeFinished(id));

        if !was_active || self.auto_answer_model.is_none() {
            return None;
        }

        let reply = exchange.replies.message(ROLE_ASSISTANT, &self.messages)?;
        if reply.content.is_empty() {
            return None;
        }

        log::info!(
            "Exchange {} answered; chaining reply to the other side",
            exchange.id
        );
        Some(FollowUp {
            model: exchange.model.clone(),
            prompt: reply.content.clone(),
            auto_chained: !exchange.auto_chained,
        })
    }

    /// Finish exchange `id` after its transport failed; never chains
    pub async fn on_failed(&mut self, id: ExchangeId, error: &str) {
        log::warn!("Exchange {} failed: {}", id, error);
        if self.finalize(id).await.is_some() {
            self.emit(SessionEvent::ExchangeFailed {
                exchange: id,
                error: error.to_string(),
            });
        }
    }

    /// Switch to `chat_id`, clearing the auto-answer partner.
    ///
    /// Returns the exchange that was abandoned; its transport should be
    /// cancelled and nothing more of it is saved.
    pub async fn set_current_chat(&mut self, chat_id: Option<ChatId>) -> Option<ExchangeId> {
        if self.current_chat == chat_id {
            return None;
        }

        self.set_auto_answer_model(None);
        let abandoned = self.active.take().map(|exchange| {
            log::info!("Abandoning exchange {}", exchange.id);
            exchange.id
        });

        self.current_chat = chat_id;
        self.reload().await;
        self.emit(SessionEvent::CurrentChatChanged(chat_id));
        abandoned
    }

    /// Re-read the current chat from the store.
    ///
    /// Unsaved replies of the active exchange stay visible after the
    /// stored messages.
    pub async fn reload(&mut self) {
        if let Some(exchange) = self.active.as_mut() {
            exchange.replies.detach(&self.messages);
        }
        for exchange in self.superseded.values_mut() {
            exchange.replies.detach(&self.messages);
        }

        self.messages = match self.current_chat {
            Some(chat_id) => match self.store.load_messages(chat_id).await {
                Ok(messages) => messages,
                Err(e) => {
                    log::error!("Failed to load chat {}: {}", chat_id, e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        if let Some(exchange) = self.active.as_mut() {
            if Some(exchange.chat_id) == self.current_chat {
                exchange.replies.attach(&mut self.messages);
            }
        }

        self.emit(SessionEvent::ConversationChanged);
    }

    /// Delete a saved message and reload the log
    pub async fn delete_message(&mut self, message: &Message) -> Result<()> {
        let id = message.id.ok_or(SessionError::UnsavedMessage)?;

        if let Err(e) = self.store.begin().await {
            log::error!("Failed to open chat store transaction: {}", e);
        }
        if let Err(e) = self.store.delete_message(id).await {
            log::error!("Failed to delete message {}: {}", id, e);
            return Err(e.into());
        }

        self.reload().await;
        Ok(())
    }

    pub async fn list_chats(&self) -> Result<Vec<Chat>> {
        Ok(self.store.list_chats().await?)
    }

    /// Delete a chat; removing the current one leaves the session without a chat
    pub async fn remove_chat(&mut self, chat_id: ChatId) -> Result<Option<ExchangeId>> {
        self.store.remove_chat(chat_id).await?;
        log::info!("Removed chat {}", chat_id);

        if self.current_chat != Some(chat_id) {
            return Ok(None);
        }
        Ok(self.set_current_chat(None).await)
    }

    /// Delete every chat; the session is left without a current chat
    pub async fn clear_chats(&mut self) -> Result<Option<ExchangeId>> {
        self.store.clear().await?;
        log::info!("Removed all chats");
        Ok(self.set_current_chat(None).await)
    }

    /// Save what every unfinished exchange has received so far and drop them.
    ///
    /// Nothing chains from an exchange closed this way.
    pub async fn abandon_all(&mut self) {
        let mut ids: Vec<ExchangeId> = self.superseded.keys().copied().collect();
        ids.sort_unstable();
        ids.extend(self.active_exchange());

        for id in ids {
            if self.finalize(id).await.is_some() {
                log::info!("Exchange {} closed before completion", id);
            }
        }
    }

    /// Commit pending writes
    pub async fn close(&mut self) {
        if let Err(e) = self.store.commit().await {
            log::error!("Failed to commit chat store: {}", e);
        }
    }

    /// Flush and save exchange `id`, removing it from the session
    async fn finalize(&mut self, id: ExchangeId) -> Option<(Exchange, bool)> {
        let (mut exchange, was_active) = match self.active.take() {
            Some(active) if active.id == id => (active, true),
            other => {
                self.active = other;
                match self.superseded.remove(&id) {
                    Some(exchange) => (exchange, false),
                    None => {
                        log::debug!("Completion for unknown exchange {}", id);
                        return None;
                    }
                }
            }
        };

        absorb(&mut exchange, None, &mut self.messages, was_active, &self.events);
        self.persist_replies(&mut exchange).await;

        if !was_active && Some(exchange.chat_id) == self.current_chat {
            exchange.replies.attach(&mut self.messages);
        }

        log::debug!(
            "Exchange {} finished with {} reply messages",
            id,
            exchange.replies.len()
        );
        self.emit(SessionEvent::ConversationChanged);
        Some((exchange, was_active))
    }

    async fn persist_replies(&mut self, exchange: &mut Exchange) {
        let roles: Vec<String> = exchange.replies.roles().map(str::to_string).collect();
        for role in roles {
            let Some(message) = exchange.replies.message(&role, &self.messages).cloned() else {
                continue;
            };
            match self
                .store
                .insert_or_update_message(exchange.chat_id, &message)
                .await
            {
                Ok(id) => exchange.replies.set_id(&role, id, &mut self.messages),
                Err(e) => log::error!(
                    "Failed to save {} reply of exchange {}: {}",
                    role,
                    exchange.id,
                    e
                ),
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Decode `bytes` (or the buffered tail when `None`) into the exchange's replies
fn absorb(
    exchange: &mut Exchange,
    bytes: Option<&[u8]>,
    log: &mut Vec<Message>,
    attach_new: bool,
    events: &broadcast::Sender<SessionEvent>,
) {
    let Exchange {
        id,
        decoder,
        replies,
        ..
    } = exchange;

    let frames = match bytes {
        Some(bytes) => decoder.feed(bytes),
        None => decoder.finish(),
    };

    for record in frames {
        if let Some(error) = &record.error {
            log::warn!("Server reported an error in exchange {}: {}", id, error);
            let _ = events.send(SessionEvent::ServerError {
                exchange: *id,
                error: error.clone(),
            });
        }
        if replies.apply(&record, log, attach_new).changed_log() {
            let _ = events.send(SessionEvent::ConversationChanged);
        }
    }
}

/// Role-tagged transcript of `messages`.
///
/// For chained sends the user turns are presented as the assistant's own
/// and everything else as system context.
fn build_transcript(messages: &[Message], human: bool) -> Vec<TranscriptEntry> {
    messages
        .iter()
        .map(|message| TranscriptEntry {
            role: if human {
                message.role.clone()
            } else if message.role == ROLE_USER {
                ROLE_ASSISTANT.to_string()
            } else {
                ROLE_SYSTEM.to_string()
            },
            content: message.content.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chat_core::{Chat, ChatId, Message, MessageId, ROLE_ASSISTANT, ROLE_USER};
    use chat_store::{ChatStore, SqliteChatStore, StoreError, StoreResult};
    use tempfile::{tempdir, TempDir};
    use tokio::sync::broadcast;

    use super::*;

    mockall::mock! {
        pub Store {}

        #[async_trait]
        impl ChatStore for Store {
            async fn init(&self) -> StoreResult<()>;
            async fn create_chat(&self, name: &str) -> StoreResult<ChatId>;
            async fn list_chats(&self) -> StoreResult<Vec<Chat>>;
            async fn remove_chat(&self, chat_id: ChatId) -> StoreResult<()>;
            async fn clear(&self) -> StoreResult<()>;
            async fn insert_or_update_message(
                &self,
                chat_id: ChatId,
                message: &Message,
            ) -> StoreResult<MessageId>;
            async fn load_messages(&self, chat_id: ChatId) -> StoreResult<Vec<Message>>;
            async fn delete_message(&self, id: MessageId) -> StoreResult<()>;
            async fn begin(&self) -> StoreResult<()>;
            async fn commit(&self) -> StoreResult<()>;
        }
    }

    async fn open_session(dir: &TempDir) -> (ChatSession, Arc<SqliteChatStore>) {
        let store = Arc::new(SqliteChatStore::open(dir.path().join("chats.db")).expect("open"));
        store.init().await.expect("init");
        (ChatSession::new(store.clone()), store)
    }

    fn frame(model: &str, role: &str, content: &str, done: bool) -> String {
        let mut line = serde_json::json!({
            "model": model,
            "done": done,
            "message": {"role": role, "content": content}
        })
        .to_string();
        line.push('\n');
        line
    }

    fn hello_stream() -> String {
        [
            frame("m", ROLE_ASSISTANT, "Hel", false),
            frame("m", ROLE_ASSISTANT, "lo", false),
            frame("m", ROLE_ASSISTANT, "", true),
        ]
        .concat()
    }

    fn contents(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.content.as_str()).collect()
    }

    fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    async fn messages_after_stream(chunks: &[&[u8]]) -> Vec<(String, String)> {
        let dir = tempdir().expect("temp dir");
        let (mut session, _store) = open_session(&dir).await;
        let exchange = session.send_prompt("m", "greet me", true, false).await.unwrap();
        for chunk in chunks {
            session.on_chunk(exchange.id, chunk);
        }
        session.on_complete(exchange.id).await;
        session
            .messages()
            .iter()
            .map(|m| (m.role.clone(), m.content.clone()))
            .collect()
    }

    #[tokio::test]
    async fn first_prompt_creates_chat_and_logs_prompt_before_any_reply() {
        let dir = tempdir().expect("temp dir");
        let (mut session, store) = open_session(&dir).await;
        let mut events = session.subscribe();
        let prompt = "x".repeat(80);

        let exchange = session.send_prompt("llama3", &prompt, true, false).await.unwrap();

        let chats = store.list_chats().await.unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].name, "x".repeat(64));
        assert_eq!(session.current_chat(), Some(chats[0].id));

        assert_eq!(session.messages().len(), 1);
        let prompt_message = &session.messages()[0];
        assert_eq!(prompt_message.role, ROLE_USER);
        assert!(prompt_message.model.is_empty());
        assert!(prompt_message.id.is_some());
        assert_eq!(store.load_messages(chats[0].id).await.unwrap().len(), 1);

        assert_eq!(exchange.request.model, "llama3");
        assert_eq!(exchange.request.messages.len(), 1);
        assert_eq!(exchange.request.messages[0].role, ROLE_USER);
        assert_eq!(exchange.request.messages[0].content, prompt);
        assert!(session.is_streaming());

        let events = drain(&mut events);
        assert!(events.contains(&SessionEvent::CurrentChatChanged(Some(chats[0].id))));
        assert_eq!(events.last(), Some(&SessionEvent::ConversationChanged));

        session.send_prompt("llama3", "again", true, false).await.unwrap();
        assert_eq!(store.list_chats().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn streamed_fragments_become_one_saved_reply() {
        let dir = tempdir().expect("temp dir");
        let (mut session, store) = open_session(&dir).await;

        let exchange = session.send_prompt("m", "greet me", true, false).await.unwrap();
        session.on_chunk(exchange.id, hello_stream().as_bytes());

        assert_eq!(contents(session.messages()), vec!["greet me", "Hello"]);
        assert!(session.messages()[1].id.is_none());

        assert!(session.on_complete(exchange.id).await.is_none());
        assert!(!session.is_streaming());

        let reply = &session.messages()[1];
        assert_eq!(reply.role, ROLE_ASSISTANT);
        assert_eq!(reply.model, "m");
        assert!(reply.id.is_some());

        let stored = store
            .load_messages(session.current_chat().unwrap())
            .await
            .unwrap();
        assert_eq!(contents(&stored), vec!["greet me", "Hello"]);
    }

    #[tokio::test]
    async fn chunk_boundaries_do_not_change_the_conversation() {
        let stream = hello_stream();
        let bytes = stream.as_bytes();

        let whole = messages_after_stream(&[bytes]).await;
        let byte_by_byte: Vec<&[u8]> = bytes.chunks(1).collect();
        let (head, tail) = bytes.split_at(37);

        assert_eq!(whole.len(), 2);
        assert_eq!(whole[1], (ROLE_ASSISTANT.to_string(), "Hello".to_string()));
        assert_eq!(messages_after_stream(&byte_by_byte).await, whole);
        assert_eq!(messages_after_stream(&[head, tail]).await, whole);
    }

    #[tokio::test]
    async fn terminal_record_without_separator_is_flushed_on_completion() {
        let dir = tempdir().expect("temp dir");
        let (mut session, _store) = open_session(&dir).await;

        let exchange = session.send_prompt("m", "q", true, false).await.unwrap();
        let last = frame("m", ROLE_ASSISTANT, "end", true);
        session.on_chunk(exchange.id, last.trim_end().as_bytes());
        assert_eq!(session.messages().len(), 1);

        session.on_complete(exchange.id).await;
        assert_eq!(contents(session.messages()), vec!["q", "end"]);
    }

    #[tokio::test]
    async fn empty_content_records_create_nothing() {
        let dir = tempdir().expect("temp dir");
        let (mut session, store) = open_session(&dir).await;
        let mut events = session.subscribe();

        let exchange = session.send_prompt("m", "q", true, false).await.unwrap();
        drain(&mut events);

        let keep_alive = [
            frame("m", ROLE_ASSISTANT, "", false),
            "{}\n".to_string(),
            frame("m", ROLE_ASSISTANT, "", true),
        ]
        .concat();
        session.on_chunk(exchange.id, keep_alive.as_bytes());
        assert!(drain(&mut events).is_empty());

        session.on_complete(exchange.id).await;
        assert_eq!(contents(session.messages()), vec!["q"]);
        let stored = store
            .load_messages(session.current_chat().unwrap())
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn superseded_exchange_keeps_its_messages_and_is_still_saved() {
        let dir = tempdir().expect("temp dir");
        let (mut session, store) = open_session(&dir).await;
        session.set_auto_answer_model(Some("partner".to_string()));

        let first = session.send_prompt("m", "first", true, false).await.unwrap();
        session.on_chunk(first.id, frame("m", ROLE_ASSISTANT, "A1", false).as_bytes());

        let second = session.send_prompt("m", "second", true, false).await.unwrap();
        assert_eq!(session.active_exchange(), Some(second.id));
        session.on_chunk(second.id, frame("m", ROLE_ASSISTANT, "B", false).as_bytes());

        // late bytes for the superseded exchange
        session.on_chunk(first.id, frame("m", ROLE_ASSISTANT, "A2", false).as_bytes());
        session.on_chunk(first.id, frame("m", "tool", "late", false).as_bytes());

        assert_eq!(contents(session.messages()), vec!["first", "A1A2", "second", "B"]);

        assert!(session.on_complete(first.id).await.is_none());
        assert_eq!(session.active_exchange(), Some(second.id));
        assert_eq!(
            contents(session.messages()),
            vec!["first", "A1A2", "second", "B", "late"]
        );

        let chat = session.current_chat().unwrap();
        let stored = store.load_messages(chat).await.unwrap();
        let mut stored_contents = contents(&stored);
        stored_contents.sort_unstable();
        assert_eq!(stored_contents, vec!["A1A2", "first", "late", "second"]);

        let follow_up = session.on_complete(second.id).await;
        assert!(follow_up.is_some());
        assert_eq!(store.load_messages(chat).await.unwrap().len(), 5);
        assert!(session.messages().iter().all(|m| m.id.is_some()));
    }

    #[tokio::test]
    async fn completed_reply_chains_to_the_partner_and_back() {
        let dir = tempdir().expect("temp dir");
        let (mut session, _store) = open_session(&dir).await;
        session.set_auto_answer_model(Some("b".to_string()));

        let first = session.send_prompt("a", "hello", true, false).await.unwrap();
        assert_eq!(first.request.model, "a");
        session.on_chunk(first.id, frame("a", ROLE_ASSISTANT, "reply from a", true).as_bytes());

        let follow_up = session.on_complete(first.id).await.expect("follow-up");
        assert_eq!(
            follow_up,
            FollowUp {
                model: "a".to_string(),
                prompt: "reply from a".to_string(),
                auto_chained: true,
            }
        );

        let second = session
            .send_prompt(&follow_up.model, &follow_up.prompt, false, follow_up.auto_chained)
            .await
            .unwrap();
        assert_eq!(second.request.model, "b");
        assert_eq!(session.messages().len(), 2);
        let roles: Vec<&str> = second
            .request
            .messages
            .iter()
            .map(|entry| entry.role.as_str())
            .collect();
        assert_eq!(roles, vec![ROLE_ASSISTANT, ROLE_SYSTEM]);

        session.on_chunk(second.id, frame("b", ROLE_ASSISTANT, "reply from b", true).as_bytes());
        let follow_up = session.on_complete(second.id).await.expect("follow-up");
        assert_eq!(follow_up.prompt, "reply from b");
        assert!(!follow_up.auto_chained);

        let third = session
            .send_prompt(&follow_up.model, &follow_up.prompt, false, follow_up.auto_chained)
            .await
            .unwrap();
        assert_eq!(third.request.model, "a");
    }

    #[tokio::test]
    async fn no_follow_up_once_the_partner_is_cleared() {
        let dir = tempdir().expect("temp dir");
        let (mut session, _store) = open_session(&dir).await;
        let mut events = session.subscribe();
        session.set_auto_answer_model(Some("b".to_string()));

        let exchange = session.send_prompt("a", "hello", true, false).await.unwrap();
        session.on_chunk(exchange.id, frame("a", ROLE_ASSISTANT, "hi", true).as_bytes());
        session.set_auto_answer_model(Some("  ".to_string()));

        assert!(session.on_complete(exchange.id).await.is_none());
        let events = drain(&mut events);
        assert!(events.contains(&SessionEvent::AutoAnswerModelChanged(Some("b".to_string()))));
        assert!(events.contains(&SessionEvent::AutoAnswerModelChanged(None)));
        assert!(events.contains(&SessionEvent::ExchangeFinished(exchange.id)));
    }

    #[tokio::test]
    async fn switching_chats_abandons_the_active_exchange() {
        let dir = tempdir().expect("temp dir");
        let (mut session, store) = open_session(&dir).await;

        let exchange = session.send_prompt("m", "q", true, false).await.unwrap();
        session.on_chunk(exchange.id, frame("m", ROLE_ASSISTANT, "par", false).as_bytes());
        let first_chat = session.current_chat().unwrap();

        let other = store.create_chat("other").await.unwrap();
        session.set_auto_answer_model(Some("b".to_string()));

        let abandoned = session.set_current_chat(Some(other)).await;
        assert_eq!(abandoned, Some(exchange.id));
        assert_eq!(session.current_chat(), Some(other));
        assert!(session.auto_answer_model().is_none());
        assert!(session.messages().is_empty());
        assert!(!session.is_streaming());

        session.on_chunk(exchange.id, frame("m", ROLE_ASSISTANT, "tial", false).as_bytes());
        assert!(session.on_complete(exchange.id).await.is_none());
        assert!(session.messages().is_empty());
        assert_eq!(store.load_messages(first_chat).await.unwrap().len(), 1);

        assert_eq!(session.set_current_chat(Some(first_chat)).await, None);
        assert_eq!(contents(session.messages()), vec!["q"]);
    }

    #[tokio::test]
    async fn deleting_reloads_and_keeps_in_flight_reply_visible() {
        let dir = tempdir().expect("temp dir");
        let (mut session, store) = open_session(&dir).await;

        let first = session.send_prompt("m", "one", true, false).await.unwrap();
        session.on_chunk(first.id, frame("m", ROLE_ASSISTANT, "answer", true).as_bytes());
        session.on_complete(first.id).await;

        let second = session.send_prompt("m", "two", true, false).await.unwrap();
        session.on_chunk(second.id, frame("m", ROLE_ASSISTANT, "par", false).as_bytes());

        let doomed = session.messages()[0].clone();
        session.delete_message(&doomed).await.unwrap();
        assert_eq!(contents(session.messages()), vec!["answer", "two", "par"]);

        session.on_chunk(second.id, frame("m", ROLE_ASSISTANT, "tial", false).as_bytes());
        assert_eq!(session.messages()[2].content, "partial");

        session.on_complete(second.id).await;
        let stored = store
            .load_messages(session.current_chat().unwrap())
            .await
            .unwrap();
        assert_eq!(stored.len(), 3);
        assert!(stored.iter().all(|m| m.content != "one"));
    }

    #[tokio::test]
    async fn deleting_an_unsaved_message_never_touches_the_store() {
        // any store call would panic: the mock has no expectations
        let mut session = ChatSession::new(Arc::new(MockStore::new()));

        let result = session.delete_message(&Message::user("never saved")).await;
        assert!(matches!(result, Err(SessionError::UnsavedMessage)));
    }

    #[tokio::test]
    async fn failed_prompt_save_keeps_the_in_memory_message() {
        let mut store = MockStore::new();
        store.expect_begin().returning(|| Ok(()));
        store
            .expect_create_chat()
            .times(1)
            .returning(|_| Ok(ChatId(7)));
        store
            .expect_insert_or_update_message()
            .returning(|_, _| Err(StoreError::InvalidData("disk full".to_string())));

        let mut session = ChatSession::new(Arc::new(store));
        let exchange = session.send_prompt("m", "keep me", true, false).await.unwrap();

        assert_eq!(session.current_chat(), Some(ChatId(7)));
        assert_eq!(contents(session.messages()), vec!["keep me"]);
        assert!(session.messages()[0].id.is_none());

        session.on_chunk(exchange.id, frame("m", ROLE_ASSISTANT, "ok", true).as_bytes());
        session.on_complete(exchange.id).await;
        assert_eq!(contents(session.messages()), vec!["keep me", "ok"]);
        assert!(session.messages()[1].id.is_none());
    }

    #[tokio::test]
    async fn server_error_frames_are_reported() {
        let dir = tempdir().expect("temp dir");
        let (mut session, _store) = open_session(&dir).await;
        let mut events = session.subscribe();

        let exchange = session.send_prompt("missing", "q", true, false).await.unwrap();
        session.on_chunk(exchange.id, b"{\"error\":\"model 'missing' not found\"}\n");

        let events = drain(&mut events);
        assert!(events.contains(&SessionEvent::ServerError {
            exchange: exchange.id,
            error: "model 'missing' not found".to_string(),
        }));
        assert_eq!(session.messages().len(), 1);
    }

    #[tokio::test]
    async fn failed_exchange_saves_partial_reply_without_chaining() {
        let dir = tempdir().expect("temp dir");
        let (mut session, store) = open_session(&dir).await;
        let mut events = session.subscribe();
        session.set_auto_answer_model(Some("b".to_string()));

        let exchange = session.send_prompt("a", "q", true, false).await.unwrap();
        session.on_chunk(exchange.id, frame("a", ROLE_ASSISTANT, "cut sh", false).as_bytes());
        session.on_failed(exchange.id, "connection reset").await;

        assert!(!session.is_streaming());
        let stored = store
            .load_messages(session.current_chat().unwrap())
            .await
            .unwrap();
        assert_eq!(contents(&stored), vec!["q", "cut sh"]);
        assert!(drain(&mut events).contains(&SessionEvent::ExchangeFailed {
            exchange: exchange.id,
            error: "connection reset".to_string(),
        }));
    }

    #[tokio::test]
    async fn removing_the_current_chat_resets_the_session() {
        let dir = tempdir().expect("temp dir");
        let (mut session, _store) = open_session(&dir).await;

        let exchange = session.send_prompt("m", "q", true, false).await.unwrap();
        let chat = session.current_chat().unwrap();
        assert_eq!(session.list_chats().await.unwrap().len(), 1);

        let abandoned = session.remove_chat(chat).await.unwrap();
        assert_eq!(abandoned, Some(exchange.id));
        assert!(session.current_chat().is_none());
        assert!(session.messages().is_empty());
        assert!(session.list_chats().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn abandon_all_saves_partial_replies_without_chaining() {
        let dir = tempdir().expect("temp dir");
        let (mut session, store) = open_session(&dir).await;
        let mut events = session.subscribe();
        session.set_auto_answer_model(Some("b".to_string()));

        let first = session.send_prompt("a", "one", true, false).await.unwrap();
        session.on_chunk(first.id, frame("a", ROLE_ASSISTANT, "early", false).as_bytes());
        let second = session.send_prompt("a", "two", true, false).await.unwrap();
        session.on_chunk(second.id, frame("a", ROLE_ASSISTANT, "late", false).as_bytes());

        session.abandon_all().await;
        assert!(!session.is_streaming());
        assert!(session.messages().iter().all(|m| m.id.is_some()));

        // both exchanges are gone; further completions are ignored
        assert!(session.on_complete(first.id).await.is_none());
        assert!(session.on_complete(second.id).await.is_none());
        assert!(!drain(&mut events)
            .iter()
            .any(|e| matches!(e, SessionEvent::ExchangeFinished(_))));

        let stored = store
            .load_messages(session.current_chat().unwrap())
            .await
            .unwrap();
        let mut stored_contents = contents(&stored);
        stored_contents.sort_unstable();
        assert_eq!(stored_contents, vec!["early", "late", "one", "two"]);
    }

    #[tokio::test]
    async fn clearing_chats_empties_store_and_session() {
        let dir = tempdir().expect("temp dir");
        let (mut session, store) = open_session(&dir).await;

        let exchange = session.send_prompt("m", "q", true, false).await.unwrap();
        store.create_chat("other").await.unwrap();
        assert_eq!(session.list_chats().await.unwrap().len(), 2);

        assert_eq!(session.clear_chats().await.unwrap(), Some(exchange.id));
        assert!(session.current_chat().is_none());
        assert!(session.messages().is_empty());
        assert!(session.list_chats().await.unwrap().is_empty());
    }
}
