//! Session task: serializes commands, transport callbacks and auto-answer
//! timers onto one [`ChatSession`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chat_core::{Chat, ChatId, ChatRequest, Config, Message};
use chat_llm::ChatTransport;
use chat_store::ChatStore;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SessionError};
use crate::events::{FollowUp, SessionEvent, SessionSnapshot};
use crate::exchange::ExchangeId;
use crate::session::ChatSession;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Pause before the partner answers a finished reply
    pub auto_answer_delay: Duration,
    pub command_capacity: usize,
    pub event_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            auto_answer_delay: Duration::from_millis(500),
            command_capacity: 32,
            event_capacity: 256,
        }
    }
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            auto_answer_delay: config.auto_answer_delay(),
            ..Self::default()
        }
    }
}

enum Command {
    SendPrompt {
        model: String,
        prompt: String,
        reply: oneshot::Sender<Result<ExchangeId>>,
    },
    SetCurrentChat {
        chat_id: Option<ChatId>,
        reply: oneshot::Sender<()>,
    },
    SetAutoAnswerModel {
        model: Option<String>,
        reply: oneshot::Sender<()>,
    },
    DeleteMessage {
        message: Message,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoveChat {
        chat_id: ChatId,
        reply: oneshot::Sender<Result<()>>,
    },
    ClearChats {
        reply: oneshot::Sender<Result<()>>,
    },
    ListChats {
        reply: oneshot::Sender<Result<Vec<Chat>>>,
    },
    Reload {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum TransportEvent {
    Chunk(ExchangeId, Bytes),
    Finished(ExchangeId),
    Failed(ExchangeId, String),
}

/// Cloneable front end of a running session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
    transport: Arc<dyn ChatTransport>,
}

/// Start a session task over `store` and `transport`.
///
/// The task runs until [`SessionHandle::shutdown`] is called or every
/// handle is dropped; it commits pending writes before exiting.
pub fn spawn_session(
    store: Arc<dyn ChatStore>,
    transport: Arc<dyn ChatTransport>,
    options: SessionOptions,
) -> (SessionHandle, JoinHandle<()>) {
    let session = ChatSession::with_event_capacity(store, options.event_capacity);
    let (command_tx, command_rx) = mpsc::channel(options.command_capacity);

    let handle = SessionHandle {
        commands: command_tx,
        events: session.event_sender(),
        transport: transport.clone(),
    };

    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let (follow_up_tx, follow_up_rx) = mpsc::unbounded_channel();
    let runner = SessionRunner {
        session,
        transport,
        auto_answer_delay: options.auto_answer_delay,
        transport_tx,
        follow_up_tx,
        pumps: HashMap::new(),
        shutdown: CancellationToken::new(),
        shutdown_reply: None,
    };

    let task = tokio::spawn(runner.run(command_rx, transport_rx, follow_up_rx));
    (handle, task)
}

impl SessionHandle {
    /// Send a human prompt to `model`
    pub async fn send_prompt(
        &self,
        model: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Result<ExchangeId> {
        let model = model.into();
        let prompt = prompt.into();
        self.request(|reply| Command::SendPrompt {
            model,
            prompt,
            reply,
        })
        .await?
    }

    pub async fn set_current_chat(&self, chat_id: Option<ChatId>) -> Result<()> {
        self.request(|reply| Command::SetCurrentChat { chat_id, reply })
            .await
    }

    pub async fn set_auto_answer_model(&self, model: Option<String>) -> Result<()> {
        self.request(|reply| Command::SetAutoAnswerModel { model, reply })
            .await
    }

    pub async fn delete_message(&self, message: Message) -> Result<()> {
        self.request(|reply| Command::DeleteMessage { message, reply })
            .await?
    }

    pub async fn remove_chat(&self, chat_id: ChatId) -> Result<()> {
        self.request(|reply| Command::RemoveChat { chat_id, reply })
            .await?
    }

    /// Delete every saved chat
    pub async fn clear_chats(&self) -> Result<()> {
        self.request(|reply| Command::ClearChats { reply }).await?
    }

    pub async fn list_chats(&self) -> Result<Vec<Chat>> {
        self.request(|reply| Command::ListChats { reply }).await?
    }

    pub async fn reload(&self) -> Result<()> {
        self.request(|reply| Command::Reload { reply }).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn list_models(&self) -> Result<Vec<String>> {
        Ok(self.transport.list_models().await?)
    }

    /// Remove `name` from the server
    pub async fn delete_model(&self, name: &str) -> Result<()> {
        Ok(self.transport.delete_model(name).await?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Stop the session task, cancelling in-flight exchanges
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)
    }
}

struct SessionRunner {
    session: ChatSession,
    transport: Arc<dyn ChatTransport>,
    auto_answer_delay: Duration,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    follow_up_tx: mpsc::UnboundedSender<FollowUp>,
    /// Cancellation for every exchange whose transport is still running
    pumps: HashMap<ExchangeId, CancellationToken>,
    shutdown: CancellationToken,
    shutdown_reply: Option<oneshot::Sender<()>>,
}

impl SessionRunner {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        mut follow_up_rx: mpsc::UnboundedReceiver<FollowUp>,
    ) {
        log::info!("Chat session started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => break,
                },
                Some(event) = transport_rx.recv() => self.handle_transport(event).await,
                Some(follow_up) = follow_up_rx.recv() => self.handle_follow_up(follow_up).await,
            }
        }

        self.stop(&mut transport_rx).await;
        if let Some(reply) = self.shutdown_reply.take() {
            let _ = reply.send(());
        }
    }

    /// Returns `false` once shutdown was requested
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::SendPrompt {
                model,
                prompt,
                reply,
            } => {
                let result = self.start_exchange(&model, &prompt, true, false).await;
                let _ = reply.send(result);
            }
            Command::SetCurrentChat { chat_id, reply } => {
                let abandoned = self.session.set_current_chat(chat_id).await;
                self.cancel(abandoned);
                let _ = reply.send(());
            }
            Command::SetAutoAnswerModel { model, reply } => {
                self.session.set_auto_answer_model(model);
                let _ = reply.send(());
            }
            Command::DeleteMessage { message, reply } => {
                let _ = reply.send(self.session.delete_message(&message).await);
            }
            Command::RemoveChat { chat_id, reply } => {
                let result = match self.session.remove_chat(chat_id).await {
                    Ok(abandoned) => {
                        self.cancel(abandoned);
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::ClearChats { reply } => {
                let result = match self.session.clear_chats().await {
                    Ok(abandoned) => {
                        self.cancel(abandoned);
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::ListChats { reply } => {
                let _ = reply.send(self.session.list_chats().await);
            }
            Command::Reload { reply } => {
                self.session.reload().await;
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.session.snapshot());
            }
            Command::Shutdown { reply } => {
                self.shutdown_reply = Some(reply);
                return false;
            }
        }
        true
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Chunk(id, bytes) => self.session.on_chunk(id, &bytes),
            TransportEvent::Finished(id) => {
                self.pumps.remove(&id);
                if let Some(follow_up) = self.session.on_complete(id).await {
                    self.schedule_follow_up(follow_up);
                }
            }
            TransportEvent::Failed(id, error) => {
                self.pumps.remove(&id);
                self.session.on_failed(id, &error).await;
            }
        }
    }

    /// Sent even when the partner was cleared or another exchange started meanwhile
    async fn handle_follow_up(&mut self, follow_up: FollowUp) {
        let FollowUp {
            model,
            prompt,
            auto_chained,
        } = follow_up;
        if let Err(e) = self.start_exchange(&model, &prompt, false, auto_chained).await {
            log::error!("Failed to send auto-answer follow-up: {}", e);
        }
    }

    async fn start_exchange(
        &mut self,
        model: &str,
        prompt: &str,
        human: bool,
        auto_chained: bool,
    ) -> Result<ExchangeId> {
        let outbound = self
            .session
            .send_prompt(model, prompt, human, auto_chained)
            .await?;

        let token = CancellationToken::new();
        self.pumps.insert(outbound.id, token.clone());
        tokio::spawn(pump_exchange(
            self.transport.clone(),
            outbound.request,
            outbound.id,
            token,
            self.transport_tx.clone(),
        ));

        Ok(outbound.id)
    }

    fn schedule_follow_up(&self, follow_up: FollowUp) {
        let delay = self.auto_answer_delay;
        let shutdown = self.shutdown.clone();
        let follow_up_tx = self.follow_up_tx.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = follow_up_tx.send(follow_up);
                }
            }
        });
    }

    fn cancel(&mut self, abandoned: Option<ExchangeId>) {
        if let Some(token) = abandoned.and_then(|id| self.pumps.remove(&id)) {
            token.cancel();
        }
    }

    /// Cancel transports and timers, then save what already arrived
    async fn stop(&mut self, transport_rx: &mut mpsc::UnboundedReceiver<TransportEvent>) {
        self.shutdown.cancel();
        for (_, token) in self.pumps.drain() {
            token.cancel();
        }

        while let Ok(event) = transport_rx.try_recv() {
            match event {
                TransportEvent::Chunk(id, bytes) => self.session.on_chunk(id, &bytes),
                TransportEvent::Finished(id) => {
                    self.session.on_complete(id).await;
                }
                TransportEvent::Failed(id, error) => self.session.on_failed(id, &error).await,
            }
        }

        self.session.abandon_all().await;
        self.session.close().await;
        log::info!("Chat session stopped");
    }
}

/// Forward the response body of exchange `id` to the session task
async fn pump_exchange(
    transport: Arc<dyn ChatTransport>,
    request: ChatRequest,
    id: ExchangeId,
    cancel_token: CancellationToken,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let stream = tokio::select! {
        _ = cancel_token.cancelled() => return,
        result = transport.chat_stream(&request) => result,
    };

    let mut stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = events.send(TransportEvent::Failed(id, e.to_string()));
            return;
        }
    };

    loop {
        let chunk = tokio::select! {
            _ = cancel_token.cancelled() => {
                log::debug!("[{}] Response abandoned", id);
                return;
            }
            chunk = stream.next() => chunk,
        };

        let event = match chunk {
            Some(Ok(bytes)) => TransportEvent::Chunk(id, bytes),
            Some(Err(e)) => {
                let _ = events.send(TransportEvent::Failed(id, e.to_string()));
                return;
            }
            None => {
                log::debug!("[{}] Response complete", id);
                let _ = events.send(TransportEvent::Finished(id));
                return;
            }
        };

        if events.send(event).is_err() {
            return;
        }
    }
}
