use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chat_core::{Chat, ChatId, Message, MessageId};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{StoreError, StoreResult};
use crate::store::ChatStore;

const SCHEMA_VERSION: i64 = 1;

pub const DEFAULT_COMMIT_WINDOW: Duration = Duration::from_millis(300);

/// SQLite backed [`ChatStore`]
///
/// Every write joins the open transaction or opens one; an opened
/// transaction commits once `commit_window` has elapsed, on [`close`], or when
/// the last handle is dropped.
///
/// [`close`]: SqliteChatStore::close
#[derive(Clone)]
pub struct SqliteChatStore {
    db: Arc<Mutex<Db>>,
    commit_window: Duration,
}

struct Db {
    connection: Connection,
    in_transaction: bool,
    generation: u64,
}

impl Db {
    /// Returns the generation of a newly opened transaction
    fn begin(&mut self) -> StoreResult<Option<u64>> {
        if self.in_transaction {
            return Ok(None);
        }
        self.connection.execute_batch("BEGIN")?;
        self.in_transaction = true;
        self.generation += 1;
        Ok(Some(self.generation))
    }

    fn commit(&mut self) -> StoreResult<bool> {
        if !self.in_transaction {
            return Ok(false);
        }
        self.connection.execute_batch("COMMIT")?;
        self.in_transaction = false;
        Ok(true)
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if let Err(e) = self.commit() {
            log::error!("Failed to commit chat store on close: {}", e);
        }
    }
}

impl SqliteChatStore {
    pub fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with_commit_window(db_path, DEFAULT_COMMIT_WINDOW)
    }

    pub fn open_with_commit_window(
        db_path: impl AsRef<Path>,
        commit_window: Duration,
    ) -> StoreResult<Self> {
        let connection = open_connection(db_path.as_ref())?;
        Ok(Self {
            db: Arc::new(Mutex::new(Db {
                connection,
                in_transaction: false,
                generation: 0,
            })),
            commit_window,
        })
    }

    /// Commit any pending writes
    pub async fn close(&self) -> StoreResult<()> {
        self.commit().await
    }

    async fn with_db<T, F>(&self, func: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Db) -> StoreResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut guard = db
                .lock()
                .map_err(|_| StoreError::Task("chat database lock poisoned".to_string()))?;
            func(&mut *guard)
        })
        .await
        .map_err(|error| StoreError::Task(error.to_string()))?
    }

    /// Run `func` inside the implicit transaction
    async fn write<T, F>(&self, func: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    {
        let (opened, result) = self
            .with_db(move |db| {
                let opened = db.begin()?;
                Ok((opened, func(&db.connection)))
            })
            .await?;

        if let Some(generation) = opened {
            self.schedule_commit(generation);
        }
        result
    }

    fn schedule_commit(&self, generation: u64) {
        let store = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(store.commit_window).await;
            let result = store
                .with_db(move |db| {
                    if db.generation == generation {
                        db.commit()?;
                    }
                    Ok(())
                })
                .await;
            if let Err(e) = result {
                log::error!("Failed to commit chat store: {}", e);
            }
        });
    }
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn init(&self) -> StoreResult<()> {
        self.write(|connection| {
            connection.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS general (
                    _key TEXT NOT NULL PRIMARY KEY,
                    _value TEXT NOT NULL
                );
                "#,
            )?;

            let version = get_value(connection, "version")?
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0);

            if version < 1 {
                connection.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS chats (
                        id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
                        name TEXT NOT NULL,
                        datetime INTEGER NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS messages (
                        id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
                        chat_id INTEGER NOT NULL,
                        model TEXT NOT NULL,
                        role TEXT NOT NULL,
                        content TEXT NOT NULL,
                        datetime INTEGER NOT NULL,
                        FOREIGN KEY(chat_id) REFERENCES chats(id) ON DELETE CASCADE ON UPDATE CASCADE
                    );

                    CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id);
                    "#,
                )?;
                set_value(connection, "version", &SCHEMA_VERSION.to_string())?;
                log::info!("Chat database initialised at schema version {}", SCHEMA_VERSION);
            }
            Ok(())
        })
        .await
    }

    async fn create_chat(&self, name: &str) -> StoreResult<ChatId> {
        let name = name.to_string();
        let created_at = Utc::now().timestamp_millis();

        self.write(move |connection| {
            connection.execute(
                "INSERT INTO chats (name, datetime) VALUES (?1, ?2)",
                params![name, created_at],
            )?;
            Ok(ChatId(connection.last_insert_rowid()))
        })
        .await
    }

    async fn list_chats(&self) -> StoreResult<Vec<Chat>> {
        self.with_db(|db| {
            let mut stmt = db
                .connection
                .prepare("SELECT id, name, datetime FROM chats ORDER BY id DESC")?;
            let mut rows = stmt.query([])?;
            let mut chats = Vec::new();

            while let Some(row) = rows.next()? {
                chats.push(Chat {
                    id: ChatId(row.get(0)?),
                    name: row.get(1)?,
                    created_at: from_millis(row.get(2)?)?,
                });
            }

            Ok(chats)
        })
        .await
    }

    async fn remove_chat(&self, chat_id: ChatId) -> StoreResult<()> {
        self.write(move |connection| {
            connection.execute("DELETE FROM messages WHERE chat_id = ?1", params![chat_id.0])?;
            connection.execute("DELETE FROM chats WHERE id = ?1", params![chat_id.0])?;
            Ok(())
        })
        .await
    }

    async fn clear(&self) -> StoreResult<()> {
        self.write(|connection| {
            connection.execute_batch("DELETE FROM messages; DELETE FROM chats;")?;
            Ok(())
        })
        .await
    }

    async fn insert_or_update_message(
        &self,
        chat_id: ChatId,
        message: &Message,
    ) -> StoreResult<MessageId> {
        let message = message.clone();

        self.write(move |connection| {
            let datetime = message.timestamp.timestamp_millis();
            match message.id {
                Some(id) => connection.execute(
                    r#"
                    INSERT OR REPLACE INTO messages (id, model, role, chat_id, content, datetime)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    "#,
                    params![id.0, message.model, message.role, chat_id.0, message.content, datetime],
                )?,
                None => connection.execute(
                    r#"
                    INSERT INTO messages (model, role, chat_id, content, datetime)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    "#,
                    params![message.model, message.role, chat_id.0, message.content, datetime],
                )?,
            };
            Ok(MessageId(connection.last_insert_rowid()))
        })
        .await
    }

    async fn load_messages(&self, chat_id: ChatId) -> StoreResult<Vec<Message>> {
        self.with_db(move |db| {
            let mut stmt = db.connection.prepare(
                r#"
                SELECT id, model, role, content, datetime
                FROM messages
                WHERE chat_id = ?1
                ORDER BY datetime ASC, id ASC
                "#,
            )?;
            let mut rows = stmt.query(params![chat_id.0])?;
            let mut messages = Vec::new();

            while let Some(row) = rows.next()? {
                messages.push(Message {
                    id: Some(MessageId(row.get(0)?)),
                    model: row.get(1)?,
                    role: row.get(2)?,
                    content: row.get(3)?,
                    timestamp: from_millis(row.get(4)?)?,
                });
            }

            Ok(messages)
        })
        .await
    }

    async fn delete_message(&self, id: MessageId) -> StoreResult<()> {
        self.write(move |connection| {
            connection.execute("DELETE FROM messages WHERE id = ?1", params![id.0])?;
            Ok(())
        })
        .await
    }

    async fn begin(&self) -> StoreResult<()> {
        self.write(|_| Ok(())).await
    }

    async fn commit(&self) -> StoreResult<()> {
        self.with_db(|db| db.commit().map(|_| ())).await
    }
}

fn open_connection(path: &Path) -> StoreResult<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let connection = Connection::open(path)?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        PRAGMA synchronous = NORMAL;
        "#,
    )?;
    Ok(connection)
}

fn get_value(connection: &Connection, key: &str) -> StoreResult<Option<String>> {
    Ok(connection
        .query_row(
            "SELECT _value FROM general WHERE _key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

fn set_value(connection: &Connection, key: &str, value: &str) -> StoreResult<()> {
    connection.execute(
        "INSERT OR REPLACE INTO general (_key, _value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

fn from_millis(raw: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(raw)
        .ok_or_else(|| StoreError::InvalidData(format!("timestamp out of range: {raw}")))
}
