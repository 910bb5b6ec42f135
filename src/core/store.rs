use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::core::ChatError;
use crate::providers::{Message, Role};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: i64,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl From<&StoredMessage> for Message {
    fn from(message: &StoredMessage) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

/// Persistence for conversations and their messages.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&mut self, title: &str) -> Result<Conversation, ChatError>;

    /// All conversations, most recently updated first.
    async fn list_conversations(&self) -> Result<Vec<Conversation>, ChatError>;

    async fn conversation(&self, id: i64) -> Result<Option<Conversation>, ChatError>;

    /// Messages of a conversation in the order they were added.
    async fn messages(&self, conversation_id: i64) -> Result<Vec<StoredMessage>, ChatError>;

    async fn append_message(
        &mut self,
        conversation_id: i64,
        role: Role,
        content: &str,
    ) -> Result<StoredMessage, ChatError>;

    /// Stores a user turn and the assistant's reply together; either both are
    /// stored or neither is.
    async fn append_exchange(
        &mut self,
        conversation_id: i64,
        user: &str,
        assistant: &str,
    ) -> Result<(StoredMessage, StoredMessage), ChatError>;

    /// Deletes a conversation and its messages. Returns false if it did not exist.
    async fn delete_conversation(&mut self, id: i64) -> Result<bool, ChatError>;

    /// Returns false if the message did not exist.
    async fn delete_message(&mut self, id: i64) -> Result<bool, ChatError>;
}

fn missing_conversation(id: i64) -> ChatError {
    ChatError::Store(format!("No conversation with id {id}"))
}

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    next_conversation_id: i64,
    next_message_id: i64,
    conversations: Vec<Conversation>,
    messages: Vec<StoredMessage>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_message(&mut self, conversation_id: i64, role: Role, content: &str) -> StoredMessage {
        self.next_message_id += 1;
        let message = StoredMessage {
            id: self.next_message_id,
            conversation_id,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        self.messages.push(message.clone());
        message
    }

    fn touch(&mut self, conversation_id: i64) -> Result<(), ChatError> {
        let conversation = self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| missing_conversation(conversation_id))?;
        conversation.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create_conversation(&mut self, title: &str) -> Result<Conversation, ChatError> {
        self.next_conversation_id += 1;
        let now = Utc::now();
        let conversation = Conversation {
            id: self.next_conversation_id,
            title: title.trim().to_string(),
            created_at: now,
            updated_at: now,
        };
        self.conversations.push(conversation.clone());
        Ok(conversation)
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, ChatError> {
        let mut conversations = self.conversations.clone();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(conversations)
    }

    async fn conversation(&self, id: i64) -> Result<Option<Conversation>, ChatError> {
        Ok(self.conversations.iter().find(|c| c.id == id).cloned())
    }

    async fn messages(&self, conversation_id: i64) -> Result<Vec<StoredMessage>, ChatError> {
        Ok(self
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn append_message(
        &mut self,
        conversation_id: i64,
        role: Role,
        content: &str,
    ) -> Result<StoredMessage, ChatError> {
        self.touch(conversation_id)?;
        Ok(self.push_message(conversation_id, role, content))
    }

    async fn append_exchange(
        &mut self,
        conversation_id: i64,
        user: &str,
        assistant: &str,
    ) -> Result<(StoredMessage, StoredMessage), ChatError> {
        self.touch(conversation_id)?;
        let user = self.push_message(conversation_id, Role::User, user);
        let assistant = self.push_message(conversation_id, Role::Assistant, assistant);
        Ok((user, assistant))
    }

    async fn delete_conversation(&mut self, id: i64) -> Result<bool, ChatError> {
        let before = self.conversations.len();
        self.conversations.retain(|c| c.id != id);
        if self.conversations.len() == before {
            return Ok(false);
        }
        self.messages.retain(|m| m.conversation_id != id);
        Ok(true)
    }

    async fn delete_message(&mut self, id: i64) -> Result<bool, ChatError> {
        let before = self.messages.len();
        self.messages.retain(|m| m.id != id);
        Ok(self.messages.len() != before)
    }
}

const CREATE_CONVERSATIONS: &str = r#"
    CREATE TABLE IF NOT EXISTS conversations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL DEFAULT '',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
"#;

const CREATE_MESSAGES: &str = r#"
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
        content TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
"#;

const CREATE_MESSAGES_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id)";

/// Conversations kept in a SQLite database. Timestamps are stored as
/// microseconds since the Unix epoch.
#[derive(Debug)]
pub struct SqliteStore {
    path: PathBuf,
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens the database at `path`, creating the file and schema if needed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, ChatError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| ChatError::Store(format!("Failed to open {}: {e}", path.display())))?;

        for statement in [CREATE_CONVERSATIONS, CREATE_MESSAGES, CREATE_MESSAGES_INDEX] {
            sqlx::query(statement).execute(&pool).await?;
        }
        debug!("[Store] opened {}", path.display());
        Ok(Self { path, pool })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bumps `updated_at`, failing when the conversation does not exist.
    async fn touch(conn: &mut SqliteConnection, conversation_id: i64, now: i64) -> Result<(), ChatError> {
        let result = sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(conversation_id)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(missing_conversation(conversation_id));
        }
        Ok(())
    }

    async fn insert_message(
        conn: &mut SqliteConnection,
        conversation_id: i64,
        role: Role,
        content: &str,
        now: i64,
    ) -> Result<StoredMessage, ChatError> {
        let id = sqlx::query(
            "INSERT INTO messages (conversation_id, role, content, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(conversation_id)
        .bind(role.to_string())
        .bind(content)
        .bind(now)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

        Ok(StoredMessage {
            id,
            conversation_id,
            role,
            content: content.to_string(),
            created_at: from_micros(now)?,
        })
    }
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, ChatError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| ChatError::Store(format!("Timestamp {micros} out of range")))
}

fn row_to_conversation(row: &SqliteRow) -> Result<Conversation, ChatError> {
    Ok(Conversation {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        created_at: from_micros(row.try_get("created_at")?)?,
        updated_at: from_micros(row.try_get("updated_at")?)?,
    })
}

fn row_to_message(row: &SqliteRow) -> Result<StoredMessage, ChatError> {
    let role: String = row.try_get("role")?;
    Ok(StoredMessage {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        role: role.parse().map_err(ChatError::Store)?,
        content: row.try_get("content")?,
        created_at: from_micros(row.try_get("created_at")?)?,
    })
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn create_conversation(&mut self, title: &str) -> Result<Conversation, ChatError> {
        let now = Utc::now().timestamp_micros();
        let title = title.trim();
        let id = sqlx::query("INSERT INTO conversations (title, created_at, updated_at) VALUES (?, ?, ?)")
            .bind(title)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();
        debug!("[Store] created conversation {id}");

        let created_at = from_micros(now)?;
        Ok(Conversation {
            id,
            title: title.to_string(),
            created_at,
            updated_at: created_at,
        })
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, ChatError> {
        sqlx::query("SELECT * FROM conversations ORDER BY updated_at DESC, id DESC")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(row_to_conversation)
            .collect()
    }

    async fn conversation(&self, id: i64) -> Result<Option<Conversation>, ChatError> {
        sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(row_to_conversation)
            .transpose()
    }

    async fn messages(&self, conversation_id: i64) -> Result<Vec<StoredMessage>, ChatError> {
        sqlx::query("SELECT * FROM messages WHERE conversation_id = ? ORDER BY id")
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(row_to_message)
            .collect()
    }

    async fn append_message(
        &mut self,
        conversation_id: i64,
        role: Role,
        content: &str,
    ) -> Result<StoredMessage, ChatError> {
        let now = Utc::now().timestamp_micros();
        let mut tx = self.pool.begin().await?;
        Self::touch(&mut tx, conversation_id, now).await?;
        let message = Self::insert_message(&mut tx, conversation_id, role, content, now).await?;
        tx.commit().await?;
        Ok(message)
    }

    async fn append_exchange(
        &mut self,
        conversation_id: i64,
        user: &str,
        assistant: &str,
    ) -> Result<(StoredMessage, StoredMessage), ChatError> {
        let now = Utc::now().timestamp_micros();
        let mut tx = self.pool.begin().await?;
        Self::touch(&mut tx, conversation_id, now).await?;
        let user = Self::insert_message(&mut tx, conversation_id, Role::User, user, now).await?;
        let assistant =
            Self::insert_message(&mut tx, conversation_id, Role::Assistant, assistant, now).await?;
        tx.commit().await?;
        Ok((user, assistant))
    }

    async fn delete_conversation(&mut self, id: i64) -> Result<bool, ChatError> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_message(&mut self, id: i64) -> Result<bool, ChatError> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
