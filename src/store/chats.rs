//! Chat transcripts the engine creates or extends. Chats are never deleted by
//! the engine; deletion elsewhere is tolerated by falling back to a new chat.

use crate::client::Source;
use crate::utils::atomic_write;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;
use uuid::Uuid;

/// A note fetched through `get_note`, attached to the assistant message so
/// the UI can render it without duplicating the visible content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteAttachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_id: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    pub timestamp: i64,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Source>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub note_attachments: Vec<NoteAttachment>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>, timestamp: i64, models: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: "user".to_string(),
            content: content.into(),
            timestamp,
            models,
            sources: vec![],
            citations: vec![],
            note_attachments: vec![],
        }
    }

    /// Assistant message with retrieval sources mirrored into `citations`.
    pub fn assistant(
        content: impl Into<String>,
        timestamp: i64,
        models: Vec<String>,
        sources: Vec<Source>,
        note_attachments: Vec<NoteAttachment>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: "assistant".to_string(),
            content: content.into(),
            timestamp,
            models,
            citations: sources.clone(),
            sources,
            note_attachments,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_ids: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create(
        &self,
        user_id: &str,
        title: &str,
        messages: Vec<ChatMessage>,
        models: Vec<String>,
        tool_ids: Vec<String>,
    ) -> Result<Chat>;

    async fn get(&self, id: &str) -> Result<Option<Chat>>;

    /// Append messages to an existing chat. Returns `false` when the chat no
    /// longer exists (deleted externally).
    async fn append_messages(&self, id: &str, messages: Vec<ChatMessage>) -> Result<bool>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ChatFile {
    #[serde(default)]
    chats: Vec<Chat>,
}

/// JSON-file backed chat store, same persistence shape as the job store.
pub struct FileChatStore {
    path: PathBuf,
    state: Mutex<ChatFile>,
}

impl FileChatStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            ChatFile::default()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn save(&self, state: &ChatFile) -> Result<()> {
        let content = serde_json::to_string_pretty(state)?;
        atomic_write(&self.path, &content)
    }

    /// Test/support hook: drop a chat to simulate external deletion.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let before = state.chats.len();
        state.chats.retain(|c| c.id != id);
        let removed = state.chats.len() < before;
        if removed {
            self.save(&state)?;
        }
        Ok(removed)
    }
}

#[async_trait]
impl ChatStore for FileChatStore {
    async fn create(
        &self,
        user_id: &str,
        title: &str,
        messages: Vec<ChatMessage>,
        models: Vec<String>,
        tool_ids: Vec<String>,
    ) -> Result<Chat> {
        let now = crate::utils::now_ts();
        let chat = Chat {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            messages,
            models,
            tool_ids,
            created_at: now,
            updated_at: now,
        };
        let mut state = self.state.lock().await;
        state.chats.push(chat.clone());
        self.save(&state)?;
        Ok(chat)
    }

    async fn get(&self, id: &str) -> Result<Option<Chat>> {
        let state = self.state.lock().await;
        Ok(state.chats.iter().find(|c| c.id == id).cloned())
    }

    async fn append_messages(&self, id: &str, messages: Vec<ChatMessage>) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(chat) = state.chats.iter_mut().find(|c| c.id == id) else {
            return Ok(false);
        };
        chat.messages.extend(messages);
        chat.updated_at = crate::utils::now_ts();
        self.save(&state)?;
        Ok(true)
    }
}
