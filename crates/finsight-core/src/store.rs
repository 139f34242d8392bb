//! JSONL-based chat store: conversations as append-only JSONL files.
//!
//! Persistence is a post-stream side effect: `save_exchange` failures are
//! logged by the caller and never affect an already-delivered stream.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::error::{FinsightError, Result};
use crate::types::{ChatExchange, ChatSummary};

/// Durable conversation storage.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Append one exchange. `chat_id = None` creates a new conversation;
    /// the returned id is the one the client should reuse.
    async fn save_exchange(&self, chat_id: Option<String>, exchange: ChatExchange)
        -> Result<String>;

    /// Full exchange history for a conversation, oldest first.
    async fn get(&self, chat_id: &str) -> Result<Option<Vec<ChatExchange>>>;

    /// Summaries of all stored conversations, most recently updated first.
    async fn list(&self) -> Result<Vec<ChatSummary>>;

    /// Set or replace the conversation title.
    async fn set_title(&self, chat_id: &str, title: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMeta {
    chat_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    exchanges: usize,
    updated_at: chrono::DateTime<Utc>,
}

/// File-based chat store using JSONL for exchanges.
///
/// Layout:
/// - `<base>/chats.json`: array of chat metadata
/// - `<base>/exchanges/<chat_id>.jsonl`: one exchange per line
pub struct JsonlChatStore {
    base: PathBuf,
    // Serializes index read-modify-write cycles
    index_lock: tokio::sync::Mutex<()>,
}

impl JsonlChatStore {
    pub fn new(base: PathBuf) -> Self {
        Self {
            base,
            index_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn index_path(&self) -> PathBuf {
        self.base.join("chats.json")
    }

    fn exchange_dir(&self) -> PathBuf {
        self.base.join("exchanges")
    }

    fn exchange_path(&self, chat_id: &str) -> PathBuf {
        self.exchange_dir().join(format!("{chat_id}.jsonl"))
    }

    async fn ensure_dirs(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.base).await?;
        tokio::fs::create_dir_all(self.exchange_dir()).await?;
        Ok(())
    }

    async fn load_index(&self) -> Result<Vec<ChatMeta>> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let metas: Vec<ChatMeta> = serde_json::from_str(&data)?;
        Ok(metas)
    }

    async fn save_index(&self, metas: &[ChatMeta]) -> Result<()> {
        self.ensure_dirs().await?;
        let data = serde_json::to_string_pretty(metas)?;
        let path = self.index_path();
        // Atomic write: write to temp then rename
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl ChatStore for JsonlChatStore {
    async fn save_exchange(
        &self,
        chat_id: Option<String>,
        exchange: ChatExchange,
    ) -> Result<String> {
        let _guard = self.index_lock.lock().await;
        self.ensure_dirs().await?;

        let chat_id = chat_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.exchange_path(&chat_id))
            .await?;
        let mut line = serde_json::to_string(&exchange)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        let mut metas = self.load_index().await?;
        match metas.iter_mut().find(|m| m.chat_id == chat_id) {
            Some(meta) => {
                meta.exchanges += 1;
                meta.updated_at = Utc::now();
            }
            None => metas.push(ChatMeta {
                chat_id: chat_id.clone(),
                title: None,
                exchanges: 1,
                updated_at: Utc::now(),
            }),
        }
        self.save_index(&metas).await?;

        debug!(%chat_id, "Saved exchange");
        Ok(chat_id)
    }

    async fn get(&self, chat_id: &str) -> Result<Option<Vec<ChatExchange>>> {
        let path = self.exchange_path(chat_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let mut exchanges = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let exchange: ChatExchange = serde_json::from_str(line)
                .map_err(|e| FinsightError::Store(format!("corrupt exchange line: {e}")))?;
            exchanges.push(exchange);
        }
        Ok(Some(exchanges))
    }

    async fn list(&self) -> Result<Vec<ChatSummary>> {
        let mut metas = self.load_index().await?;
        metas.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(metas
            .into_iter()
            .map(|m| ChatSummary {
                chat_id: m.chat_id,
                title: m.title,
                exchanges: m.exchanges,
                updated_at: m.updated_at,
            })
            .collect())
    }

    async fn set_title(&self, chat_id: &str, title: &str) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        let mut metas = self.load_index().await?;
        let meta = metas
            .iter_mut()
            .find(|m| m.chat_id == chat_id)
            .ok_or_else(|| FinsightError::Store(format!("unknown chat: {chat_id}")))?;
        meta.title = Some(title.to_string());
        self.save_index(&metas).await
    }
}
