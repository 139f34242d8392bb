//! Transcript and persistence model.
//!
//! A [`Message`] is one entry in the client-side transcript. The assistant
//! message that accumulates streamed tokens is a single placeholder entry
//! created at send time and mutated in place; tool-progress entries are
//! separate entries keyed by `tool_{run_id}` inserted around it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// Lifecycle status of a tool invocation shown in the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Running,
    Success,
    Error,
}

/// Progress of one tool invocation, mirrored from the stream events for
/// its `run_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolProgress {
    pub status: ToolStatus,
    pub tool_name: String,
    pub display_name: String,
    pub icon: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// One transcript entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_progress: Option<ToolProgress>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::User,
            content: content.into(),
            tool_progress: None,
            timestamp: Utc::now(),
        }
    }

    /// Empty assistant entry that streamed tokens will fill in.
    pub fn assistant_placeholder() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: String::new(),
            tool_progress: None,
            timestamp: Utc::now(),
        }
    }

    /// Tool-progress entry for a freshly started invocation. The id is
    /// `tool_{run_id}` so terminal events can find it again.
    pub fn tool_running(
        run_id: &str,
        tool_name: impl Into<String>,
        display_name: impl Into<String>,
        icon: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("tool_{run_id}"),
            role: Role::Assistant,
            content: String::new(),
            tool_progress: Some(ToolProgress {
                status: ToolStatus::Running,
                tool_name: tool_name.into(),
                display_name: display_name.into(),
                icon: icon.into(),
                output: None,
                error: None,
                duration_ms: None,
            }),
            timestamp: Utc::now(),
        }
    }
}

/// Metadata for one tool call, recorded alongside a persisted exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub run_id: String,
    pub tool_name: String,
    pub inputs: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// One complete user/assistant exchange, as handed to the store after the
/// stream finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatExchange {
    pub user_message: String,
    pub assistant_message: String,
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Summary of a stored conversation, for chat lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSummary {
    pub chat_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub exchanges: usize,
    pub updated_at: DateTime<Utc>,
}
