//! Wire protocol for the chat stream.
//!
//! Every event travelling from server to client is a [`StreamEvent`],
//! serialized as one SSE frame (`data: <json>\n\n`) with a `type` field
//! discriminating the variant. Both the multiplexer (construction) and the
//! client reducer (consumption) match this enum exhaustively; there is no
//! stringly-typed branching on either side.
//!
//! Stream contract:
//! - every `run_id` goes `tool_start` → exactly one of `tool_end`/`tool_error`;
//! - exactly one of `done`/`error` is emitted per stream, and it is last;
//! - `token_chunk` contents concatenated in arrival order reproduce the
//!   final answer byte-for-byte;
//! - `chat_created`, when present, precedes `done`.

use serde::{Deserialize, Serialize};

/// Events emitted on the chat stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum StreamEvent {
    /// An incremental slice of the final answer.
    #[serde(rename = "token_chunk")]
    TokenChunk { content: String },

    /// A tool invocation has started. Emitted once per `run_id`.
    #[serde(rename = "tool_start")]
    ToolStart {
        run_id: String,
        tool_name: String,
        display_name: String,
        icon: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        symbol: Option<String>,
        inputs: serde_json::Value,
    },

    /// A tool invocation completed successfully.
    #[serde(rename = "tool_end")]
    ToolEnd {
        run_id: String,
        output: String,
        duration_ms: u64,
    },

    /// A tool invocation failed. Mutually exclusive with `tool_end` for a
    /// given `run_id`.
    #[serde(rename = "tool_error")]
    ToolError {
        run_id: String,
        error: String,
        duration_ms: u64,
    },

    /// A new conversation was created server-side. Emitted at most once,
    /// and only when the request carried no `chat_id`.
    #[serde(rename = "chat_created")]
    ChatCreated { chat_id: String },

    /// A title was generated for the conversation. At most once per stream.
    #[serde(rename = "title_generated")]
    TitleGenerated { title: String },

    /// The stream completed successfully. Always the last event.
    #[serde(rename = "done")]
    Done,

    /// The stream failed. Always the last event when present.
    #[serde(rename = "error")]
    Error { message: String },
}

impl StreamEvent {
    /// Whether this event terminates the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error { .. })
    }

    /// Serialize to a single SSE frame: `data: <json>\n\n`.
    pub fn to_sse_frame(&self) -> crate::Result<String> {
        let json = serde_json::to_string(self)?;
        Ok(format!("data: {json}\n\n"))
    }

    /// Parse the JSON payload of one SSE `data:` line.
    pub fn from_sse_data(data: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,

    /// Conversation to continue, or `None` to create one (the server then
    /// emits `chat_created` with the new id).
    #[serde(default)]
    pub chat_id: Option<String>,

    /// Symbol context for tool execution. When present this wins over any
    /// server-stored UI symbol: the request itself is the source of truth,
    /// so no ordering between a separate state-sync call and this request
    /// can change which symbol the tools see.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_symbol: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            chat_id: None,
            current_symbol: None,
            title: None,
            role: None,
            source: None,
            metadata: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_chunk_wire_shape() {
        let event = StreamEvent::TokenChunk {
            content: "AAPL is ".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"token_chunk\""));
        assert!(json.contains("\"content\":\"AAPL is \""));
    }

    #[test]
    fn test_tool_start_roundtrip() {
        let event = StreamEvent::ToolStart {
            run_id: "r1".into(),
            tool_name: "search_ticker".into(),
            display_name: "Searching tickers".into(),
            icon: "search".into(),
            symbol: Some("AAPL".into()),
            inputs: serde_json::json!({"query": "apple"}),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back = StreamEvent::from_sse_data(&json).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn test_symbol_omitted_when_absent() {
        let event = StreamEvent::ToolStart {
            run_id: "r1".into(),
            tool_name: "fetch_quote".into(),
            display_name: "Fetching quote".into(),
            icon: "chart".into(),
            symbol: None,
            inputs: serde_json::json!({}),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("symbol"));
    }

    #[test]
    fn test_terminal_events() {
        assert!(StreamEvent::Done.is_terminal());
        assert!(StreamEvent::Error { message: "x".into() }.is_terminal());
        assert!(!StreamEvent::TokenChunk { content: "x".into() }.is_terminal());
    }

    #[test]
    fn test_sse_frame_format() {
        let frame = StreamEvent::Done.to_sse_frame().unwrap();
        assert_eq!(frame, "data: {\"type\":\"done\"}\n\n");
    }

    #[test]
    fn test_chat_request_defaults() {
        let req: ChatRequest =
            serde_json::from_str(r#"{"message": "how is AAPL doing?"}"#).unwrap();
        assert_eq!(req.message, "how is AAPL doing?");
        assert!(req.chat_id.is_none());
        assert!(req.current_symbol.is_none());
    }
}
