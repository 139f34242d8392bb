//! Chat client: local validation, the dedup gate, and stream consumption.

use serde::Deserialize;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use finsight_core::protocol::{ChatRequest, StreamEvent};
use finsight_core::types::{ChatExchange, ChatSummary, Message};
use finsight_core::{FinsightError, Result};

use crate::guard::SubmitGuard;
use crate::reducer::StreamReducer;
use crate::sse::response_events;

/// Default cap mirroring the server's `max_message_len`.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 4000;

/// How a submit ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Stream completed with `done`.
    Completed,
    /// Stream or request failed; the transcript carries the error message.
    Failed(String),
    /// A prior submit was still pending; nothing was sent.
    Duplicate,
}

/// Reject a message before any network call: synchronous, local, no
/// stream opened.
pub fn validate_message(message: &str, max_len: usize) -> Result<()> {
    if message.trim().is_empty() {
        return Err(FinsightError::Validation("Message must not be empty".into()));
    }
    if message.chars().count() > max_len {
        return Err(FinsightError::Validation(format!(
            "Message exceeds the {max_len}-character limit"
        )));
    }
    if message.contains('\0') || message.to_lowercase().contains("<script") {
        return Err(FinsightError::Validation(
            "Message contains disallowed content".into(),
        ));
    }
    Ok(())
}

pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    max_message_len: usize,
    reducer: StreamReducer,
    send_guard: SubmitGuard,
    restore_guard: SubmitGuard,
    current_symbol: Option<String>,
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            reducer: StreamReducer::new(),
            send_guard: SubmitGuard::new(),
            restore_guard: SubmitGuard::new(),
            current_symbol: None,
        }
    }

    /// Set the symbol context sent with every request. The request field
    /// is authoritative server-side, so no separate state-sync call can
    /// race it.
    pub fn set_symbol(&mut self, symbol: Option<String>) {
        self.current_symbol = symbol;
    }

    pub fn transcript(&self) -> &[Message] {
        self.reducer.messages()
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.reducer.chat_id()
    }

    pub fn reducer_mut(&mut self) -> &mut StreamReducer {
        &mut self.reducer
    }

    /// Submit a message and consume the stream to its terminal event,
    /// invoking `on_event` after each event is applied (for incremental
    /// rendering).
    pub async fn submit_with<F>(&mut self, message: &str, mut on_event: F) -> Result<SubmitOutcome>
    where
        F: FnMut(&StreamEvent, &[Message]),
    {
        validate_message(message, self.max_message_len)?;

        // Checked synchronously before anything is sent; a duplicate is a
        // logged no-op, never a queued retry.
        let Some(_permit) = self.send_guard.try_acquire("chat_submit") else {
            return Ok(SubmitOutcome::Duplicate);
        };

        // Request-scoped accumulator: each submit owns its own.
        let mut request_state = self.reducer.begin(message);

        let mut body = ChatRequest::new(message);
        body.chat_id = self.reducer.chat_id().map(str::to_string);
        body.current_symbol = self.current_symbol.clone();

        let response = match self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let message = format!("Request failed: {e}");
                self.reducer.apply(
                    &mut request_state,
                    &StreamEvent::Error { message: message.clone() },
                );
                return Ok(SubmitOutcome::Failed(message));
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let message = match response.json::<ErrorBody>().await {
                Ok(body) => body.error,
                Err(_) => format!("Request rejected with status {status}"),
            };
            self.reducer.apply(
                &mut request_state,
                &StreamEvent::Error { message: message.clone() },
            );
            return Ok(SubmitOutcome::Failed(message));
        }

        let mut events = std::pin::pin!(response_events(response));
        let mut outcome = None;

        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    // Strict arrival order, applied to completion before
                    // the next read.
                    self.reducer.apply(&mut request_state, &event);
                    on_event(&event, self.reducer.messages());

                    match &event {
                        StreamEvent::Done => {
                            outcome = Some(SubmitOutcome::Completed);
                            break;
                        }
                        StreamEvent::Error { message } => {
                            outcome = Some(SubmitOutcome::Failed(message.clone()));
                            break;
                        }
                        _ => {}
                    }
                }
                Err(e) => {
                    warn!(%e, "Stream read failed");
                    let message = format!("Connection interrupted: {e}");
                    self.reducer.apply(
                        &mut request_state,
                        &StreamEvent::Error { message: message.clone() },
                    );
                    return Ok(SubmitOutcome::Failed(message));
                }
            }
        }

        match outcome {
            Some(outcome) => Ok(outcome),
            None => {
                // Stream ended without a terminal event: the server went
                // away mid-stream.
                let message = "Stream ended unexpectedly".to_string();
                self.reducer.apply(
                    &mut request_state,
                    &StreamEvent::Error { message: message.clone() },
                );
                Ok(SubmitOutcome::Failed(message))
            }
        }
    }

    /// Submit without an event callback.
    pub async fn submit(&mut self, message: &str) -> Result<SubmitOutcome> {
        self.submit_with(message, |_, _| {}).await
    }

    /// Restore a stored conversation into the transcript. Overlapping
    /// restores from rapid navigation are dropped, returning false.
    pub async fn restore(&mut self, chat_id: &str) -> Result<bool> {
        let Some(_permit) = self.restore_guard.try_acquire("chat_restore") else {
            return Ok(false);
        };

        let response = self
            .http
            .get(format!("{}/api/chats/{chat_id}", self.base_url))
            .send()
            .await
            .map_err(|e| FinsightError::Stream(format!("Restore failed: {e}")))?;

        if !response.status().is_success() {
            return Err(FinsightError::Stream(format!(
                "Restore rejected with status {}",
                response.status()
            )));
        }

        let body: ChatBody = response
            .json()
            .await
            .map_err(|e| FinsightError::Stream(format!("Bad restore payload: {e}")))?;

        let mut messages = Vec::with_capacity(body.exchanges.len() * 2);
        for exchange in &body.exchanges {
            messages.push(Message::user(&exchange.user_message));
            let mut assistant = Message::assistant_placeholder();
            assistant.content = exchange.assistant_message.clone();
            messages.push(assistant);
        }

        debug!(%chat_id, messages = messages.len(), "Restored conversation");
        self.reducer = StreamReducer::from_history(chat_id, messages);
        Ok(true)
    }

    /// List stored conversations.
    pub async fn list_chats(&self) -> Result<Vec<ChatSummary>> {
        let response = self
            .http
            .get(format!("{}/api/chats", self.base_url))
            .send()
            .await
            .map_err(|e| FinsightError::Stream(format!("List failed: {e}")))?;

        let body: ChatsBody = response
            .json()
            .await
            .map_err(|e| FinsightError::Stream(format!("Bad list payload: {e}")))?;
        Ok(body.chats)
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Deserialize)]
struct ChatBody {
    exchanges: Vec<ChatExchange>,
}

#[derive(Deserialize)]
struct ChatsBody {
    chats: Vec<ChatSummary>,
}
