//! Transcript reducer: applies stream events to the message list.
//!
//! The reducer is the sole owner of the transcript. Each event is applied
//! synchronously and to completion before the next one; application is
//! idempotent under duplicate delivery and order-preserving under arrival
//! order.
//!
//! The token accumulator lives on the per-request [`ActiveRequest`], never
//! read back from the transcript: writing `accumulated` wholesale into the
//! placeholder sidesteps the lost-update race where two appends each read
//! a stale previous value and clobber one another.
//!
//! Error policy: partial streamed content is preserved and the error is
//! appended as a flagged line. Delivered tokens are never erased.

use tracing::{debug, warn};

use finsight_core::protocol::StreamEvent;
use finsight_core::types::{Message, ToolStatus};

/// Per-request mutable state, owned by one logical submit. Never shared
/// across concurrent requests.
#[derive(Debug)]
pub struct ActiveRequest {
    placeholder_id: String,
    accumulated: String,
    finished: bool,
    refresh_fired: bool,
}

impl ActiveRequest {
    pub fn placeholder_id(&self) -> &str {
        &self.placeholder_id
    }

    /// Whether a terminal event has frozen this request's placeholder.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[derive(Default)]
pub struct StreamReducer {
    messages: Vec<Message>,
    chat_id: Option<String>,
    title: Option<String>,
    /// Fired exactly once per stream on `done`, for cache invalidation
    /// (e.g., refreshing a chat list against persisted state).
    refresh_hook: Option<Box<dyn FnMut() + Send>>,
}

impl StreamReducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chat_id(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: Some(chat_id.into()),
            ..Self::default()
        }
    }

    /// Rebuild a reducer from a restored conversation's messages.
    pub fn from_history(chat_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            messages,
            chat_id: Some(chat_id.into()),
            ..Self::default()
        }
    }

    pub fn set_refresh_hook(&mut self, hook: Box<dyn FnMut() + Send>) {
        self.refresh_hook = Some(hook);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The conversation id to reuse on subsequent submits, once known.
    pub fn chat_id(&self) -> Option<&str> {
        self.chat_id.as_deref()
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Begin a request: append the user message and the assistant
    /// placeholder in one atomic update, returning the request state.
    pub fn begin(&mut self, user_text: &str) -> ActiveRequest {
        let user = Message::user(user_text);
        let placeholder = Message::assistant_placeholder();
        let placeholder_id = placeholder.id.clone();
        self.messages.push(user);
        self.messages.push(placeholder);

        ActiveRequest {
            placeholder_id,
            accumulated: String::new(),
            finished: false,
            refresh_fired: false,
        }
    }

    /// Apply one event. Runs to completion synchronously; there is no
    /// suspension inside a single event's application.
    pub fn apply(&mut self, request: &mut ActiveRequest, event: &StreamEvent) {
        match event {
            StreamEvent::TokenChunk { content } => {
                if request.finished {
                    debug!("Token after terminal event ignored");
                    return;
                }
                request.accumulated.push_str(content);
                // Write the owned total, never append to prior list state.
                let total = request.accumulated.clone();
                self.set_content(&request.placeholder_id, total);
            }

            StreamEvent::ToolStart {
                run_id,
                tool_name,
                display_name,
                icon,
                ..
            } => {
                let tool_id = format!("tool_{run_id}");
                if self.messages.iter().any(|m| m.id == tool_id) {
                    debug!(%run_id, "Duplicate tool_start ignored");
                    return;
                }
                // Insert the tool entry immediately before the placeholder:
                // remove the placeholder, append the tool entry, re-append
                // the placeholder with whatever it has accumulated so far.
                let placeholder = self.take_message(&request.placeholder_id);
                self.messages
                    .push(Message::tool_running(run_id, tool_name, display_name, icon));
                if let Some(placeholder) = placeholder {
                    self.messages.push(placeholder);
                }
            }

            StreamEvent::ToolEnd {
                run_id,
                output,
                duration_ms,
            } => {
                self.finish_tool(run_id, ToolStatus::Success, Some(output), None, *duration_ms);
            }

            StreamEvent::ToolError {
                run_id,
                error,
                duration_ms,
            } => {
                self.finish_tool(run_id, ToolStatus::Error, None, Some(error), *duration_ms);
            }

            StreamEvent::ChatCreated { chat_id } => {
                // Record for reuse; never re-trigger a creation request.
                if let Some(existing) = &self.chat_id {
                    if existing != chat_id {
                        warn!(%existing, %chat_id, "chat_created for a different conversation");
                    }
                    return;
                }
                self.chat_id = Some(chat_id.clone());
            }

            StreamEvent::TitleGenerated { title } => {
                if self.title.is_none() {
                    self.title = Some(title.clone());
                }
            }

            StreamEvent::Done => {
                if request.finished {
                    return;
                }
                request.finished = true;
                if !request.refresh_fired {
                    request.refresh_fired = true;
                    if let Some(hook) = &mut self.refresh_hook {
                        hook();
                    }
                }
            }

            StreamEvent::Error { message } => {
                if request.finished {
                    return;
                }
                request.finished = true;
                // Preserve partials: append the failure, never erase tokens
                // the user has already read.
                let content = if request.accumulated.is_empty() {
                    format!("⚠ {message}")
                } else {
                    format!("{}\n\n⚠ {message}", request.accumulated)
                };
                self.set_content(&request.placeholder_id, content);
            }
        }
    }

    fn set_content(&mut self, id: &str, content: String) {
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == id) {
            message.content = content;
        } else {
            warn!(%id, "No transcript entry to update");
        }
    }

    fn take_message(&mut self, id: &str) -> Option<Message> {
        let pos = self.messages.iter().position(|m| m.id == id)?;
        Some(self.messages.remove(pos))
    }

    fn finish_tool(
        &mut self,
        run_id: &str,
        status: ToolStatus,
        output: Option<&str>,
        error: Option<&str>,
        duration_ms: u64,
    ) {
        let tool_id = format!("tool_{run_id}");
        let Some(message) = self.messages.iter_mut().find(|m| m.id == tool_id) else {
            warn!(%run_id, "Terminal tool event with no matching entry");
            return;
        };
        let Some(progress) = message.tool_progress.as_mut() else {
            warn!(%run_id, "Transcript entry is not a tool entry");
            return;
        };
        if progress.status != ToolStatus::Running {
            debug!(%run_id, "Duplicate terminal tool event ignored");
            return;
        }
        progress.status = status;
        progress.output = output.map(str::to_string);
        progress.error = error.map(str::to_string);
        progress.duration_ms = Some(duration_ms);
    }
}
