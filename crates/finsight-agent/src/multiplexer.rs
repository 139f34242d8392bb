//! Stream multiplexer: drains the event queue onto one ordered channel.
//!
//! Per-stream state machine:
//! `AwaitingTools → (StreamingTools)* → StreamingAnswer → Persisting → Closed`,
//! with `Errored` absorbing from any point (queue overflow, upstream
//! failure, client disconnect).
//!
//! The drain loop exits only when a poll timeout coincides with the agent
//! task being done AND the queue being empty. It never breaks because an
//! event "looked like the last one"; tool completion is not answer
//! completion, and the synthesized answer always follows the tool phase.
//!
//! Exactly one terminal event (`done` or `error`) is written per stream,
//! and it is always the last thing written, including on internal failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use finsight_core::config::Config;
use finsight_core::protocol::{ChatRequest, StreamEvent};
use finsight_core::store::ChatStore;
use finsight_core::types::{ChatExchange, ToolCallRecord};
use finsight_tools::market::MarketData;
use finsight_tools::{ToolContext, ToolRegistry};

use crate::queue::{EventQueue, Pop};
use crate::source::AnswerSource;
use crate::supervisor::ToolSupervisor;

/// Everything a stream needs besides the request itself.
#[derive(Clone)]
pub struct StreamParams {
    pub config: Arc<Config>,
    pub tools: Arc<ToolRegistry>,
    pub market: Arc<dyn MarketData>,
    pub source: Arc<dyn AnswerSource>,
    pub store: Arc<dyn ChatStore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamPhase {
    AwaitingTools,
    StreamingTools,
    StreamingAnswer,
    Persisting,
    Closed,
    Errored,
}

/// Outbound writer that enforces the terminal-event contract: nothing is
/// written after a terminal event, and it tracks whether one was sent.
struct Outbound {
    tx: mpsc::Sender<StreamEvent>,
    terminal_sent: bool,
}

/// The client went away; the transport write failed.
struct ClientGone;

impl Outbound {
    async fn send(&mut self, event: StreamEvent) -> std::result::Result<(), ClientGone> {
        if self.terminal_sent {
            return Ok(());
        }
        let terminal = event.is_terminal();
        self.tx.send(event).await.map_err(|_| ClientGone)?;
        if terminal {
            self.terminal_sent = true;
        }
        Ok(())
    }
}

enum DriveError {
    ClientGone,
    Fatal(String),
}

struct AgentOutcome {
    answer: String,
    records: Vec<ToolCallRecord>,
    title: Option<String>,
    error: Option<String>,
}

/// Run one chat stream to completion, writing every event to `tx`.
///
/// This function owns the whole lifecycle: it spawns the agent task,
/// drains the queue in arrival order, emits the single terminal event,
/// and persists the exchange afterwards. It never panics the caller and
/// never leaves the channel without a terminal event unless the client
/// is already gone.
pub async fn run_stream(params: StreamParams, request: ChatRequest, tx: mpsc::Sender<StreamEvent>) {
    let mut out = Outbound {
        tx,
        terminal_sent: false,
    };

    match drive(&params, request, &mut out).await {
        Ok(()) => {}
        Err(DriveError::ClientGone) => {
            debug!("Client disconnected mid-stream");
        }
        Err(DriveError::Fatal(message)) => {
            error!(%message, "Stream failed");
            // Guaranteed-last error event; ignore a gone client.
            let _ = out.send(StreamEvent::Error { message }).await;
        }
    }
}

async fn drive(
    params: &StreamParams,
    request: ChatRequest,
    out: &mut Outbound,
) -> std::result::Result<(), DriveError> {
    let new_chat = request.chat_id.is_none();
    let chat_id = request
        .chat_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut phase = StreamPhase::AwaitingTools;
    info!(%chat_id, new_chat, "Stream started");

    // chat_created must precede every persistence-dependent event.
    if new_chat {
        out.send(StreamEvent::ChatCreated {
            chat_id: chat_id.clone(),
        })
        .await
        .map_err(|_| DriveError::ClientGone)?;
    }

    let queue = Arc::new(EventQueue::new(params.config.max_queue_size()));
    let done = Arc::new(AtomicBool::new(false));

    let handle = {
        let queue = queue.clone();
        let done = done.clone();
        let params = params.clone();
        let message = request.message.clone();
        let symbol = request.current_symbol.clone();
        tokio::spawn(async move {
            // Contain panics so the drain loop always observes `done`.
            let result = std::panic::AssertUnwindSafe(agent_task(
                message, symbol, new_chat, params, queue,
            ))
            .catch_unwind()
            .await;
            done.store(true, Ordering::SeqCst);
            result.unwrap_or_else(|_| AgentOutcome {
                answer: String::new(),
                records: Vec::new(),
                title: None,
                error: Some("agent task panicked".into()),
            })
        })
    };

    let poll = Duration::from_millis(params.config.poll_timeout_ms());
    let mut errored = false;

    loop {
        match queue.pop(poll).await {
            Pop::Event(event) => {
                match &event {
                    StreamEvent::ToolStart { .. } => phase = StreamPhase::StreamingTools,
                    StreamEvent::TokenChunk { .. } => phase = StreamPhase::StreamingAnswer,
                    _ => {}
                }
                let terminal = event.is_terminal();
                if out.send(event).await.is_err() {
                    // Transport write failed: stop supervision for this
                    // stream. In-flight tools run out their course and
                    // have their events rejected by the closed queue.
                    queue.close();
                    return Err(DriveError::ClientGone);
                }
                if terminal {
                    // Only the overflow breaker injects a terminal event
                    // into the queue; the stream is dead.
                    errored = true;
                    break;
                }
            }
            Pop::Timeout => {
                // The only valid exit: timed out AND the agent task has
                // finished AND nothing is left to deliver.
                if done.load(Ordering::SeqCst) && queue.is_empty() {
                    break;
                }
            }
            Pop::Closed => {
                errored = true;
                break;
            }
        }
    }

    if errored {
        phase = StreamPhase::Errored;
        debug!(?phase, %chat_id, "Stream aborted by queue breaker");
        // Agent task keeps running detached; its pushes are rejected.
        return Ok(());
    }

    let outcome = handle
        .await
        .map_err(|e| DriveError::Fatal(format!("agent task failed: {e}")))?;

    if let Some(message) = outcome.error {
        phase = StreamPhase::Errored;
        debug!(?phase, %chat_id, "Stream finished with error");
        out.send(StreamEvent::Error { message })
            .await
            .map_err(|_| DriveError::ClientGone)?;
        return Ok(());
    }

    out.send(StreamEvent::Done)
        .await
        .map_err(|_| DriveError::ClientGone)?;

    // Persistence is a post-stream side effect: the client already has the
    // full answer; a save failure is logged, never replayed into the stream.
    phase = StreamPhase::Persisting;
    debug!(?phase, %chat_id, "Persisting exchange");
    let exchange = ChatExchange {
        user_message: request.message,
        assistant_message: outcome.answer,
        tool_calls: outcome.records,
        symbol: request.current_symbol,
        timestamp: Utc::now(),
    };
    match params
        .store
        .save_exchange(Some(chat_id.clone()), exchange)
        .await
    {
        Ok(_) => {
            if let Some(title) = outcome.title {
                if let Err(e) = params.store.set_title(&chat_id, &title).await {
                    warn!(%chat_id, %e, "Failed to save chat title");
                }
            }
        }
        Err(e) => {
            warn!(%chat_id, %e, "Persistence failed after stream delivery");
        }
    }

    phase = StreamPhase::Closed;
    debug!(?phase, %chat_id, "Stream closed");
    Ok(())
}

/// The agent task: plan tools, supervise their execution, then stream the
/// synthesized answer into the queue in fixed-size chunks.
async fn agent_task(
    message: String,
    symbol: Option<String>,
    new_chat: bool,
    params: StreamParams,
    queue: Arc<EventQueue>,
) -> AgentOutcome {
    let mut outcome = AgentOutcome {
        answer: String::new(),
        records: Vec::new(),
        title: None,
        error: None,
    };

    let definitions = params.tools.definitions();
    let plan = match params
        .source
        .plan(&message, &definitions, symbol.as_deref())
        .await
    {
        Ok(plan) => plan,
        Err(e) => {
            outcome.error = Some(format!("Planning failed: {e}"));
            return outcome;
        }
    };

    if !plan.is_empty() {
        let supervisor = ToolSupervisor::new(queue.clone(), params.tools.clone());
        let context = Arc::new(ToolContext {
            symbol: symbol.clone(),
            config: params.config.clone(),
            market: params.market.clone(),
        });
        outcome.records = supervisor.execute_all(plan, context).await;
    }

    if new_chat {
        match params.source.title(&message).await {
            Ok(Some(title)) => {
                let _ = queue.push(StreamEvent::TitleGenerated {
                    title: title.clone(),
                });
                outcome.title = Some(title);
            }
            Ok(None) => {}
            Err(e) => warn!(%e, "Title generation failed"),
        }
    }

    let mut stream = match params.source.answer(&message, &outcome.records).await {
        Ok(stream) => stream,
        Err(e) => {
            outcome.error = Some(format!("Answer generation failed: {e}"));
            return outcome;
        }
    };

    // Re-chunk fragments into fixed-size slices. Character-level emission
    // costs an order of magnitude more frames for no visible benefit.
    let chunk_size = params.config.chunk_size();
    let chunk_delay = Duration::from_millis(params.config.chunk_delay_ms());
    let mut pending = String::new();

    while let Some(fragment) = stream.next().await {
        match fragment {
            Ok(fragment) => {
                outcome.answer.push_str(&fragment);
                pending.push_str(&fragment);
                while pending.chars().count() >= chunk_size {
                    if !emit_chunk(&queue, &mut pending, chunk_size, chunk_delay).await {
                        return outcome;
                    }
                }
            }
            Err(e) => {
                // Partial answer stays delivered; the terminal error is
                // the multiplexer's to emit.
                outcome.error = Some(format!("Answer stream failed: {e}"));
                return outcome;
            }
        }
    }

    while !pending.is_empty() {
        if !emit_chunk(&queue, &mut pending, chunk_size, chunk_delay).await {
            return outcome;
        }
    }

    outcome
}

/// Push one `chunk_size`-character slice off the front of `pending`.
/// Returns false when the queue no longer accepts events.
async fn emit_chunk(
    queue: &EventQueue,
    pending: &mut String,
    chunk_size: usize,
    chunk_delay: Duration,
) -> bool {
    let split_at = pending
        .char_indices()
        .nth(chunk_size)
        .map(|(i, _)| i)
        .unwrap_or(pending.len());
    let content: String = pending.drain(..split_at).collect();

    if queue.push(StreamEvent::TokenChunk { content }).is_err() {
        debug!("Queue rejected token chunk, stopping answer emission");
        return false;
    }
    if !chunk_delay.is_zero() {
        tokio::time::sleep(chunk_delay).await;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use finsight_core::config::{Config, StreamingConfig};
    use finsight_core::store::JsonlChatStore;
    use finsight_tools::market::StaticMarket;
    use finsight_tools::register_builtin_tools;

    use crate::source::ScriptedSource;

    fn fast_config() -> Config {
        Config {
            streaming: Some(StreamingConfig {
                max_queue_size: Some(100),
                chunk_size: Some(10),
                chunk_delay_ms: Some(0),
                poll_timeout_ms: Some(10),
                max_message_len: None,
            }),
            ..Default::default()
        }
    }

    fn params(source: ScriptedSource, dir: &std::path::Path) -> StreamParams {
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry);
        StreamParams {
            config: Arc::new(fast_config()),
            tools: Arc::new(registry),
            market: Arc::new(StaticMarket::new()),
            source: Arc::new(source),
            store: Arc::new(JsonlChatStore::new(dir.to_path_buf())),
        }
    }

    async fn collect(
        params: StreamParams,
        request: ChatRequest,
    ) -> Vec<StreamEvent> {
        let (tx, mut rx) = mpsc::channel(32);
        let driver = tokio::spawn(run_stream(params, request, tx));

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        driver.await.unwrap();
        events
    }

    #[tokio::test]
    async fn test_tokens_concatenate_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::with_fragments(vec![
            "The quick brown fox ".into(),
            "jumps over the lazy dog".into(),
        ]);
        let events = collect(params(source, dir.path()), ChatRequest::new("hello")).await;

        let mut answer = String::new();
        for event in &events {
            if let StreamEvent::TokenChunk { content } = event {
                answer.push_str(content);
            }
        }
        assert_eq!(answer, "The quick brown fox jumps over the lazy dog");
    }

    #[tokio::test]
    async fn test_chunks_are_bounded_not_char_level() {
        let dir = tempfile::tempdir().unwrap();
        let text = "x".repeat(95);
        let source = ScriptedSource::with_fragments(vec![text.clone()]);
        let events = collect(params(source, dir.path()), ChatRequest::new("hello")).await;

        let chunks: Vec<&String> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TokenChunk { content } => Some(content),
                _ => None,
            })
            .collect();
        // 95 chars at chunk_size 10 → 10 frames, not 95.
        assert_eq!(chunks.len(), 10);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
    }

    #[tokio::test]
    async fn test_exactly_one_terminal_and_it_is_last() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new();
        let events = collect(
            params(source, dir.path()),
            ChatRequest::new("how is AAPL doing?"),
        )
        .await;

        let terminals = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminals, 1);
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_chat_created_only_for_new_chats() {
        let dir = tempfile::tempdir().unwrap();

        let events = collect(
            params(ScriptedSource::new(), dir.path()),
            ChatRequest::new("hi"),
        )
        .await;
        assert!(matches!(events[0], StreamEvent::ChatCreated { .. }));

        let mut request = ChatRequest::new("hi again");
        request.chat_id = Some("existing".into());
        let events = collect(params(ScriptedSource::new(), dir.path()), request).await;
        assert!(!events
            .iter()
            .any(|e| matches!(e, StreamEvent::ChatCreated { .. })));
    }

    #[tokio::test]
    async fn test_answer_failure_emits_terminal_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new().failing_answer();
        let events = collect(params(source, dir.path()), ChatRequest::new("hi")).await;

        match events.last().unwrap() {
            StreamEvent::Error { message } => assert!(message.contains("Answer")),
            other => panic!("expected error terminal, got {other:?}"),
        }
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_done_follows_tool_events_even_with_slow_answer() {
        // The synthesized answer comes after all tool events; exiting the
        // drain loop on "last tool event" would drop it entirely.
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new();
        let mut request = ChatRequest::new("price of AAPL please");
        request.current_symbol = Some("AAPL".into());
        let events = collect(params(source, dir.path()), request).await;

        let last_tool = events
            .iter()
            .rposition(|e| matches!(e, StreamEvent::ToolEnd { .. } | StreamEvent::ToolError { .. }))
            .expect("expected a tool event");
        let first_token = events
            .iter()
            .position(|e| matches!(e, StreamEvent::TokenChunk { .. }))
            .expect("expected answer tokens");
        assert!(first_token > last_tool);
        assert!(matches!(events.last().unwrap(), StreamEvent::Done));
    }

    #[tokio::test]
    async fn test_exchange_persisted_after_done() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonlChatStore::new(dir.path().to_path_buf()));

        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry);
        let params = StreamParams {
            config: Arc::new(fast_config()),
            tools: Arc::new(registry),
            market: Arc::new(StaticMarket::new()),
            source: Arc::new(ScriptedSource::new()),
            store: store.clone(),
        };

        let events = collect(params, ChatRequest::new("quote for MSFT")).await;
        let chat_id = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::ChatCreated { chat_id } => Some(chat_id.clone()),
                _ => None,
            })
            .unwrap();

        let history = store.get(&chat_id).await.unwrap().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].user_message, "quote for MSFT");
        assert!(!history[0].assistant_message.is_empty());
    }

    #[tokio::test]
    async fn test_client_disconnect_stops_supervision() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::with_fragments(
            (0..50).map(|i| format!("fragment {i} ")).collect(),
        );
        let (tx, rx) = mpsc::channel(1);
        // Drop the receiver immediately: every send fails.
        drop(rx);

        // Must return promptly instead of spinning on a queue nobody drains.
        tokio::time::timeout(
            Duration::from_secs(5),
            run_stream(params(source, dir.path()), ChatRequest::new("hi"), tx),
        )
        .await
        .expect("run_stream did not stop after client disconnect");
    }
}
