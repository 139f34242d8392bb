//! End-to-end pipeline tests: supervisor + queue + multiplexer driven by a
//! scripted answer source, observed from the consumer side of the channel.
//!
//! Run with: `cargo test -p finsight-agent --test pipeline`

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use finsight_agent::multiplexer::{run_stream, StreamParams};
use finsight_agent::source::{PlannedCall, ScriptedSource};
use finsight_core::config::{Config, StreamingConfig};
use finsight_core::protocol::{ChatRequest, StreamEvent};
use finsight_core::store::{ChatStore, JsonlChatStore};
use finsight_tools::market::StaticMarket;
use finsight_tools::{register_builtin_tools, ToolRegistry};

fn test_config() -> Config {
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

fn test_params(source: ScriptedSource, dir: &std::path::Path) -> StreamParams {
    let mut registry = ToolRegistry::new();
    register_builtin_tools(&mut registry);
    StreamParams {
        config: Arc::new(test_config()),
        tools: Arc::new(registry),
        market: Arc::new(StaticMarket::new()),
        source: Arc::new(source),
        store: Arc::new(JsonlChatStore::new(dir.to_path_buf())),
    }
}

async fn run_and_collect(params: StreamParams, request: ChatRequest) -> Vec<StreamEvent> {
    let (tx, mut rx) = mpsc::channel(32);
    let driver = tokio::spawn(run_stream(params, request, tx));

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    driver.await.unwrap();
    events
}

/// Scenario: one tool then a two-fragment answer. Tool lifecycle first,
/// then the tokens, then `done`; concatenated tokens reproduce the answer.
#[tokio::test]
async fn test_single_tool_then_answer() {
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::with_fragments(vec!["AAPL is ".into(), "up 2%".into()])
        .with_plan(vec![PlannedCall {
            tool_name: "search_ticker".into(),
            inputs: serde_json::json!({"query": "apple"}),
        }]);

    let mut request = ChatRequest::new("how is apple doing?");
    request.chat_id = Some("c-existing".into());
    let events = run_and_collect(test_params(source, dir.path()), request).await;

    // tool_start, tool_end, token chunks, done, in that order.
    assert!(matches!(events[0], StreamEvent::ToolStart { .. }));
    assert!(matches!(events[1], StreamEvent::ToolEnd { .. }));

    let answer: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::TokenChunk { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(answer, "AAPL is up 2%");
    assert!(matches!(events.last().unwrap(), StreamEvent::Done));
}

/// Every run_id sees tool_start exactly once, then exactly one
/// terminal tool event, never both, never terminal-first.
#[tokio::test]
async fn test_tool_lifecycle_exclusivity() {
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::new().with_plan(vec![
        PlannedCall {
            tool_name: "fetch_quote".into(),
            inputs: serde_json::json!({"symbol": "AAPL"}),
        },
        PlannedCall {
            tool_name: "fetch_quote".into(),
            // unknown symbol → tool_error path
            inputs: serde_json::json!({"symbol": "ZZZZ"}),
        },
        PlannedCall {
            tool_name: "fibonacci_levels".into(),
            inputs: serde_json::json!({"symbol": "MSFT"}),
        },
    ]);

    let mut request = ChatRequest::new("analyze");
    request.chat_id = Some("c1".into());
    let events = run_and_collect(test_params(source, dir.path()), request).await;

    let mut started: HashMap<String, usize> = HashMap::new();
    let mut terminated: HashMap<String, usize> = HashMap::new();
    for event in &events {
        match event {
            StreamEvent::ToolStart { run_id, .. } => {
                *started.entry(run_id.clone()).or_insert(0) += 1;
            }
            StreamEvent::ToolEnd { run_id, .. } | StreamEvent::ToolError { run_id, .. } => {
                assert!(started.contains_key(run_id), "terminal before start");
                *terminated.entry(run_id.clone()).or_insert(0) += 1;
            }
            _ => {}
        }
    }
    assert_eq!(started.len(), 3);
    for (run_id, count) in &started {
        assert_eq!(*count, 1, "duplicate tool_start for {run_id}");
        assert_eq!(terminated.get(run_id), Some(&1), "bad terminal count for {run_id}");
    }
}

/// Scenario: a tool fails but the agent still answers: the stream ends in
/// `done`, not `error`.
#[tokio::test]
async fn test_tool_failure_still_done() {
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::with_fragments(vec!["no data available".into()]).with_plan(vec![
        PlannedCall {
            tool_name: "fetch_quote".into(),
            inputs: serde_json::json!({"symbol": "ZZZZ"}),
        },
    ]);

    let mut request = ChatRequest::new("quote?");
    request.chat_id = Some("c1".into());
    let events = run_and_collect(test_params(source, dir.path()), request).await;

    assert!(events
        .iter()
        .any(|e| matches!(e, StreamEvent::ToolError { .. })));
    assert!(matches!(events.last().unwrap(), StreamEvent::Done));
}

/// Exactly one terminal event per stream, strictly last, across both
/// success and failure shapes.
#[tokio::test]
async fn test_terminal_uniqueness() {
    for failing in [false, true] {
        let dir = tempfile::tempdir().unwrap();
        let source = if failing {
            ScriptedSource::new().failing_answer()
        } else {
            ScriptedSource::new()
        };
        let events =
            run_and_collect(test_params(source, dir.path()), ChatRequest::new("hello")).await;

        let terminals: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_terminal())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(terminals.len(), 1, "failing={failing}");
        assert_eq!(terminals[0], events.len() - 1, "failing={failing}");
    }
}

/// A producer burst beyond the queue bound trips the
/// breaker once and the stream terminates with an overflow error.
#[tokio::test]
async fn test_queue_overflow_surfaces_as_stream_error() {
    let dir = tempfile::tempdir().unwrap();
    // 150 token chunks of 1 char each against a 100-slot queue, while the
    // consumer is held back by a tiny channel the test drains late.
    let config = Config {
        streaming: Some(StreamingConfig {
            max_queue_size: Some(100),
            chunk_size: Some(1),
            chunk_delay_ms: Some(0),
            poll_timeout_ms: Some(10),
            max_message_len: None,
        }),
        ..Default::default()
    };
    let mut registry = ToolRegistry::new();
    register_builtin_tools(&mut registry);
    let params = StreamParams {
        config: Arc::new(config),
        tools: Arc::new(registry),
        market: Arc::new(StaticMarket::new()),
        source: Arc::new(ScriptedSource::with_fragments(vec!["y".repeat(150)])),
        store: Arc::new(JsonlChatStore::new(dir.path().to_path_buf())),
    };

    let (tx, mut rx) = mpsc::channel(1);
    let mut request = ChatRequest::new("spam");
    request.chat_id = Some("c1".into());
    let driver = tokio::spawn(run_stream(params, request, tx));

    // Let the producer outrun the blocked consumer.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    driver.await.unwrap();

    match events.last().expect("stream emitted nothing") {
        StreamEvent::Error { message } => assert!(message.contains("overflow")),
        other => panic!("expected overflow error terminal, got {other:?}"),
    }
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

/// chat_created precedes done and carries the id persistence actually used.
#[tokio::test]
async fn test_chat_created_before_done_and_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonlChatStore::new(dir.path().to_path_buf()));
    let mut registry = ToolRegistry::new();
    register_builtin_tools(&mut registry);
    let params = StreamParams {
        config: Arc::new(test_config()),
        tools: Arc::new(registry),
        market: Arc::new(StaticMarket::new()),
        source: Arc::new(ScriptedSource::new()),
        store: store.clone(),
    };

    let events = run_and_collect(params, ChatRequest::new("first message")).await;

    let created_pos = events
        .iter()
        .position(|e| matches!(e, StreamEvent::ChatCreated { .. }))
        .expect("no chat_created");
    let done_pos = events
        .iter()
        .position(|e| matches!(e, StreamEvent::Done))
        .expect("no done");
    assert!(created_pos < done_pos);

    let chat_id = match &events[created_pos] {
        StreamEvent::ChatCreated { chat_id } => chat_id.clone(),
        _ => unreachable!(),
    };
    assert!(store.get(&chat_id).await.unwrap().is_some());

    // A first message also gets a title, before done.
    let title_pos = events
        .iter()
        .position(|e| matches!(e, StreamEvent::TitleGenerated { .. }))
        .expect("no title_generated");
    assert!(title_pos < done_pos);
}
