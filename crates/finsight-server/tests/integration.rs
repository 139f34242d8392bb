//! Server integration tests: start a real server and consume the SSE
//! stream end to end.
//!
//! Run with: `cargo test -p finsight-server --test integration`

use std::sync::Arc;

use serde_json::json;
use tokio_stream::StreamExt;

use finsight_agent::source::ScriptedSource;
use finsight_client::sse::response_events;
use finsight_core::config::{Config, StorageConfig};
use finsight_core::protocol::StreamEvent;
use finsight_server::{start_server, AppState};

/// Find an available port.
fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server with the given source and return its port. The TempDir
/// keeps the store alive for the test's duration.
async fn start_test_server(source: ScriptedSource) -> (u16, tempfile::TempDir) {
    let port = find_free_port();
    let data_dir = tempfile::tempdir().unwrap();

    let config = Config {
        storage: Some(StorageConfig {
            data_dir: Some(data_dir.path().to_string_lossy().into_owned()),
        }),
        ..Default::default()
    };

    let state = Arc::new(AppState::new(Arc::new(config), Arc::new(source)));

    tokio::spawn(async move {
        let _ = start_server(state, port).await;
    });

    // Wait for the server to be ready
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        if reqwest::get(format!("http://127.0.0.1:{port}/health"))
            .await
            .is_ok()
        {
            break;
        }
    }

    (port, data_dir)
}

async fn collect_events(port: u16, body: serde_json::Value) -> Vec<StreamEvent> {
    let response = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/api/chat"))
        .json(&body)
        .send()
        .await
        .expect("chat request failed");
    assert!(response.status().is_success());

    let mut stream = std::pin::pin!(response_events(response));
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        let event = event.expect("bad SSE frame");
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }
    events
}

#[tokio::test]
async fn test_health_endpoint() {
    let (port, _dir) = start_test_server(ScriptedSource::new()).await;

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/health"))
        .await
        .expect("health request failed");

    assert!(resp.status().is_success());
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
    assert!(body["tools"].is_array());
}

#[tokio::test]
async fn test_chat_stream_delivers_answer_in_order() {
    let source =
        ScriptedSource::with_fragments(vec!["AAPL is ".into(), "up 2%".into()])
            .with_plan(vec![]);
    let (port, _dir) = start_test_server(source).await;

    let events = collect_events(port, json!({ "message": "how is AAPL doing?" })).await;

    // New chat: chat_created first, done last.
    assert!(matches!(events.first(), Some(StreamEvent::ChatCreated { .. })));
    assert!(matches!(events.last(), Some(StreamEvent::Done)));

    let answer: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::TokenChunk { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(answer, "AAPL is up 2%");

    // First message of a new chat gets a title, before done.
    assert!(events
        .iter()
        .any(|e| matches!(e, StreamEvent::TitleGenerated { .. })));
}

#[tokio::test]
async fn test_tool_lifecycle_precedes_answer() {
    let (port, _dir) = start_test_server(ScriptedSource::new()).await;

    let events = collect_events(
        port,
        json!({ "message": "what's the price?", "current_symbol": "AAPL" }),
    )
    .await;

    let pos = |pred: fn(&StreamEvent) -> bool| events.iter().position(pred);
    let start = pos(|e| matches!(e, StreamEvent::ToolStart { .. })).expect("no tool_start");
    let end = pos(|e| matches!(e, StreamEvent::ToolEnd { .. })).expect("no tool_end");
    let token = pos(|e| matches!(e, StreamEvent::TokenChunk { .. })).expect("no tokens");
    let done = pos(|e| matches!(e, StreamEvent::Done)).expect("no done");

    assert!(start < end);
    assert!(end < token);
    assert!(token < done);
    assert_eq!(done, events.len() - 1);
}

#[tokio::test]
async fn test_chat_id_reuse_appends_to_same_conversation() {
    let source = ScriptedSource::with_fragments(vec!["ok".into()]).with_plan(vec![]);
    let (port, _dir) = start_test_server(source).await;

    let first = collect_events(port, json!({ "message": "first question" })).await;
    let chat_id = first
        .iter()
        .find_map(|e| match e {
            StreamEvent::ChatCreated { chat_id } => Some(chat_id.clone()),
            _ => None,
        })
        .expect("no chat_created");

    let second = collect_events(
        port,
        json!({ "message": "second question", "chat_id": chat_id }),
    )
    .await;

    // Continuing a conversation never re-announces its creation.
    assert!(!second
        .iter()
        .any(|e| matches!(e, StreamEvent::ChatCreated { .. })));
    assert!(matches!(second.last(), Some(StreamEvent::Done)));

    // Persistence happens after `done` is delivered; give it a moment.
    let mut exchanges = 0;
    for _ in 0..50 {
        let body: serde_json::Value =
            reqwest::get(format!("http://127.0.0.1:{port}/api/chats/{chat_id}"))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
        exchanges = body["exchanges"].as_array().map_or(0, |a| a.len());
        if exchanges == 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert_eq!(exchanges, 2);
}

#[tokio::test]
async fn test_empty_message_rejected() {
    let (port, _dir) = start_test_server(ScriptedSource::new()).await;

    let response = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/api/chat"))
        .json(&json!({ "message": "   " }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_chats_listed_after_exchange() {
    let source = ScriptedSource::with_fragments(vec!["done".into()]).with_plan(vec![]);
    let (port, _dir) = start_test_server(source).await;

    let events = collect_events(port, json!({ "message": "hello there" })).await;
    let chat_id = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::ChatCreated { chat_id } => Some(chat_id.clone()),
            _ => None,
        })
        .unwrap();

    // Persistence happens after `done` is delivered; give it a moment.
    let mut listed = false;
    for _ in 0..50 {
        let body: serde_json::Value = reqwest::get(format!("http://127.0.0.1:{port}/api/chats"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        listed = body["chats"]
            .as_array()
            .unwrap()
            .iter()
            .any(|c| c["chat_id"] == chat_id.as_str());
        if listed {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert!(listed);
}
