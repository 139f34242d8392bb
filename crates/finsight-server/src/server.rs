//! Axum routes: the SSE chat endpoint and the conversation read surface.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use finsight_agent::multiplexer::run_stream;
use finsight_core::protocol::{ChatRequest, StreamEvent};

use crate::state::AppState;

/// Outbound channel depth between the multiplexer and the HTTP response.
/// Transport backpressure propagates through this to the drain loop.
const OUTBOUND_BUFFER: usize = 32;

/// Start the HTTP server.
pub async fn start_server(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    let bind_addr = state.config.bind_addr();

    let app = router(state);

    let addr = format!("{bind_addr}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Finsight server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/api/chats", get(chats_list_handler))
        .route("/api/chats/{chat_id}", get(chat_get_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `POST /api/chat`: open a stream for one exchange.
///
/// Non-2xx responses always carry a human-readable `error` message; the
/// stream itself reports failure via a terminal `error` event instead.
async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<serde_json::Value>)>
{
    if request.message.trim().is_empty() {
        return Err(bad_request("Message must not be empty"));
    }
    let max_len = state.config.max_message_len();
    if request.message.chars().count() > max_len {
        return Err(bad_request(&format!(
            "Message exceeds the {max_len}-character limit"
        )));
    }

    let (tx, rx) = mpsc::channel::<StreamEvent>(OUTBOUND_BUFFER);
    tokio::spawn(run_stream(state.stream_params(), request, tx));

    let stream = ReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|e| {
            warn!(%e, "Failed to serialize stream event");
            json!({"type": "error", "message": "event serialization failed"}).to_string()
        });
        Ok(Event::default().data(data))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn chats_list_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.list().await {
        Ok(chats) => (StatusCode::OK, Json(json!({ "chats": chats }))),
        Err(e) => {
            warn!(%e, "Failed to list chats");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

async fn chat_get_handler(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<String>,
) -> impl IntoResponse {
    match state.store.get(&chat_id).await {
        Ok(Some(exchanges)) => (
            StatusCode::OK,
            Json(json!({ "chat_id": chat_id, "exchanges": exchanges })),
        ),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Unknown chat: {chat_id}") })),
        ),
        Err(e) => {
            warn!(%e, %chat_id, "Failed to load chat");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");
    Json(json!({
        "status": "ok",
        "version": version,
        "tools": state.tools.list(),
    }))
}

fn bad_request(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message })),
    )
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(%e, "Failed to install CTRL+C handler");
        return;
    }
    info!("Shutdown signal received");
}
