//! Axum HTTP server for Finsight.
//!
//! `POST /api/chat` opens an SSE response whose frames are the
//! [`finsight_core::protocol::StreamEvent`] union; the read surface
//! (`/api/chats`) backs the client's conversation list and restore flow.

pub mod server;
pub mod state;

pub use server::start_server;
pub use state::AppState;
