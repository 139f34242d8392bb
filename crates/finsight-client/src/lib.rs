//! Client side of the Finsight streaming pipeline.
//!
//! Consumes the SSE transport, applies each event to an append-only
//! transcript through the [`reducer::StreamReducer`], and gates duplicate
//! submissions with the [`guard::SubmitGuard`].

pub mod client;
pub mod guard;
pub mod reducer;
pub mod sse;

pub use client::{ChatClient, SubmitOutcome};
pub use guard::SubmitGuard;
pub use reducer::StreamReducer;
