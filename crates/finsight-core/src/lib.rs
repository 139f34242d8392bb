//! Shared types, configuration, errors, and the wire protocol for Finsight.
//!
//! Everything the streaming pipeline's two halves (server and client) must
//! agree on lives here: the [`protocol::StreamEvent`] union, the transcript
//! model in [`types`], and the tuning configuration in [`config`].

pub mod config;
pub mod error;
pub mod protocol;
pub mod store;
pub mod types;

pub use error::{FinsightError, Result};
