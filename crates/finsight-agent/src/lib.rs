//! The server-side streaming pipeline.
//!
//! Tool invocations run concurrently under the [`supervisor`], pushing
//! lifecycle events into the [`queue`]; the [`multiplexer`] drains the
//! queue onto a single ordered outbound channel, interleaving tool events
//! with answer tokens, and persists the exchange after the stream closes.
//! The answer itself comes from an opaque [`source::AnswerSource`].

pub mod multiplexer;
pub mod queue;
pub mod source;
pub mod supervisor;

pub use multiplexer::{run_stream, StreamParams};
pub use queue::{EventQueue, Pop};
pub use source::{AnswerSource, PlannedCall, ScriptedSource};
pub use supervisor::ToolSupervisor;
