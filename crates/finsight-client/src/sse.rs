//! SSE line parser: converts a response byte stream into `StreamEvent`s.
//!
//! Comment lines (`: keep-alive`) and unknown fields are skipped; each
//! dispatched `data:` payload is decoded as one [`StreamEvent`].

use std::pin::Pin;

use futures::Stream;
use tokio_stream::StreamExt;

use finsight_core::protocol::StreamEvent;

struct ParseState<E> {
    byte_stream: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, E>> + Send>>,
    buffer: String,
    // Trailing bytes of an incomplete UTF-8 sequence, waiting for the
    // rest of the codepoint to arrive in the next chunk.
    partial_utf8: Vec<u8>,
    current_data: Vec<String>,
}

/// Append `chunk` to `buffer`, decoding only the longest valid UTF-8
/// prefix. Bytes of a codepoint cut off at the chunk boundary stay in
/// `partial` until the next chunk completes them.
fn push_utf8(buffer: &mut String, partial: &mut Vec<u8>, chunk: &[u8]) {
    partial.extend_from_slice(chunk);
    match std::str::from_utf8(partial) {
        Ok(valid) => {
            buffer.push_str(valid);
            partial.clear();
        }
        Err(e) => {
            let valid_up_to = e.valid_up_to();
            buffer.push_str(std::str::from_utf8(&partial[..valid_up_to]).unwrap_or(""));
            partial.drain(..valid_up_to);
        }
    }
}

/// Parse a byte stream as SSE, yielding one event per dispatched frame.
pub fn event_stream<S, E>(bytes: S) -> impl Stream<Item = anyhow::Result<StreamEvent>>
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: std::fmt::Display,
{
    futures::stream::unfold(
        ParseState {
            byte_stream: Box::pin(bytes),
            buffer: String::new(),
            partial_utf8: Vec::new(),
            current_data: Vec::new(),
        },
        |mut state| async move {
            loop {
                // Extract complete lines from the buffer first.
                if let Some(newline_pos) = state.buffer.find('\n') {
                    let line = state.buffer[..newline_pos].trim_end_matches('\r').to_string();
                    state.buffer = state.buffer[newline_pos + 1..].to_string();

                    if line.is_empty() {
                        // Empty line = dispatch frame
                        if !state.current_data.is_empty() {
                            let data = state.current_data.join("\n");
                            state.current_data.clear();
                            let event = StreamEvent::from_sse_data(&data)
                                .map_err(|e| anyhow::anyhow!("bad stream event: {e}"));
                            return Some((event, state));
                        }
                        continue;
                    }

                    if line.starts_with(':') {
                        // Comment / keep-alive, skip
                        continue;
                    }

                    if let Some(value) = line.strip_prefix("data:") {
                        state.current_data.push(value.trim_start().to_string());
                    }
                    // Ignore event:/id:/retry:, this protocol only uses data
                    continue;
                }

                match state.byte_stream.next().await {
                    Some(Ok(chunk)) => {
                        let ParseState { buffer, partial_utf8, .. } = &mut state;
                        push_utf8(buffer, partial_utf8, &chunk);
                    }
                    Some(Err(e)) => {
                        return Some((Err(anyhow::anyhow!("SSE stream error: {e}")), state));
                    }
                    None => {
                        // Stream ended. Dispatch any trailing frame.
                        if !state.current_data.is_empty() {
                            let data = state.current_data.join("\n");
                            state.current_data.clear();
                            let event = StreamEvent::from_sse_data(&data)
                                .map_err(|e| anyhow::anyhow!("bad stream event: {e}"));
                            return Some((event, state));
                        }
                        return None;
                    }
                }
            }
        },
    )
}

/// Parse the body of a `reqwest` response as a stream of events.
pub fn response_events(
    response: reqwest::Response,
) -> impl Stream<Item = anyhow::Result<StreamEvent>> {
    event_stream(response.bytes_stream())
}
