//! Bounded FIFO event queue with an overflow circuit breaker.
//!
//! The queue is the only shared mutable structure between the tool tasks
//! (producers) and the multiplexer (sole consumer). `push` never blocks;
//! `pop` waits with a bounded timeout. When the buffer exceeds its bound
//! the breaker fires exactly once: the buffer is drained on the spot, a
//! single overflow `error` event is left for the consumer to deliver, and
//! every later `push` is rejected.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

use finsight_core::protocol::StreamEvent;
use finsight_core::{FinsightError, Result};

/// Result of a [`EventQueue::pop`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum Pop {
    Event(StreamEvent),
    /// Bounded wait elapsed with nothing to deliver.
    Timeout,
    /// Queue is closed (or tripped) and fully drained.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Active,
    /// Circuit breaker fired; only the overflow error event remains.
    Tripped,
    Closed,
}

struct Inner {
    buf: VecDeque<StreamEvent>,
    state: QueueState,
}

pub struct EventQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    max_size: usize,
}

impl EventQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: VecDeque::new(),
                state: QueueState::Active,
            }),
            notify: Notify::new(),
            max_size,
        }
    }

    /// Push an event. Never blocks. Fails once the queue is tripped or
    /// closed; producers treat that as "stream gone, discard".
    pub fn push(&self, event: StreamEvent) -> Result<()> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");

        match inner.state {
            QueueState::Active => {}
            QueueState::Tripped => {
                return Err(FinsightError::QueueOverflow(
                    "event queue circuit breaker is open".into(),
                ))
            }
            QueueState::Closed => return Err(FinsightError::QueueClosed),
        }

        inner.buf.push_back(event);

        if inner.buf.len() > self.max_size {
            // Breaker: drain everything, leave one terminal error for the
            // consumer, reject all further pushes.
            let dropped = inner.buf.len();
            inner.buf.clear();
            inner.buf.push_back(StreamEvent::Error {
                message: format!(
                    "Event queue overflow: {dropped} events exceeded the bound of {}; the stream was aborted",
                    self.max_size
                ),
            });
            inner.state = QueueState::Tripped;
            drop(inner);

            warn!(dropped, max = self.max_size, "Event queue overflow, circuit breaker fired");
            self.notify.notify_one();
            return Err(FinsightError::QueueOverflow(format!(
                "queue exceeded bound of {}",
                self.max_size
            )));
        }

        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the next event, waiting at most `timeout`.
    pub async fn pop(&self, timeout: Duration) -> Pop {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                if let Some(event) = inner.buf.pop_front() {
                    return Pop::Event(event);
                }
                if inner.state != QueueState::Active {
                    return Pop::Closed;
                }
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return Pop::Timeout,
            }
        }
    }

    /// Close the queue: no further pushes are accepted, already-buffered
    /// events stay poppable. Used when the client disconnects.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.state == QueueState::Active {
            inner.state = QueueState::Closed;
            debug!("Event queue closed");
        }
        drop(inner);
        self.notify.notify_one();
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("queue lock poisoned").buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").buf.len()
    }

    /// Whether the queue still accepts pushes.
    pub fn is_active(&self) -> bool {
        self.inner.lock().expect("queue lock poisoned").state == QueueState::Active
    }
}
