//! Duplicate-submission guard.
//!
//! A synchronous boolean gate checked before any network call. The flag is
//! an explicit atomic, never a freshly-constructed value used as a change
//! trigger; re-derived object identity is exactly the bug class this
//! exists to prevent. A duplicate submit is a logged no-op, the one
//! deliberate exception to "always surface errors". The same gate also
//! covers overlapping conversation-restore requests from rapid navigation.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

#[derive(Debug, Default)]
pub struct SubmitGuard {
    pending: AtomicBool,
}

/// Holding this marks the request in flight; dropping it releases the gate.
#[derive(Debug)]
pub struct SubmitPermit<'a> {
    guard: &'a SubmitGuard,
}

impl SubmitGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the gate, or `None` if a request is already in flight.
    pub fn try_acquire(&self, action: &str) -> Option<SubmitPermit<'_>> {
        if self
            .pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Some(SubmitPermit { guard: self })
        } else {
            debug!(action, "Duplicate request ignored, prior one still pending");
            None
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }
}

impl Drop for SubmitPermit<'_> {
    fn drop(&mut self) {
        self.guard.pending.store(false, Ordering::SeqCst);
    }
}
