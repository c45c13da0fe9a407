//! "Typing…" activity signals.
//!
//! [`TypingIndicator`] sends one `messages.setActivity` per handled message
//! through the executor when enabled. Each signal is sent once and never
//! refreshed.

use std::sync::atomic::{AtomicBool, Ordering};

use vkpoll_proto::MethodCall;

use crate::executor::RateLimitedExecutor;

const SET_ACTIVITY: &str = "messages.setActivity";

fn activity_call(peer_id: i64) -> MethodCall {
    MethodCall::new(SET_ACTIVITY)
        .with("peer_id", peer_id)
        .with("type", "typing")
}

// ─── TypingIndicator ─────────────────────────────────────────────────────────

/// Per-client switch for the automatic typing signal.
pub struct TypingIndicator {
    enabled:  AtomicBool,
    executor: RateLimitedExecutor,
}

impl TypingIndicator {
    pub fn new(executor: RateLimitedExecutor, enabled: bool) -> Self {
        Self { enabled: AtomicBool::new(enabled), executor }
    }

    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Queue one typing signal to `peer_id` if enabled. Fire-and-forget.
    pub fn signal(&self, peer_id: i64) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.executor.submit_call(activity_call(peer_id), move |r| {
            if let Err(e) = r {
                tracing::debug!("[vkpoll] typing signal to {peer_id} failed: {e}");
            }
        });
        true
    }
}
