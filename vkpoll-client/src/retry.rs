//! Retry policies for the poll loop and the startup handshake.

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::time::Duration;

use crate::errors::InvocationError;

/// Controls how long to wait before retrying after a failed poll or
/// handshake, or whether to give up.
pub trait RetryPolicy: Send + Sync + 'static {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration>;
}

/// Context passed to [`RetryPolicy::should_retry`] on each failure.
pub struct RetryContext {
    /// Consecutive failures so far, this one included.
    pub fail_count:   NonZeroU32,
    pub slept_so_far: Duration,
    pub error:        InvocationError,
}

/// Never retry.
pub struct NoRetries;
impl RetryPolicy for NoRetries {
    fn should_retry(&self, _: &RetryContext) -> ControlFlow<(), Duration> {
        ControlFlow::Break(())
    }
}

/// Sleep a fixed delay between attempts, optionally up to `max_attempts`.
pub struct FixedDelay {
    pub delay:        Duration,
    /// `None` retries forever.
    pub max_attempts: Option<NonZeroU32>,
}

impl Default for FixedDelay {
    fn default() -> Self {
        Self { delay: Duration::from_secs(1), max_attempts: None }
    }
}

impl RetryPolicy for FixedDelay {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration> {
        if let Some(max) = self.max_attempts {
            if ctx.fail_count > max {
                tracing::warn!("[vkpoll] giving up after {} attempts: {}", max, ctx.error);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(self.delay)
    }
}

/// Drives a [`RetryPolicy`] across consecutive failures; reset on success.
#[derive(Default)]
pub(crate) struct RetryState {
    fails: u32,
    slept: Duration,
}

impl RetryState {
    /// Record a failure and ask `policy` what to do next.
    pub(crate) fn next(
        &mut self,
        policy: &dyn RetryPolicy,
        error:  InvocationError,
    ) -> ControlFlow<(), Duration> {
        self.fails = self.fails.saturating_add(1);
        let ctx = RetryContext {
            fail_count:   NonZeroU32::new(self.fails).unwrap_or(NonZeroU32::MIN),
            slept_so_far: self.slept,
            error,
        };
        let decision = policy.should_retry(&ctx);
        if let ControlFlow::Continue(d) = decision {
            self.slept += d;
        }
        decision
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}
