//! The long-poll loop.
//!
//! [`PollLoop`] owns the current [`Session`] and is the only thing that
//! changes it. Each iteration issues one `a_check` request and either
//! queues the returned updates, or hands a `failed` response to the
//! [`SessionManager`] for recovery.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use vkpoll_proto::PollResponse;

use crate::dispatcher::HandlerRegistry;
use crate::errors::{InvocationError, PollFailure};
use crate::queue::UpdateQueue;
use crate::retry::{RetryPolicy, RetryState};
use crate::session::{Session, SessionManager};
use crate::transport::Transport;

/// Per-request knobs for [`PollLoop`].
#[derive(Clone, Debug)]
pub struct PollSettings {
    /// `msgs_limit` hint sent with every poll.
    pub msgs_limit:     u32,
    /// Added to the session's `wait` to get the HTTP timeout.
    pub timeout_margin: Duration,
    /// Log every poll body at INFO instead of TRACE. Switchable at runtime.
    pub log_updates:    Arc<AtomicBool>,
}

/// Result of one successful poll round trip.
#[derive(Clone, Debug, PartialEq)]
pub enum PollOutcome {
    /// This many updates were put on the queue.
    Queued(usize),
    /// Nothing is registered; this many updates were dropped.
    Discarded(usize),
    /// The server answered with `failed`; the session must be recovered.
    Failed(PollFailure),
}

pub struct PollLoop {
    session:   Session,
    manager:   SessionManager,
    transport: Arc<dyn Transport>,
    queue:     Arc<UpdateQueue>,
    registry:  Arc<HandlerRegistry>,
    settings:  PollSettings,
    retry:     Arc<dyn RetryPolicy>,
}

impl PollLoop {
    pub fn new(
        session:   Session,
        manager:   SessionManager,
        transport: Arc<dyn Transport>,
        queue:     Arc<UpdateQueue>,
        registry:  Arc<HandlerRegistry>,
        settings:  PollSettings,
        retry:     Arc<dyn RetryPolicy>,
    ) -> Self {
        Self { session, manager, transport, queue, registry, settings, retry }
    }

    /// The session the next poll will use.
    pub fn session(&self) -> &Session { &self.session }

    fn poll_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.session.wait)) + self.settings.timeout_margin
    }

    /// Issue one poll request.
    ///
    /// A transport error or an unreadable body is returned as `Err` and
    /// leaves the session untouched.
    pub async fn poll_once(&mut self) -> Result<PollOutcome, InvocationError> {
        let body = self.transport
            .get(
                &self.session.poll_url(),
                &self.session.poll_query(self.settings.msgs_limit),
                self.poll_timeout(),
            )
            .await?;

        if self.settings.log_updates.load(Ordering::Relaxed) {
            tracing::info!("[vkpoll] poll response: {body}");
        } else {
            tracing::trace!("[vkpoll] poll response: {body}");
        }

        let updates = match PollResponse::from_body(&body)? {
            PollResponse::Updates(u) => u,
            PollResponse::Failed(f) => return Ok(PollOutcome::Failed(PollFailure::from(&f))),
        };

        self.session.advance(updates.ts, updates.pts);
        let n = updates.updates.len();
        if self.registry.is_empty() {
            if n > 0 {
                tracing::debug!("[vkpoll] no handlers registered, dropping {n} update(s)");
            }
            return Ok(PollOutcome::Discarded(n));
        }
        self.queue.put_all(updates.updates);
        Ok(PollOutcome::Queued(n))
    }

    /// Replace the session after `failure`, retrying per policy.
    ///
    /// Returns `Ok(false)` if cancelled while waiting to retry.
    pub async fn recover(
        &mut self,
        failure: &PollFailure,
        cancel:  &CancellationToken,
    ) -> Result<bool, InvocationError> {
        let mut retry = RetryState::default();
        loop {
            match self.manager.recover(&self.session, failure).await {
                Ok(session) => {
                    self.session = session;
                    return Ok(true);
                }
                Err(e) => {
                    let err = e.cause().clone();
                    tracing::warn!("[vkpoll] session recovery failed: {e}");
                    match retry.next(self.retry.as_ref(), err.clone()) {
                        ControlFlow::Continue(delay) => {
                            if !sleep_unless_cancelled(delay, cancel).await {
                                return Ok(false);
                            }
                        }
                        ControlFlow::Break(()) => return Err(err),
                    }
                }
            }
        }
    }

    /// Poll until `cancel` fires.
    ///
    /// Cancellation is checked before each request; a poll already in
    /// flight completes first. Returns `Err` only if the retry policy gives
    /// up.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), InvocationError> {
        tracing::info!("[vkpoll] poll loop started (server={}, ts={})", self.session.server, self.session.ts);
        let mut retry = RetryState::default();

        while !cancel.is_cancelled() {
            match self.poll_once().await {
                Ok(PollOutcome::Failed(failure)) => {
                    tracing::debug!("[vkpoll] poll failed: {failure}");
                    if !self.recover(&failure, &cancel).await? {
                        break;
                    }
                    retry.reset();
                }
                Ok(_) => retry.reset(),
                Err(e) => {
                    tracing::warn!("[vkpoll] poll request failed: {e}");
                    match retry.next(self.retry.as_ref(), e.clone()) {
                        ControlFlow::Continue(delay) => {
                            if !sleep_unless_cancelled(delay, &cancel).await {
                                break;
                            }
                        }
                        ControlFlow::Break(()) => {
                            tracing::error!("[vkpoll] poll loop giving up: {e}");
                            return Err(e);
                        }
                    }
                }
            }
        }

        tracing::info!("[vkpoll] poll loop stopped at ts={}", self.session.ts);
        Ok(())
    }
}

/// `false` if `cancel` fired first.
async fn sleep_unless_cancelled(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
