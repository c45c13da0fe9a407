//! # vkpoll-client
//!
//! Async VK long-poll client.
//!
//! ## Features
//! - Long-poll session handshake and automatic recovery (expired history,
//!   invalidated key, protocol version mismatch)
//! - Typed update classification: new messages, typing, chat membership,
//!   title and photo changes
//! - Handler registry with command matching and an attachment-type waterfall
//! - Batched `execute` calls, at most 25 per request and 3 requests per second
//! - Optional "typing…" signal for every handled message
//! - Configurable retry policy for network failures
//!
//! ## Example
//! ```rust,no_run
//! use vkpoll_client::{Client, Config, MessageKind};
//! use vkpoll_client::vkpoll_proto::Params;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::connect(Config {
//!     access_token: "token".into(),
//!     ..Default::default()
//! }).await?;
//!
//! let replies = client.clone();
//! client.handlers().on_command(["/ping"], move |msg| {
//!     let mut params = Params::new();
//!     params.insert("peer_id".into(), msg.reply_peer().into());
//!     params.insert("message".into(), "pong".into());
//!     params.insert("random_id".into(), 0.into());
//!     replies.call_async("messages.send", params, |_| {});
//! });
//! client.handlers().on_message(MessageKind::Photo, |msg| {
//!     println!("photo from {}", msg.author_id);
//! });
//!
//! client.start_polling();
//! tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
//! client.stop().await;
//! # Ok(()) }
//! ```

#![deny(unsafe_code)]

mod dispatcher;
mod errors;
mod executor;
mod poll;
mod queue;
mod retry;
mod session;
mod transport;
pub mod typing;
pub mod update;

pub use vkpoll_proto;

pub use dispatcher::{HandlerRegistry, MessageHandlerKind, UpdateDispatcher};
pub use errors::{InvocationError, PollFailure, RpcError, SessionError, TransportError};
pub use executor::{BatchResult, CallResult, ExecutorSettings, RateLimitedExecutor};
pub use poll::{PollLoop, PollOutcome, PollSettings};
pub use queue::UpdateQueue;
pub use retry::{FixedDelay, NoRetries, RetryContext, RetryPolicy};
pub use session::{LongPollSettings, Session, SessionManager};
pub use transport::{ApiEndpoint, HttpTransport, Transport};
pub use typing::TypingIndicator;
pub use update::{IncomingMessage, MessageKind, Update};

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vkpoll_proto::Params;

use retry::RetryState;

// ─── Config ───────────────────────────────────────────────────────────────────

/// Configuration for [`Client::connect`].
#[derive(Clone)]
pub struct Config {
    /// User or community access token.
    pub access_token:        String,
    pub api_version:         String,
    /// Method endpoint, without trailing slash.
    pub api_base_url:        String,
    /// Added to every method call unless the call sets the same key
    /// (e.g. `lang`).
    pub default_params:      Params,
    /// Seconds the poll server may hold a request open.
    pub wait:                u32,
    /// Long-poll mode bitmask; see [`vkpoll_proto::mode`].
    pub mode:                i32,
    /// Long-poll protocol version.
    pub lp_version:          i32,
    /// Request the persisted-event cursor (`pts`) at handshake.
    pub need_pts:            bool,
    /// `msgs_limit` hint sent with each poll.
    pub msgs_limit:          u32,
    /// Poll HTTP timeout is `wait` plus this margin.
    pub poll_timeout_margin: Duration,
    /// Timeout for method calls.
    pub request_timeout:     Duration,
    /// `execute` requests per second.
    pub execute_per_second:  u32,
    /// Calls per `execute` request.
    pub batch_size:          usize,
    /// Tasks draining the update queue.
    pub dispatch_workers:    usize,
    /// Applied to poll failures and failed (re)negotiation.
    pub retry_policy:        Arc<dyn RetryPolicy>,
    /// Log every poll response at INFO.
    pub log_updates:         bool,
    /// Signal "typing…" after each handled message.
    pub typing_indicator:    bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            access_token:        String::new(),
            api_version:         vkpoll_proto::API_VERSION.to_owned(),
            api_base_url:        vkpoll_proto::API_BASE_URL.to_owned(),
            default_params:      Params::new(),
            wait:                25,
            mode:                vkpoll_proto::mode::DEFAULT,
            lp_version:          vkpoll_proto::LONG_POLL_VERSION,
            need_pts:            true,
            msgs_limit:          100_000,
            poll_timeout_margin: Duration::from_secs(10),
            request_timeout:     Duration::from_secs(30),
            execute_per_second:  vkpoll_proto::MAX_EXECUTE_PER_SECOND,
            batch_size:          vkpoll_proto::MAX_BATCH_CALLS,
            dispatch_workers:    4,
            retry_policy:        Arc::new(FixedDelay::default()),
            log_updates:         false,
            typing_indicator:    false,
        }
    }
}

// ─── Client ───────────────────────────────────────────────────────────────────

struct ClientInner {
    transport:        Arc<dyn Transport>,
    endpoint:         ApiEndpoint,
    manager:          SessionManager,
    executor:         RateLimitedExecutor,
    registry:         Arc<HandlerRegistry>,
    queue:            Arc<UpdateQueue>,
    typing:           Arc<TypingIndicator>,
    poll_settings:    PollSettings,
    retry_policy:     Arc<dyn RetryPolicy>,
    dispatch_workers: usize,
    /// Negotiated at connect; taken by [`Client::start_polling`].
    session:          Mutex<Option<Session>>,
    cancel:           CancellationToken,
    tasks:            Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    // Last clone gone without `stop()`: end the poll loop and the executor
    // timer instead of leaving them on the runtime.
    fn drop(&mut self) {
        self.cancel.cancel();
        self.executor.stop();
    }
}

/// The long-poll client. Cheap to clone; internally Arc-wrapped.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    // ── Connect ────────────────────────────────────────────────────────────

    /// Negotiate a long-poll session over HTTPS and start the executor.
    ///
    /// Network failures are retried per [`Config::retry_policy`]; an API
    /// error (such as an invalid token) fails immediately.
    pub async fn connect(config: Config) -> Result<Self, SessionError> {
        let transport = HttpTransport::new(config.request_timeout).map_err(InvocationError::from)?;
        Self::with_transport(config, Arc::new(transport)).await
    }

    /// [`Client::connect`] over a caller-supplied transport.
    pub async fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Self, SessionError> {
        let endpoint = ApiEndpoint {
            access_token:   config.access_token,
            api_version:    config.api_version,
            base_url:       config.api_base_url,
            default_params: config.default_params,
        };
        let manager = SessionManager::new(transport.clone(), endpoint.clone(), LongPollSettings {
            wait:     config.wait,
            mode:     config.mode,
            version:  config.lp_version,
            need_pts: config.need_pts,
        });

        let session = first_session(&manager, config.lp_version, config.retry_policy.as_ref()).await?;

        let executor = RateLimitedExecutor::start(transport.clone(), endpoint.clone(), ExecutorSettings {
            per_second: config.execute_per_second,
            batch_size: config.batch_size,
        });
        let typing = Arc::new(TypingIndicator::new(executor.clone(), config.typing_indicator));

        let inner = Arc::new(ClientInner {
            transport,
            endpoint,
            manager,
            executor,
            registry:         Arc::new(HandlerRegistry::new()),
            queue:            Arc::new(UpdateQueue::new()),
            typing,
            poll_settings:    PollSettings {
                msgs_limit:     config.msgs_limit,
                timeout_margin: config.poll_timeout_margin,
                log_updates:    Arc::new(AtomicBool::new(config.log_updates)),
            },
            retry_policy:     config.retry_policy,
            dispatch_workers: config.dispatch_workers,
            session:          Mutex::new(Some(session)),
            cancel:           CancellationToken::new(),
            tasks:            Mutex::new(Vec::new()),
        });
        Ok(Self { inner })
    }

    // ── Polling ────────────────────────────────────────────────────────────

    /// Spawn the poll loop and the dispatch workers.
    ///
    /// Returns `false` if polling was already started (or the client was
    /// stopped); a client polls at most once.
    pub fn start_polling(&self) -> bool {
        let Some(session) = lock(&self.inner.session).take() else {
            tracing::warn!("[vkpoll] start_polling called twice");
            return false;
        };
        let inner = &self.inner;

        let dispatcher = Arc::new(UpdateDispatcher::new(inner.registry.clone(), Some(inner.typing.clone())));
        let mut tasks = dispatcher.spawn_workers(inner.queue.clone(), inner.dispatch_workers);

        let poll = PollLoop::new(
            session,
            inner.manager.clone(),
            inner.transport.clone(),
            inner.queue.clone(),
            inner.registry.clone(),
            inner.poll_settings.clone(),
            inner.retry_policy.clone(),
        );
        let queue  = inner.queue.clone();
        let cancel = inner.cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = poll.run(cancel).await {
                tracing::error!("[vkpoll] poll loop ended: {e}");
            }
            queue.close();
        }));

        lock(&inner.tasks).extend(tasks);
        true
    }

    /// Stop polling, let the workers drain the queue, then flush the
    /// executor. A poll already in flight is allowed to complete.
    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.cancel.cancel();
        if lock(&inner.session).take().is_some() {
            // Polling never started.
            inner.queue.close();
        }
        let tasks: Vec<_> = lock(&inner.tasks).drain(..).collect();
        for t in tasks {
            if let Err(e) = t.await {
                tracing::error!("[vkpoll] background task failed: {e}");
            }
        }
        inner.executor.shutdown().await;
        tracing::info!("[vkpoll] client stopped");
    }

    // ── Handlers & switches ────────────────────────────────────────────────

    /// Where handlers are registered. Safe to use while polling.
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    /// Turn the automatic typing signal on or off.
    pub fn enable_typing(&self, on: bool) {
        self.inner.typing.set_enabled(on);
    }

    /// Log each poll response at INFO (`true`) or TRACE (`false`).
    pub fn log_updates(&self, on: bool) {
        self.inner.poll_settings.log_updates.store(on, Ordering::Relaxed);
    }

    // ── Calls ──────────────────────────────────────────────────────────────

    /// Batched call; resolves when its `execute` request returns.
    pub async fn call(&self, method: impl Into<String>, params: Params) -> CallResult {
        self.inner.executor.call(method, params).await
    }

    /// Batched call with a continuation. Never blocks.
    pub fn call_async<F>(&self, method: impl Into<String>, params: Params, done: F)
    where
        F: FnOnce(CallResult) + Send + 'static,
    {
        self.inner.executor.submit(method, params, done);
    }

    /// One immediate request, bypassing the batch queue and its rate limit.
    pub async fn call_direct(&self, method: &str, params: &Params) -> Result<Value, InvocationError> {
        self.inner.endpoint.invoke(self.inner.transport.as_ref(), method, params).await
    }

    pub fn executor(&self) -> &RateLimitedExecutor {
        &self.inner.executor
    }
}

/// Initial handshake: transient failures are retried, API errors are not.
async fn first_session(
    manager: &SessionManager,
    version: i32,
    policy:  &dyn RetryPolicy,
) -> Result<Session, SessionError> {
    let mut retry = RetryState::default();
    loop {
        let err = match manager.negotiate(version).await {
            Ok(session) => return Ok(session),
            Err(e) => e,
        };
        if !err.cause().is_transient() {
            tracing::error!("[vkpoll] {err}");
            return Err(err);
        }
        match retry.next(policy, err.cause().clone()) {
            ControlFlow::Continue(delay) => {
                tracing::warn!("[vkpoll] {err}; retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            ControlFlow::Break(()) => return Err(err),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}
