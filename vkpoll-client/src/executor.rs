//! Batched, rate-limited method calls through `execute`.
//!
//! Calls are queued by [`RateLimitedExecutor::submit`] and flushed by a
//! background timer: every tick drains up to `batch_size` of the oldest
//! calls, sends them as one `execute` request and hands result *i* to the
//! continuation of call *i*.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use vkpoll_proto::{ApiEnvelope, MethodCall, Params, serialize::execute_code};

use crate::errors::{InvocationError, RpcError};
use crate::transport::{ApiEndpoint, Transport};

/// What a continuation receives.
pub type CallResult = Result<Value, InvocationError>;

type Continuation = Box<dyn FnOnce(CallResult) + Send + 'static>;

struct PendingCall {
    call: MethodCall,
    done: Continuation,
}

/// One delivered result, as published on [`RateLimitedExecutor::subscribe`].
#[derive(Clone, Debug)]
pub struct BatchResult {
    pub method: String,
    pub params: Params,
    pub result: CallResult,
}

/// Cadence and batch size for [`RateLimitedExecutor`].
#[derive(Clone, Debug)]
pub struct ExecutorSettings {
    /// Physical `execute` requests per second, at most.
    pub per_second: u32,
    /// Calls per request, at most.
    pub batch_size: usize,
}

impl ExecutorSettings {
    fn period(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.per_second.max(1)))
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            per_second: vkpoll_proto::MAX_EXECUTE_PER_SECOND,
            batch_size: vkpoll_proto::MAX_BATCH_CALLS,
        }
    }
}

// ─── Shared state ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct CallQueue {
    pending: VecDeque<PendingCall>,
    closed:  bool,
}

struct Shared {
    queue:      Mutex<CallQueue>,
    transport:  Arc<dyn Transport>,
    endpoint:   ApiEndpoint,
    settings:   ExecutorSettings,
    results:    broadcast::Sender<BatchResult>,
    cancel:     CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, CallQueue> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn take_batch(&self) -> Vec<PendingCall> {
        let mut q = self.lock();
        let n = q.pending.len().min(self.settings.batch_size.max(1));
        q.pending.drain(..n).collect()
    }

    /// Send one batch. Returns the number of calls it carried.
    async fn flush(&self) -> usize {
        let batch = self.take_batch();
        if batch.is_empty() {
            return 0;
        }
        let n = batch.len();
        let (calls, conts): (Vec<MethodCall>, Vec<Continuation>) =
            batch.into_iter().map(|p| (p.call, p.done)).unzip();

        tracing::debug!("[vkpoll] flushing {n} call(s) via execute");
        let results = match self.endpoint.execute(self.transport.as_ref(), execute_code(&calls)).await {
            Ok(env) => split_results(env, &calls),
            Err(e) => {
                tracing::warn!("[vkpoll] execute batch of {n} failed: {e}");
                vec![Err(e); n]
            }
        };

        for ((call, done), result) in calls.into_iter().zip(conts).zip(results) {
            if self.results.receiver_count() > 0 {
                let _ = self.results.send(BatchResult {
                    method: call.method.clone(),
                    params: call.params.clone(),
                    result: result.clone(),
                });
            }
            if catch_unwind(AssertUnwindSafe(|| done(result))).is_err() {
                tracing::error!("[vkpoll] continuation for {} panicked", call.method);
            }
        }
        n
    }
}

/// Map the envelope of one `execute` request back onto its calls.
///
/// `execute_errors` entries are paired, in order, with calls of the same
/// method whose result element is `false` or `null`.
fn split_results(env: ApiEnvelope, calls: &[MethodCall]) -> Vec<CallResult> {
    for e in &env.execute_errors {
        tracing::warn!("[vkpoll] execute error in {}: {} {}", e.method, e.error_code, e.error_msg);
    }

    let list = match env.response {
        Some(Value::Array(list)) => list,
        other => {
            let why = match other {
                None => "execute: no `response` field".to_owned(),
                Some(v) => format!("execute: expected a result list, got {v}"),
            };
            return vec![Err(InvocationError::MalformedResponse(why)); calls.len()];
        }
    };
    if list.len() != calls.len() {
        tracing::warn!("[vkpoll] execute returned {} results for {} calls", list.len(), calls.len());
    }

    let mut results: Vec<CallResult> = (0..calls.len())
        .map(|i| match list.get(i) {
            Some(v) => Ok(v.clone()),
            None => Err(InvocationError::MalformedResponse("execute: result list too short".into())),
        })
        .collect();

    for err in env.execute_errors {
        let slot = calls.iter().zip(&results).position(|(call, r)| {
            call.method == err.method && matches!(r, Ok(Value::Bool(false) | Value::Null))
        });
        match slot {
            Some(i) => results[i] = Err(InvocationError::BatchExecution(RpcError::from(err))),
            None => tracing::debug!("[vkpoll] execute error for {} matched no call", err.method),
        }
    }
    results
}

// ─── RateLimitedExecutor ──────────────────────────────────────────────────────

/// Queue of pending method calls plus the timer task that flushes it.
///
/// Cheap to clone; all clones share the queue.
#[derive(Clone)]
pub struct RateLimitedExecutor {
    shared: Arc<Shared>,
    task:   Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RateLimitedExecutor {
    /// Create the executor and spawn its timer on the current tokio runtime.
    pub fn start(
        transport: Arc<dyn Transport>,
        endpoint:  ApiEndpoint,
        settings:  ExecutorSettings,
    ) -> Self {
        let (results, _) = broadcast::channel(256);
        let shared = Arc::new(Shared {
            queue: Mutex::new(CallQueue::default()),
            transport,
            endpoint,
            settings,
            results,
            cancel: CancellationToken::new(),
        });
        let task = tokio::spawn(run_timer(shared.clone()));
        Self { shared, task: Arc::new(Mutex::new(Some(task))) }
    }

    /// Queue `method(params)`; `done` is invoked exactly once with its result.
    ///
    /// Never blocks. After [`RateLimitedExecutor::stop`], `done` receives
    /// [`InvocationError::Stopped`] immediately.
    pub fn submit<F>(&self, method: impl Into<String>, params: Params, done: F)
    where
        F: FnOnce(CallResult) + Send + 'static,
    {
        self.submit_call(MethodCall::with_params(method, params), done);
    }

    /// [`RateLimitedExecutor::submit`] taking a prepared [`MethodCall`].
    pub fn submit_call<F>(&self, call: MethodCall, done: F)
    where
        F: FnOnce(CallResult) + Send + 'static,
    {
        let mut q = self.shared.lock();
        if q.closed {
            drop(q);
            tracing::debug!("[vkpoll] {} submitted after stop", call.method);
            done(Err(InvocationError::Stopped));
            return;
        }
        q.pending.push_back(PendingCall { call, done: Box::new(done) });
    }

    /// Queue a call and wait for its result.
    pub async fn call(&self, method: impl Into<String>, params: Params) -> CallResult {
        let (tx, rx) = oneshot::channel();
        self.submit(method, params, move |r| {
            let _ = tx.send(r);
        });
        rx.await.unwrap_or(Err(InvocationError::Stopped))
    }

    /// Every delivered result, in delivery order.
    pub fn subscribe(&self) -> broadcast::Receiver<BatchResult> {
        self.shared.results.subscribe()
    }

    /// Calls waiting for a flush.
    pub fn pending(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Refuse new calls and ask the timer to flush what is left, then exit.
    pub fn stop(&self) {
        self.shared.lock().closed = true;
        self.shared.cancel.cancel();
    }

    /// [`RateLimitedExecutor::stop`], then wait for the final flush.
    pub async fn shutdown(&self) {
        self.stop();
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("[vkpoll] executor task ended abnormally: {e}");
            }
        }
    }
}

async fn run_timer(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.settings.period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => { shared.flush().await; }
        }
    }

    // The queue is closed now; drain it at the usual cadence.
    let left = shared.lock().pending.len();
    if left > 0 {
        tracing::info!("[vkpoll] executor stopping, flushing {left} queued call(s)");
    }
    while !shared.lock().pending.is_empty() {
        ticker.tick().await;
        shared.flush().await;
    }
    tracing::debug!("[vkpoll] executor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vkpoll_proto::ExecuteError;

    fn calls(methods: &[&str]) -> Vec<MethodCall> {
        methods.iter().map(|m| MethodCall::new(*m)).collect()
    }

    fn env(response: Option<Value>, errors: Vec<ExecuteError>) -> ApiEnvelope {
        ApiEnvelope { response, error: None, execute_errors: errors }
    }

    #[test]
    fn results_map_by_position() {
        let r = split_results(env(Some(json!([1, "two", {"x": 3}])), vec![]), &calls(&["a", "b", "c"]));
        assert_eq!(r, vec![Ok(json!(1)), Ok(json!("two")), Ok(json!({"x": 3}))]);
    }

    #[test]
    fn missing_list_fails_every_call() {
        let r = split_results(env(None, vec![]), &calls(&["a", "b"]));
        assert!(r.iter().all(|r| matches!(r, Err(InvocationError::MalformedResponse(_)))));
        let r = split_results(env(Some(json!({"not": "a list"})), vec![]), &calls(&["a"]));
        assert!(matches!(r[0], Err(InvocationError::MalformedResponse(_))));
    }

    #[test]
    fn short_list_fails_the_tail() {
        let r = split_results(env(Some(json!([1])), vec![]), &calls(&["a", "b"]));
        assert_eq!(r[0], Ok(json!(1)));
        assert!(matches!(r[1], Err(InvocationError::MalformedResponse(_))));
    }

    #[test]
    fn execute_errors_pair_with_failed_calls() {
        let err = ExecuteError {
            method:     "messages.send".into(),
            error_code: 7,
            error_msg:  "Permission denied".into(),
        };
        let r = split_results(
            env(Some(json!([10, false, 11])), vec![err]),
            &calls(&["messages.send", "messages.send", "users.get"]),
        );
        assert_eq!(r[0], Ok(json!(10)));
        match &r[1] {
            Err(InvocationError::BatchExecution(e)) => {
                assert_eq!(e.code, 7);
                assert_eq!(e.method.as_deref(), Some("messages.send"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(r[2], Ok(json!(11)));
    }

    #[test]
    fn unmatched_execute_error_leaves_results() {
        let err = ExecuteError { method: "x.y".into(), error_code: 1, error_msg: "?".into() };
        let r = split_results(env(Some(json!([false])), vec![err]), &calls(&["a.b"]));
        assert_eq!(r, vec![Ok(json!(false))]);
    }

    #[test]
    fn default_period_is_a_third_of_a_second() {
        assert_eq!(ExecutorSettings::default().period(), Duration::from_millis(333));
        assert_eq!(ExecutorSettings::default().batch_size, 25);
    }
}
