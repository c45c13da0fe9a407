//! Scripted in-memory transport shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use vkpoll_client::{Transport, TransportError};

pub const HANDSHAKE_OK: &str = r#"{"response":{"key":"K","server":"S","ts":100,"pts":7}}"#;

#[derive(Clone, Debug)]
pub enum Reply {
    Body(String),
    Fail(TransportError),
}

impl Reply {
    pub fn body(s: impl Into<String>) -> Self { Self::Body(s.into()) }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Verb { Get, Post }

#[derive(Clone, Debug)]
pub struct Request {
    pub verb:    Verb,
    pub url:     String,
    pub params:  Vec<(String, String)>,
    /// Per-request timeout; only GETs carry one.
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Method names inside an `execute` request, in order.
    pub fn batched_methods(&self) -> Vec<String> {
        methods_in(self.param("code").unwrap_or_default())
    }
}

pub fn methods_in(code: &str) -> Vec<String> {
    code.split("API.")
        .skip(1)
        .filter_map(|s| s.split('(').next())
        .map(str::to_owned)
        .collect()
}

type ExecuteFn = Box<dyn FnMut(&[String]) -> Reply + Send>;

/// Handshake and poll replies are scripted queues. `execute` replies are
/// computed from the batched method names. Other POSTs get `{"response":1}`.
///
/// An exhausted handshake script answers with a fresh session; an
/// exhausted poll script answers, after a short pause, with no updates.
pub struct MockTransport {
    handshakes: Mutex<VecDeque<Reply>>,
    polls:      Mutex<VecDeque<Reply>>,
    execute:    Mutex<ExecuteFn>,
    requests:   Mutex<Vec<Request>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            handshakes: Mutex::new(VecDeque::new()),
            polls:      Mutex::new(VecDeque::new()),
            execute:    Mutex::new(Box::new(|methods| {
                let ones = vec!["1"; methods.len()].join(",");
                Reply::body(format!(r#"{{"response":[{ones}]}}"#))
            })),
            requests:   Mutex::new(Vec::new()),
        }
    }

    pub fn handshake(self, reply: Reply) -> Self {
        self.handshakes.lock().unwrap().push_back(reply);
        self
    }

    pub fn poll(self, reply: Reply) -> Self {
        self.polls.lock().unwrap().push_back(reply);
        self
    }

    pub fn on_execute(self, f: impl FnMut(&[String]) -> Reply + Send + 'static) -> Self {
        *self.execute.lock().unwrap() = Box::new(f);
        self
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn posts_to(&self, method: &str) -> Vec<Request> {
        let suffix = format!("/{method}");
        self.requests().into_iter()
            .filter(|r| r.verb == Verb::Post && r.url.ends_with(&suffix))
            .collect()
    }

    pub fn gets(&self) -> Vec<Request> {
        self.requests().into_iter().filter(|r| r.verb == Verb::Get).collect()
    }

    fn record(
        &self,
        verb:    Verb,
        url:     &str,
        params:  &[(String, String)],
        timeout: Option<Duration>,
    ) -> Request {
        let req = Request { verb, url: url.to_owned(), params: params.to_vec(), timeout };
        self.requests.lock().unwrap().push(req.clone());
        req
    }
}

fn into_result(r: Reply) -> Result<String, TransportError> {
    match r {
        Reply::Body(b) => Ok(b),
        Reply::Fail(e) => Err(e),
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get(
        &self,
        url:     &str,
        query:   &[(String, String)],
        timeout: Duration,
    ) -> Result<String, TransportError> {
        let req = self.record(Verb::Get, url, query, Some(timeout));
        let scripted = self.polls.lock().unwrap().pop_front();
        match scripted {
            Some(r) => into_result(r),
            None => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let ts = req.param("ts").unwrap_or("0");
                Ok(format!(r#"{{"ts":{ts},"updates":[]}}"#))
            }
        }
    }

    async fn post_form(
        &self,
        url:  &str,
        form: &[(String, String)],
    ) -> Result<String, TransportError> {
        let req = self.record(Verb::Post, url, form, None);
        if url.ends_with("/messages.getLongPollServer") {
            let scripted = self.handshakes.lock().unwrap().pop_front();
            return into_result(scripted.unwrap_or_else(|| {
                Reply::body(r#"{"response":{"key":"K-fresh","server":"S2","ts":1000,"pts":1}}"#)
            }));
        }
        if url.ends_with("/execute") {
            let methods = req.batched_methods();
            let reply = {
                let mut respond = self.execute.lock().unwrap();
                (*respond)(&methods)
            };
            return into_result(reply);
        }
        Ok(r#"{"response":1}"#.to_owned())
    }
}
