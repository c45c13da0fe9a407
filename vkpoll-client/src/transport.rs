//! HTTP transport and the method endpoint built on top of it.
//!
//! [`Transport`] is the only place that touches the network. The default
//! implementation is [`HttpTransport`] (reqwest + rustls); tests swap in a
//! scripted one.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use vkpoll_proto::{ApiEnvelope, Params, serialize::form_pairs};

use crate::errors::{InvocationError, RpcError, TransportError};

// ─── Transport ────────────────────────────────────────────────────────────────

/// Performs GET / form-POST calls and returns the raw body.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// `GET url?query`, failing if no response arrives within `timeout`.
    async fn get(
        &self,
        url:     &str,
        query:   &[(String, String)],
        timeout: Duration,
    ) -> Result<String, TransportError>;

    /// `POST url` with a form-encoded body.
    async fn post_form(
        &self,
        url:  &str,
        form: &[(String, String)],
    ) -> Result<String, TransportError>;
}

/// The default [`Transport`], backed by a shared `reqwest::Client`.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    inner:           reqwest::Client,
    request_timeout: Duration,
}

impl HttpTransport {
    /// `request_timeout` applies to POSTs; GETs carry their own.
    pub fn new(request_timeout: Duration) -> Result<Self, TransportError> {
        let inner = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(Self { inner, request_timeout })
    }

    async fn read(resp: reqwest::Response) -> Result<String, TransportError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        resp.text().await.map_err(map_reqwest)
    }
}

fn map_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Io(e.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(
        &self,
        url:     &str,
        query:   &[(String, String)],
        timeout: Duration,
    ) -> Result<String, TransportError> {
        let resp = self.inner.get(url)
            .query(query)
            .timeout(timeout)
            .send()
            .await
            .map_err(map_reqwest)?;
        Self::read(resp).await
    }

    async fn post_form(
        &self,
        url:  &str,
        form: &[(String, String)],
    ) -> Result<String, TransportError> {
        let resp = self.inner.post(url)
            .form(form)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(map_reqwest)?;
        Self::read(resp).await
    }
}

// ─── ApiEndpoint ──────────────────────────────────────────────────────────────

/// Everything needed to address the method endpoint: token, version, base
/// URL and parameters added to every request.
#[derive(Clone, Debug)]
pub struct ApiEndpoint {
    pub access_token:   String,
    pub api_version:    String,
    pub base_url:       String,
    pub default_params: Params,
}

impl ApiEndpoint {
    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), method)
    }

    /// Form body for `params`, with defaults, token and version appended.
    /// Explicit parameters win over defaults.
    fn form(&self, params: &Params) -> Vec<(String, String)> {
        let mut form = form_pairs(params);
        for (k, v) in form_pairs(&self.default_params) {
            if !params.contains_key(&k) {
                form.push((k, v));
            }
        }
        form.push(("access_token".into(), self.access_token.clone()));
        form.push(("v".into(), self.api_version.clone()));
        form
    }

    /// One immediate, unbatched method call.
    ///
    /// Returns the unwrapped `response` value.
    pub async fn invoke(
        &self,
        transport: &dyn Transport,
        method:    &str,
        params:    &Params,
    ) -> Result<Value, InvocationError> {
        let body = transport.post_form(&self.url(method), &self.form(params)).await?;
        let env  = ApiEnvelope::from_body(&body)?;
        if let Some(err) = env.error {
            return Err(InvocationError::Rpc(RpcError::from(err)));
        }
        env.response
            .ok_or_else(|| InvocationError::MalformedResponse(format!("{method}: no `response` field")))
    }

    /// One physical `execute` request carrying `code`.
    ///
    /// The envelope is returned whole so the caller can pair
    /// `execute_errors` with individual calls.
    pub async fn execute(
        &self,
        transport: &dyn Transport,
        code:      String,
    ) -> Result<ApiEnvelope, InvocationError> {
        let mut params = Params::new();
        params.insert("code".into(), Value::String(code));
        let body = transport.post_form(&self.url("execute"), &self.form(&params)).await?;
        let env  = ApiEnvelope::from_body(&body)?;
        if let Some(err) = env.error {
            return Err(InvocationError::Rpc(RpcError::from(err)));
        }
        Ok(env)
    }
}
