//! Long-poll session parameters and the handshake / recovery protocol.
//!
//! A [`Session`] is valid from a successful handshake until the next
//! response carrying `failed`. It is never patched field by field: recovery
//! always produces a new value. The only in-place change is cursor
//! advancement after a successful poll, done by [`crate::PollLoop`].

use std::sync::Arc;

use serde_json::Value;
use vkpoll_proto::{LongPollServer, Params};

use crate::errors::{InvocationError, PollFailure, SessionError};
use crate::transport::{ApiEndpoint, Transport};

const GET_LONG_POLL_SERVER: &str = "messages.getLongPollServer";

// ─── Session ──────────────────────────────────────────────────────────────────

/// Parameters of one long-poll session.
#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    /// Host and path of the poll server, without scheme.
    pub server:      String,
    pub key:         String,
    /// Event cursor.
    pub ts:          i64,
    /// Persisted-event cursor, present when requested at handshake.
    pub pts:         Option<i64>,
    /// Seconds the server may hold a poll open.
    pub wait:        u32,
    pub mode:        i32,
    /// Protocol version sent with each poll.
    pub version:     i32,
    /// Highest version the server accepts; known only after a version mismatch.
    pub max_version: Option<i32>,
}

impl Session {
    /// Absolute URL of the poll server.
    pub fn poll_url(&self) -> String {
        if self.server.starts_with("http://") || self.server.starts_with("https://") {
            self.server.clone()
        } else {
            format!("https://{}", self.server)
        }
    }

    /// Query for one `a_check` request.
    pub fn poll_query(&self, msgs_limit: u32) -> Vec<(String, String)> {
        vec![
            ("act".into(),        "a_check".into()),
            ("key".into(),        self.key.clone()),
            ("ts".into(),         self.ts.to_string()),
            ("wait".into(),       self.wait.to_string()),
            ("mode".into(),       self.mode.to_string()),
            ("version".into(),    self.version.to_string()),
            ("msgs_limit".into(), msgs_limit.to_string()),
        ]
    }

    /// Move the cursors forward after a successful poll. Never moves back.
    pub(crate) fn advance(&mut self, ts: i64, pts: Option<i64>) {
        if ts >= self.ts {
            self.ts = ts;
        } else {
            tracing::debug!("[vkpoll] ignoring ts regression {} → {}", self.ts, ts);
        }
        if let Some(p) = pts {
            if self.pts.is_none_or(|cur| p >= cur) {
                self.pts = Some(p);
            }
        }
    }
}

// ─── LongPollSettings ─────────────────────────────────────────────────────────

/// Handshake-independent session parameters, taken from [`crate::Config`].
#[derive(Clone, Debug)]
pub struct LongPollSettings {
    pub wait:     u32,
    pub mode:     i32,
    pub version:  i32,
    pub need_pts: bool,
}

// ─── SessionManager ───────────────────────────────────────────────────────────

/// Owns the handshake and the recovery rules for failed polls.
///
/// Imposes no retry limit; the caller decides when to try again.
#[derive(Clone)]
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    endpoint:  ApiEndpoint,
    settings:  LongPollSettings,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn Transport>, endpoint: ApiEndpoint, settings: LongPollSettings) -> Self {
        Self { transport, endpoint, settings }
    }

    pub fn settings(&self) -> &LongPollSettings { &self.settings }

    /// Perform the handshake and build a fresh session speaking `version`.
    pub async fn negotiate(&self, version: i32) -> Result<Session, SessionError> {
        let mut params = Params::new();
        params.insert("need_pts".into(), Value::from(u8::from(self.settings.need_pts)));
        params.insert("lp_version".into(), Value::from(version));

        let response = self.endpoint
            .invoke(self.transport.as_ref(), GET_LONG_POLL_SERVER, &params)
            .await?;
        let server = LongPollServer::from_response(response, self.settings.need_pts)
            .map_err(InvocationError::from)?;

        tracing::info!("[vkpoll] long-poll session negotiated (server={}, ts={}, version={version})",
            server.server, server.ts);

        Ok(Session {
            server:      server.server,
            key:         server.key,
            ts:          server.ts,
            pts:         server.pts,
            wait:        self.settings.wait,
            mode:        self.settings.mode,
            version,
            max_version: None,
        })
    }

    /// Build the session to continue with after `failure`.
    ///
    /// * history expired with a new `ts` → same server and key, new `ts`;
    /// * version mismatch → renegotiate with the server's `max_version`;
    /// * anything else → full renegotiation at the current version.
    pub async fn recover(&self, session: &Session, failure: &PollFailure) -> Result<Session, SessionError> {
        match failure {
            PollFailure::HistoryExpired { ts: Some(ts) } => {
                tracing::info!("[vkpoll] history expired, continuing from ts={ts}");
                Ok(Session { ts: *ts, ..session.clone() })
            }
            PollFailure::VersionMismatch { max_version } => {
                let version = max_version
                    .and_then(|v| i32::try_from(v).ok())
                    .unwrap_or(session.version);
                tracing::warn!("[vkpoll] protocol version {} rejected, renegotiating with {version}",
                    session.version);
                let mut fresh = self.negotiate(version).await?;
                fresh.max_version = Some(version);
                Ok(fresh)
            }
            other => {
                tracing::warn!("[vkpoll] {other}, renegotiating");
                self.negotiate(session.version).await
            }
        }
    }
}
