//! Error types for vkpoll-client.

use std::fmt;

use vkpoll_proto::{ApiError, ExecuteError, PollFailed, deserialize};

// ─── TransportError ───────────────────────────────────────────────────────────

/// A physical HTTP call did not produce a body.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportError {
    /// Connection, TLS or I/O failure.
    Io(String),
    /// The server answered with a non-2xx status.
    Status(u16),
    /// No response within the request timeout.
    Timeout,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e)     => write!(f, "I/O error: {e}"),
            Self::Status(s) => write!(f, "HTTP status {s}"),
            Self::Timeout   => write!(f, "request timed out"),
        }
    }
}

impl std::error::Error for TransportError {}

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// An error reported by the API for one method call.
///
/// # Example
/// `{"error":{"error_code":5,"error_msg":"User authorization failed"}}`
/// → `RpcError { code: 5, method: None, message: "User authorization failed" }`
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    /// Numeric error code.
    pub code:    i32,
    /// Method the error belongs to, when reported inside a batch.
    pub method:  Option<String>,
    /// Human-readable message.
    pub message: String,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.message)?;
        if let Some(m) = &self.method {
            write!(f, " (in {m})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl From<ApiError> for RpcError {
    fn from(e: ApiError) -> Self {
        Self { code: e.error_code, method: None, message: e.error_msg }
    }
}

impl From<ExecuteError> for RpcError {
    fn from(e: ExecuteError) -> Self {
        Self { code: e.error_code, method: Some(e.method), message: e.error_msg }
    }
}

impl RpcError {
    /// `true` for codes that mean the access token itself is unusable.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self.code, 5 | 27 | 28)
    }
}

// ─── InvocationError ──────────────────────────────────────────────────────────

/// The error type returned from any call that talks to the API.
///
/// Cloneable: a failed batch delivers the same error to every call in it.
#[derive(Clone, Debug, PartialEq)]
pub enum InvocationError {
    /// Network / HTTP failure.
    Transport(TransportError),
    /// The body was not valid JSON or lacked a required field.
    MalformedResponse(String),
    /// The API rejected the request.
    Rpc(RpcError),
    /// One call inside an otherwise successful batch failed.
    BatchExecution(RpcError),
    /// The executor was shut down before the call could be sent.
    Stopped,
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e)         => write!(f, "transport: {e}"),
            Self::MalformedResponse(s) => write!(f, "malformed response: {s}"),
            Self::Rpc(e)               => write!(f, "{e}"),
            Self::BatchExecution(e)    => write!(f, "batch: {e}"),
            Self::Stopped              => write!(f, "executor stopped"),
        }
    }
}

impl std::error::Error for InvocationError {}

impl From<TransportError> for InvocationError {
    fn from(e: TransportError) -> Self { Self::Transport(e) }
}

impl From<deserialize::Error> for InvocationError {
    fn from(e: deserialize::Error) -> Self { Self::MalformedResponse(e.to_string()) }
}

impl InvocationError {
    /// `true` when retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::MalformedResponse(_))
    }
}

// ─── PollFailure ──────────────────────────────────────────────────────────────

/// A long-poll response with a `failed` code, classified.
#[derive(Clone, Debug, PartialEq)]
pub enum PollFailure {
    /// Code 1: events were lost; continue from the supplied `ts`.
    HistoryExpired { ts: Option<i64> },
    /// Code 2 (key expired) or 3 (user data lost): renegotiate.
    SessionInvalidated { code: i64 },
    /// Code 4: requested protocol version is not supported.
    VersionMismatch { max_version: Option<i64> },
    /// Any other code; handled like [`PollFailure::SessionInvalidated`].
    Unknown { code: i64 },
}

impl From<&PollFailed> for PollFailure {
    fn from(f: &PollFailed) -> Self {
        match f.failed {
            1     => Self::HistoryExpired { ts: f.ts },
            2 | 3 => Self::SessionInvalidated { code: f.failed },
            4     => Self::VersionMismatch { max_version: f.max_version },
            code  => Self::Unknown { code },
        }
    }
}

impl fmt::Display for PollFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HistoryExpired { ts }          => write!(f, "history expired (ts={ts:?})"),
            Self::SessionInvalidated { code }    => write!(f, "session invalidated (failed={code})"),
            Self::VersionMismatch { max_version } => write!(f, "version mismatch (max_version={max_version:?})"),
            Self::Unknown { code }               => write!(f, "unknown failure code {code}"),
        }
    }
}

// ─── SessionError ─────────────────────────────────────────────────────────────

/// Errors returned by [`crate::SessionManager`].
#[derive(Clone, Debug, PartialEq)]
pub enum SessionError {
    /// The handshake call failed or its response lacked a required field.
    NegotiationFailed(InvocationError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NegotiationFailed(e) => write!(f, "long-poll negotiation failed: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<InvocationError> for SessionError {
    fn from(e: InvocationError) -> Self { Self::NegotiationFailed(e) }
}

impl SessionError {
    /// The underlying call error.
    pub fn cause(&self) -> &InvocationError {
        match self {
            Self::NegotiationFailed(e) => e,
        }
    }
}
