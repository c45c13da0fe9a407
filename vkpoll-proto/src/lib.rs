//! Wire types for the VK user long-poll protocol.
//!
//! This crate contains no I/O. It describes what goes over the wire and how
//! to turn it into Rust values:
//!
//! | Module          | Contents                                                    |
//! |-----------------|-------------------------------------------------------------|
//! | [`deserialize`] | Handshake, poll and API envelope decoding                   |
//! | [`serialize`]   | `execute` code writer and form-value encoding               |
//! | [`event`]       | Numeric long-poll event codes                               |
//! | [`flags`]       | Message flag bits                                           |
//! | [`mode`]        | Long-poll `mode` bitmask                                    |
//!
//! # Building a batched request
//!
//! ```rust
//! use vkpoll_proto::{MethodCall, serialize::execute_code};
//!
//! let calls = [
//!     MethodCall::new("users.get").with("user_ids", 1),
//!     MethodCall::new("messages.setActivity").with("type", "typing").with("peer_id", 42),
//! ];
//! assert_eq!(
//!     execute_code(&calls),
//!     r#"return [API.users.get({"user_ids":1}),API.messages.setActivity({"peer_id":42,"type":"typing"})];"#,
//! );
//! ```

#![deny(unsafe_code)]

pub mod deserialize;
pub mod serialize;

pub use deserialize::{
    ApiEnvelope, ApiError, ExecuteError, LongPollServer, PollFailed, PollResponse, PollUpdates,
};
pub use serialize::ToCode;

use serde_json::Value;

/// Named parameters of one API method call.
pub type Params = serde_json::Map<String, Value>;

// ─── Protocol constants ───────────────────────────────────────────────────────

/// Peer ids above this value address a group chat: `peer_id = CHAT_ID_OFFSET + chat_id`.
pub const CHAT_ID_OFFSET: i64 = 2_000_000_000;

/// API version sent as `v` with every method call.
pub const API_VERSION: &str = "5.131";

/// Base URL of the method endpoint.
pub const API_BASE_URL: &str = "https://api.vk.com/method";

/// Long-poll protocol version requested during the handshake.
pub const LONG_POLL_VERSION: i32 = 3;

/// Most calls a single `execute` request may contain.
pub const MAX_BATCH_CALLS: usize = 25;

/// Most `execute` requests allowed per second.
pub const MAX_EXECUTE_PER_SECOND: u32 = 3;

/// Long-poll event codes (first element of every update tuple).
pub mod event {
    /// `[4, message_id, flags, peer_id, timestamp, text, attachments, random_id]`
    pub const NEW_MESSAGE: i64 = 4;
    /// `[61, user_id, flags]`
    pub const USER_TYPING: i64 = 61;
    /// `[62, user_id, chat_id]`
    pub const USER_TYPING_IN_CHAT: i64 = 62;
}

/// Message flag bits carried by [`event::NEW_MESSAGE`].
pub mod flags {
    pub const UNREAD:    i64 = 1;
    /// Sent by the account that owns the session.
    pub const OUTBOX:    i64 = 2;
    pub const REPLIED:   i64 = 4;
    pub const IMPORTANT: i64 = 8;
    pub const CHAT:      i64 = 16;
    pub const FRIENDS:   i64 = 32;
    pub const SPAM:      i64 = 64;
    pub const DELETED:   i64 = 128;
}

/// Bits of the long-poll `mode` parameter.
pub mod mode {
    pub const ATTACHMENTS: i32 = 2;
    pub const EXTENDED:    i32 = 8;
    pub const PTS:         i32 = 32;
    pub const EXTRA:       i32 = 64;
    pub const RANDOM_ID:   i32 = 128;

    /// attachments + pts + random_id
    pub const DEFAULT: i32 = ATTACHMENTS | PTS | RANDOM_ID;
}

// ─── RawUpdate ────────────────────────────────────────────────────────────────

/// One element of a poll response's `updates` array, kept as received.
///
/// The shape depends on the event code in position 0; see [`event`].
#[derive(Clone, Debug, PartialEq)]
pub struct RawUpdate(pub Vec<Value>);

impl RawUpdate {
    /// The numeric event code, if present.
    pub fn event_type(&self) -> Option<i64> {
        self.int(0)
    }

    /// Number of fields, event code included.
    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// Field at `idx`.
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.0.get(idx)
    }

    /// Integer field at `idx`. Numeric strings are accepted.
    pub fn int(&self, idx: usize) -> Option<i64> {
        self.get(idx).and_then(value_as_i64)
    }

    /// String field at `idx`.
    pub fn text(&self, idx: usize) -> Option<&str> {
        self.get(idx).and_then(Value::as_str)
    }
}

impl From<Vec<Value>> for RawUpdate {
    fn from(v: Vec<Value>) -> Self { Self(v) }
}

/// Integer view of a JSON value; numeric strings count, as the server is not
/// consistent about quoting ids inside attachment maps.
pub fn value_as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ─── MethodCall ───────────────────────────────────────────────────────────────

/// A single API method invocation: name plus named parameters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MethodCall {
    pub method: String,
    pub params: Params,
}

impl MethodCall {
    /// A call to `method` with no parameters.
    pub fn new(method: impl Into<String>) -> Self {
        Self { method: method.into(), params: Params::new() }
    }

    /// A call to `method` with the given parameters.
    pub fn with_params(method: impl Into<String>, params: Params) -> Self {
        Self { method: method.into(), params }
    }

    /// Add one parameter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}
