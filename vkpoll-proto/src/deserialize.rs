//! Decoding of handshake, poll and API responses.

use std::fmt;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::RawUpdate;

// ─── Error ───────────────────────────────────────────────────────────────────

/// Errors that can occur while decoding a response body.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The body is not valid JSON.
    Syntax(String),
    /// The JSON is valid but a required field is missing or mistyped.
    MissingField(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax(e)       => write!(f, "invalid JSON: {e}"),
            Self::MissingField(n) => write!(f, "missing or invalid field `{n}`"),
        }
    }
}

impl std::error::Error for Error {}

/// Specialized `Result` for decoding.
pub type Result<T> = std::result::Result<T, Error>;

fn parse_object(body: &str) -> Result<serde_json::Map<String, Value>> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_)                  => Err(Error::Syntax("top-level value is not an object".into())),
        Err(e)                 => Err(Error::Syntax(e.to_string())),
    }
}

/// Accepts `123` and `"123"`.
fn flexible_i64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<i64, D::Error> {
    let v = Value::deserialize(d)?;
    crate::value_as_i64(&v).ok_or_else(|| serde::de::Error::custom("expected an integer"))
}

fn flexible_opt_i64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<i64>, D::Error> {
    let v = Option::<Value>::deserialize(d)?;
    Ok(v.as_ref().and_then(crate::value_as_i64))
}

// ─── Handshake ───────────────────────────────────────────────────────────────

/// `response` object of `messages.getLongPollServer`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct LongPollServer {
    pub key:    String,
    /// Host and path, without scheme.
    pub server: String,
    #[serde(deserialize_with = "flexible_i64")]
    pub ts:     i64,
    #[serde(default, deserialize_with = "flexible_opt_i64")]
    pub pts:    Option<i64>,
}

impl LongPollServer {
    /// Decode the handshake payload out of an already-unwrapped `response` value.
    ///
    /// `need_pts` makes `pts` mandatory.
    pub fn from_response(response: Value, need_pts: bool) -> Result<Self> {
        let obj = match response {
            Value::Object(o) => o,
            _ => return Err(Error::MissingField("response")),
        };
        for field in ["key", "server", "ts"] {
            if !obj.contains_key(field) {
                return Err(Error::MissingField(field));
            }
        }
        let server: Self = serde_json::from_value(Value::Object(obj))
            .map_err(|e| Error::Syntax(e.to_string()))?;
        if need_pts && server.pts.is_none() {
            return Err(Error::MissingField("pts"));
        }
        Ok(server)
    }
}

// ─── Poll ────────────────────────────────────────────────────────────────────

/// Successful long-poll response.
#[derive(Clone, Debug, PartialEq)]
pub struct PollUpdates {
    pub ts:      i64,
    pub pts:     Option<i64>,
    pub updates: Vec<RawUpdate>,
}

/// Long-poll response carrying a `failed` code.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct PollFailed {
    #[serde(deserialize_with = "flexible_i64")]
    pub failed:      i64,
    #[serde(default, deserialize_with = "flexible_opt_i64")]
    pub ts:          Option<i64>,
    #[serde(default, deserialize_with = "flexible_opt_i64")]
    pub max_version: Option<i64>,
    #[serde(default, deserialize_with = "flexible_opt_i64")]
    pub min_version: Option<i64>,
}

/// Either shape of a long-poll response.
#[derive(Clone, Debug, PartialEq)]
pub enum PollResponse {
    Updates(PollUpdates),
    Failed(PollFailed),
}

impl PollResponse {
    /// Decode a raw long-poll body.
    ///
    /// Elements of `updates` that are not arrays are dropped; the rest keep
    /// their order.
    pub fn from_body(body: &str) -> Result<Self> {
        let mut obj = parse_object(body)?;

        if obj.contains_key("failed") {
            let failed = serde_json::from_value(Value::Object(obj))
                .map_err(|_| Error::MissingField("failed"))?;
            return Ok(Self::Failed(failed));
        }

        let ts = obj.get("ts").and_then(crate::value_as_i64)
            .ok_or(Error::MissingField("ts"))?;
        let pts = obj.get("pts").and_then(crate::value_as_i64);
        let updates = match obj.remove("updates") {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|u| match u {
                    Value::Array(fields) => Some(RawUpdate(fields)),
                    _ => None,
                })
                .collect(),
            _ => return Err(Error::MissingField("updates")),
        };

        Ok(Self::Updates(PollUpdates { ts, pts, updates }))
    }
}

// ─── API envelope ────────────────────────────────────────────────────────────

/// `error` object returned by a failed method call.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ApiError {
    pub error_code: i32,
    #[serde(default)]
    pub error_msg:  String,
}

/// One entry of `execute_errors`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ExecuteError {
    #[serde(default)]
    pub method:     String,
    pub error_code: i32,
    #[serde(default)]
    pub error_msg:  String,
}

/// Top-level body of any method call.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ApiEnvelope {
    #[serde(default)]
    pub response:       Option<Value>,
    #[serde(default)]
    pub error:          Option<ApiError>,
    #[serde(default)]
    pub execute_errors: Vec<ExecuteError>,
}

impl ApiEnvelope {
    /// Decode a method-call body.
    pub fn from_body(body: &str) -> Result<Self> {
        let obj = parse_object(body)?;
        serde_json::from_value(Value::Object(obj)).map_err(|e| Error::Syntax(e.to_string()))
    }
}
