//! The [`ToCode`] trait: writing calls as `execute` expressions.
//!
//! The `execute` method takes a `code` parameter in a small JavaScript-like
//! expression language. Object literals use JSON syntax, so parameter maps
//! are written as JSON and method invocations as `API.<method>(<object>)`.
//! A batch is a list literal of invocations:
//!
//! ```text
//! return [API.users.get({"user_ids":1}),API.friends.get({})];
//! ```

use serde_json::Value;

use crate::MethodCall;

/// Write `self` as an `execute` expression.
pub trait ToCode {
    /// Appends the expression form of `self` to `buf`.
    fn write_code(&self, buf: &mut String);

    /// Convenience: allocate a fresh `String` and write into it.
    fn to_code(&self) -> String {
        let mut s = String::new();
        self.write_code(&mut s);
        s
    }
}

// ─── literals ────────────────────────────────────────────────────────────────

/// JSON literal. Strings are escaped by `serde_json`, which the expression
/// parser accepts verbatim.
impl ToCode for Value {
    fn write_code(&self, buf: &mut String) {
        buf.push_str(&self.to_string());
    }
}

impl ToCode for crate::Params {
    fn write_code(&self, buf: &mut String) {
        buf.push('{');
        for (i, (k, v)) in self.iter().enumerate() {
            if i > 0 { buf.push(','); }
            buf.push_str(&Value::String(k.clone()).to_string());
            buf.push(':');
            v.write_code(buf);
        }
        buf.push('}');
    }
}

// ─── invocations ─────────────────────────────────────────────────────────────

/// `API.method({params})`
impl ToCode for MethodCall {
    fn write_code(&self, buf: &mut String) {
        buf.push_str("API.");
        buf.push_str(&self.method);
        buf.push('(');
        self.params.write_code(buf);
        buf.push(')');
    }
}

/// List literal, elements in order.
impl<T: ToCode> ToCode for [T] {
    fn write_code(&self, buf: &mut String) {
        buf.push('[');
        for (i, item) in self.iter().enumerate() {
            if i > 0 { buf.push(','); }
            item.write_code(buf);
        }
        buf.push(']');
    }
}

/// The full `code` parameter for a batch: `return [c1,c2,...];`.
///
/// Element *i* of the server's `response` array is the result of `calls[i]`.
pub fn execute_code(calls: &[MethodCall]) -> String {
    let mut s = String::from("return ");
    calls.write_code(&mut s);
    s.push(';');
    s
}

// ─── form values ─────────────────────────────────────────────────────────────

/// Encode a parameter value for a form body or query string.
///
/// Strings are sent bare, booleans as `1`/`0`, arrays of scalars joined by
/// commas; anything else is sent as its JSON text.
pub fn form_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Bool(b)   => if *b { "1".into() } else { "0".into() },
        Value::Null      => String::new(),
        Value::Array(items) if items.iter().all(|i| !i.is_array() && !i.is_object()) => {
            items.iter().map(form_value).collect::<Vec<_>>().join(",")
        }
        other => other.to_string(),
    }
}

/// Flatten a parameter map into form pairs.
pub fn form_pairs(params: &crate::Params) -> Vec<(String, String)> {
    params.iter().map(|(k, v)| (k.clone(), form_value(v))).collect()
}
