//! Audit event constants and payload preview helpers.
//!
//! Lives in `core` so both the repository layer and the worker can build
//! previews without pulling in the sink implementations.

use serde_json::{Map, Value};

use crate::failure::MAX_ERROR_MESSAGE_LEN;

// ---------------------------------------------------------------------------
// Event type constants
// ---------------------------------------------------------------------------

/// Lifecycle events recorded for every job.
pub mod event_types {
    pub const ENQUEUE: &str = "enqueue";
    pub const START: &str = "start";
    pub const SUCCESS: &str = "success";
    pub const RETRY: &str = "retry";
    pub const ERROR: &str = "error";
    pub const CANCEL: &str = "cancel";
    pub const REAP: &str = "reap";
}

// ---------------------------------------------------------------------------
// Sensitive field redaction
// ---------------------------------------------------------------------------

/// Fields that are redacted from payload previews.
pub const SENSITIVE_FIELDS: &[&str] = &[
    "password",
    "token",
    "secret",
    "access_token",
    "refresh_token",
    "api_key",
    "private_key",
    "authorization",
    "credential",
    "cookie",
];

pub const REDACTED: &str = "[REDACTED]";

/// Longest string kept verbatim in a preview.
pub const MAX_PREVIEW_STRING_LEN: usize = 256;

/// Longest array kept in a preview; the rest is summarised.
pub const MAX_PREVIEW_ARRAY_LEN: usize = 16;

/// Nesting depth past which values are replaced by a marker.
pub const MAX_PREVIEW_DEPTH: usize = 8;

fn is_sensitive(key: &str) -> bool {
    let lower_key = key.to_lowercase();
    SENSITIVE_FIELDS.iter().any(|f| lower_key.contains(f))
}

// ---------------------------------------------------------------------------
// Payload previews
// ---------------------------------------------------------------------------

/// Build a bounded, redacted preview of a payload or result document.
///
/// - Sensitive keys are replaced by `"[REDACTED]"`.
/// - Data URIs and long base64-looking strings become `"[binary N bytes]"`.
/// - Other strings longer than [`MAX_PREVIEW_STRING_LEN`] are truncated with
///   a `"...(+N chars)"` suffix.
/// - Arrays keep their first [`MAX_PREVIEW_ARRAY_LEN`] items followed by a
///   `"...(+N items)"` marker.
pub fn payload_preview(value: &Value) -> Value {
    preview_at(value, 0)
}

fn preview_at(value: &Value, depth: usize) -> Value {
    if depth >= MAX_PREVIEW_DEPTH && matches!(value, Value::Object(_) | Value::Array(_)) {
        return Value::String("[nested]".to_string());
    }
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, val) in map {
                let v = if is_sensitive(key) {
                    Value::String(REDACTED.to_string())
                } else {
                    preview_at(val, depth + 1)
                };
                out.insert(key.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(arr) => {
            let mut out: Vec<Value> = arr
                .iter()
                .take(MAX_PREVIEW_ARRAY_LEN)
                .map(|v| preview_at(v, depth + 1))
                .collect();
            if arr.len() > MAX_PREVIEW_ARRAY_LEN {
                out.push(Value::String(format!(
                    "...(+{} items)",
                    arr.len() - MAX_PREVIEW_ARRAY_LEN
                )));
            }
            Value::Array(out)
        }
        Value::String(s) => Value::String(preview_string(s)),
        other => other.clone(),
    }
}

fn preview_string(s: &str) -> String {
    if s.starts_with("data:") && s.contains(";base64,") {
        return format!("[binary {} bytes]", s.len());
    }
    if s.len() > MAX_PREVIEW_STRING_LEN && looks_like_base64(s) {
        return format!("[binary {} bytes]", s.len());
    }
    let total = s.chars().count();
    if total <= MAX_PREVIEW_STRING_LEN {
        return s.to_string();
    }
    let kept: String = s.chars().take(MAX_PREVIEW_STRING_LEN).collect();
    format!("{kept}...(+{} chars)", total - MAX_PREVIEW_STRING_LEN)
}

fn looks_like_base64(s: &str) -> bool {
    !s.contains(char::is_whitespace)
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=' | b'-' | b'_'))
}

/// Truncate an error message to [`MAX_ERROR_MESSAGE_LEN`] characters.
pub fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_MESSAGE_LEN {
        return message.to_string();
    }
    message.chars().take(MAX_ERROR_MESSAGE_LEN).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
