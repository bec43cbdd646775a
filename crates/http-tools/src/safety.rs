//! Response limits, body decoding and error redaction for outbound HTTP.

use base64::Engine as _;
use mime::Mime;
use serde_json::{Value, json};
use std::error::Error as _;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum HttpToolsError {
    #[error("http transport error: {0}")]
    Transport(String),
    #[error("response too large: {0}")]
    TooLarge(String),
}

impl From<reqwest::Error> for HttpToolsError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(sanitize_reqwest_error(&value))
    }
}

pub type Result<T> = std::result::Result<T, HttpToolsError>;

/// Strip credentials, query and fragment from a URL before it reaches logs or clients.
#[must_use]
pub fn redact_url(url: &Url) -> String {
    let mut u = url.clone();
    let _ = u.set_username("");
    let _ = u.set_password(None);
    u.set_query(None);
    u.set_fragment(None);
    u.to_string()
}

/// Render a `reqwest` error with any embedded URL redacted.
#[must_use]
pub fn sanitize_reqwest_error(e: &reqwest::Error) -> String {
    let mut msg = e.to_string();
    if let Some(u) = e.url() {
        msg = msg.replace(u.as_str(), &redact_url(u));
    }
    let mut source = e.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if !msg.contains(&text) {
            msg.push_str(": ");
            msg.push_str(&text);
        }
        source = inner.source();
    }
    msg
}

/// Read a response body, failing once it exceeds `max_bytes` (if set).
///
/// # Errors
///
/// Returns [`HttpToolsError::TooLarge`] when the limit is exceeded and
/// [`HttpToolsError::Transport`] when the body cannot be read.
pub async fn read_body_limited(
    mut response: reqwest::Response,
    max_bytes: Option<usize>,
) -> Result<Vec<u8>> {
    let Some(max) = max_bytes else {
        return Ok(response.bytes().await?.to_vec());
    };

    if let Some(len) = response.content_length()
        && len > max as u64
    {
        return Err(HttpToolsError::TooLarge(format!("{len} bytes (limit {max})")));
    }

    let mut out: Vec<u8> = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if out.len().saturating_add(chunk.len()) > max {
            return Err(HttpToolsError::TooLarge(format!("exceeded {max} bytes")));
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

/// True for `application/json` and any `+json` structured-syntax suffix.
#[must_use]
pub fn is_json_content_type(content_type: Option<&str>) -> bool {
    let Some(ct) = content_type else {
        return false;
    };
    let Ok(m) = ct.parse::<Mime>() else {
        return false;
    };
    m.subtype() == mime::JSON || m.suffix() == Some(mime::JSON)
}

/// Decode a response body.
///
/// JSON content types are parsed (falling back to text when the payload is not valid JSON),
/// other UTF-8 payloads become strings, and binary payloads become a base64 envelope.
/// An empty body is `null`.
#[must_use]
pub fn decode_body(bytes: &[u8], content_type: Option<&str>) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    if is_json_content_type(content_type)
        && let Ok(v) = serde_json::from_slice::<Value>(bytes)
    {
        return v;
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => Value::String(s.to_string()),
        Err(_) => json!({
            "encoding": "base64",
            "mimeType": content_type,
            "data": base64::engine::general_purpose::STANDARD.encode(bytes),
        }),
    }
}
