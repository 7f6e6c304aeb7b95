//! Transport failures and the typed error taxonomy built from them.
//!
//! [`RawFailure`] is the only representation of a failed HTTP exchange. It is
//! produced by a validating parse of whatever the transport handed back, and
//! [`classify`] is the only function that looks inside it. Everything above
//! the API layer works with [`ErrorRecord`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Maximum length for error response bodies in log output
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Body title the backend uses for expired or revoked tokens.
const TOKEN_ERROR_TITLE: &str = "TokenError";

/// Closed set of error kinds surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub enum ErrorKind {
    NetworkError,
    ValidationError,
    AuthError,
    TokenError,
    ConflictError,
    NotFoundError,
    ServerError,
    UnknownError,
}

impl ErrorKind {
    /// Title used when the response body does not carry one.
    pub fn default_title(&self) -> &'static str {
        match self {
            ErrorKind::NetworkError => "Network error",
            ErrorKind::ValidationError => "Invalid request",
            ErrorKind::AuthError => "Not authorized",
            ErrorKind::TokenError => "Session expired",
            ErrorKind::ConflictError => "Conflict",
            ErrorKind::NotFoundError => "Not found",
            ErrorKind::ServerError => "Server error",
            ErrorKind::UnknownError => "Unexpected error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Normalized representation of any failure crossing the transport boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[error("{title}: {message}")]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub title: String,
    pub message: String,
    #[serde(rename = "httpStatus", skip_serializing_if = "Option::is_none", default)]
    pub http_status: Option<u16>,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            title: kind.default_title().to_string(),
            message: message.into(),
            http_status: None,
        }
    }

    /// True when the consumer should send the user back through login.
    pub fn requires_reauth(&self) -> bool {
        self.kind == ErrorKind::TokenError
    }
}

/// Parsed error body. Some backends put the title under `error`, and
/// validation failures carry `message` as a list of per-field messages.
///
/// Fields are read one at a time; a field of an unexpected type is skipped
/// rather than discarding the rest of the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    title: Option<String>,
    message: Option<String>,
}

impl ErrorBody {
    fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        let text = |field: &str| {
            map.get(field)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Some(Self {
            title: text("title").or_else(|| text("error")),
            message: map.get("message").and_then(message_text),
        })
    }

    fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    fn message(&self) -> Option<String> {
        self.message.clone()
    }
}

fn message_text(value: &Value) -> Option<String> {
    let joined = match value {
        Value::String(message) => message.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("; "),
        _ => return None,
    };
    Some(joined).filter(|m| !m.is_empty())
}

/// A failed exchange with the backend, after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFailure {
    /// The request never produced a response (connect error, timeout, ...).
    NoResponse { reason: String },
    /// The server answered. `body` is `None` when absent or malformed.
    Response {
        status: Option<u16>,
        body: Option<ErrorBody>,
    },
    /// A success response whose payload could not be decoded.
    Decode { reason: String },
}

impl RawFailure {
    pub fn no_response(reason: impl fmt::Display) -> Self {
        RawFailure::NoResponse {
            reason: reason.to_string(),
        }
    }

    pub fn decode(reason: impl fmt::Display) -> Self {
        RawFailure::Decode {
            reason: reason.to_string(),
        }
    }

    /// Build from an HTTP status and raw response text.
    pub fn from_response(status: u16, body: &str) -> Self {
        let parsed = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|value| parse_body(&value));
        if parsed.is_none() && !body.is_empty() {
            debug!(status, body = %truncate_body(body), "Unstructured error body");
        }
        RawFailure::Response {
            status: Some(status),
            body: parsed,
        }
    }

    /// Validating parse of an untyped failure value shaped like
    /// `{ response?: { data?: { statusCode, body: { title, message } } } }`.
    pub fn from_value(value: &Value) -> Self {
        let Some(response) = value.get("response").filter(|r| !r.is_null()) else {
            return RawFailure::no_response("no response received");
        };
        let data = response.get("data");
        let status = data
            .and_then(|d| d.get("statusCode"))
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok());
        let body = data.and_then(|d| d.get("body")).and_then(parse_body);
        RawFailure::Response { status, body }
    }

    /// Validating parse of the `data` part alone: `{ statusCode?, body? }`.
    pub fn from_data(data: &Value) -> Self {
        RawFailure::from_value(&serde_json::json!({ "response": { "data": data } }))
    }
}

impl fmt::Display for RawFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawFailure::NoResponse { reason } => write!(f, "no response: {}", reason),
            RawFailure::Response { status: Some(s), .. } => write!(f, "HTTP {}", s),
            RawFailure::Response { status: None, .. } => write!(f, "response without status"),
            RawFailure::Decode { reason } => write!(f, "undecodable response: {}", reason),
        }
    }
}

fn parse_body(value: &Value) -> Option<ErrorBody> {
    ErrorBody::from_value(value)
}

/// Truncate a response body to avoid logging excessive data
fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        body.to_string()
    } else {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }
}

/// Map a raw failure onto the closed [`ErrorRecord`] taxonomy.
///
/// `default_message` is used whenever the body does not carry a message.
pub fn classify(raw: &RawFailure, default_message: &str) -> ErrorRecord {
    let (kind, status, body) = match raw {
        RawFailure::NoResponse { reason } => {
            debug!(reason = %reason, "Classified as network error");
            (ErrorKind::NetworkError, None, None)
        }
        RawFailure::Decode { reason } => {
            debug!(reason = %reason, "Classified as unknown error");
            (ErrorKind::UnknownError, None, None)
        }
        RawFailure::Response { status, body } => {
            let kind = match (*status, body) {
                (Some(401), Some(b)) if b.title() == Some(TOKEN_ERROR_TITLE) => {
                    ErrorKind::TokenError
                }
                (Some(401), _) => ErrorKind::AuthError,
                (Some(400), _) => ErrorKind::ValidationError,
                (Some(409), _) => ErrorKind::ConflictError,
                (Some(404), _) => ErrorKind::NotFoundError,
                (Some(500..=599), _) => ErrorKind::ServerError,
                (_, None) => ErrorKind::ServerError,
                _ => ErrorKind::UnknownError,
            };
            (kind, *status, body.as_ref())
        }
    };

    ErrorRecord {
        kind,
        title: body
            .and_then(ErrorBody::title)
            .unwrap_or(kind.default_title())
            .to_string(),
        message: body
            .and_then(ErrorBody::message)
            .unwrap_or_else(|| default_message.to_string()),
        http_status: status,
    }
}
