//! JSON-RPC 2.0 message envelope and the gateway's error-code taxonomy.
//!
//! A single [`Message`] type covers requests, notifications and responses,
//! mirroring the wire shape: `method`/`params` on requests, `result` or
//! `error` on responses, and an optional `id` that correlates the two.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Protocol version string carried on every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC request identifier (`string | integer`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(i64),
    String(String),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Number(n) => write!(f, "{n}"),
            MessageId::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for MessageId {
    fn from(n: i64) -> Self {
        MessageId::Number(n)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        MessageId::String(s.to_string())
    }
}

/// The `error` member of a JSON-RPC error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Error codes the gateway emits: JSON-RPC standard codes plus the
/// reserved application range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    InternalError,
    RateLimited,
    Blocked,
    NoUpstream,
    UpstreamFailure,
    MessageTooLarge,
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::InternalError => -32603,
            ErrorCode::RateLimited => -32000,
            ErrorCode::Blocked => -32001,
            ErrorCode::NoUpstream => -32002,
            ErrorCode::UpstreamFailure => -32003,
            ErrorCode::MessageTooLarge => -32004,
        }
    }

    /// Client-safe default message. Never includes internal detail.
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "Parse error",
            ErrorCode::InvalidRequest => "Invalid Request",
            ErrorCode::InternalError => "Internal error",
            ErrorCode::RateLimited => "Rate limit exceeded",
            ErrorCode::Blocked => "Blocked by security policy",
            ErrorCode::NoUpstream => "No upstream available",
            ErrorCode::UpstreamFailure => "Upstream request failed",
            ErrorCode::MessageTooLarge => "Message exceeds maximum size",
        }
    }
}

/// One protocol envelope.
///
/// Deserialization is lenient about which members are present; callers use
/// [`Message::is_request`], [`Message::is_notification`] and
/// [`Message::is_response`] to classify it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Message {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<MessageId>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    /// `Some(Value::Null)` for an explicit `"result": null`.
    #[serde(default, deserialize_with = "present")]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ErrorObject>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

fn present<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl Message {
    /// Build a request. `id: None` makes it a notification.
    pub fn request(id: Option<MessageId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn success(id: Option<MessageId>, result: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response using the code's default (sanitized) message.
    pub fn error_response(id: Option<MessageId>, code: ErrorCode) -> Self {
        Self::error_with(id, code, code.default_message(), None)
    }

    pub fn error_with(
        id: Option<MessageId>,
        code: ErrorCode,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            method: None,
            params: None,
            result: None,
            error: Some(ErrorObject {
                code: code.code(),
                message: message.into(),
                data,
            }),
        }
    }

    /// Parse a message from a JSON value, recovering the id for the error
    /// path when the value is an object of the wrong shape.
    pub fn from_value(value: Value) -> Result<Self, (Option<MessageId>, String)> {
        let Value::Object(ref obj) = value else {
            let kind = match value {
                Value::Array(_) => "batch messages are not supported",
                _ => "message must be a JSON object",
            };
            return Err((None, kind.to_string()));
        };
        let id = obj
            .get("id")
            .and_then(|v| serde_json::from_value::<MessageId>(v.clone()).ok());
        serde_json::from_value(value).map_err(|e| (id, e.to_string()))
    }

    pub fn is_request(&self) -> bool {
        self.method.is_some() && self.id.is_some()
    }

    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }

    /// A method-less message carrying `result` or `error`.
    pub fn is_response(&self) -> bool {
        self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }

    pub fn method(&self) -> &str {
        self.method.as_deref().unwrap_or("")
    }

    /// `params.name` of a `tools/call`, if any.
    pub fn tool_name(&self) -> Option<&str> {
        self.params.as_ref()?.get("name")?.as_str()
    }

    /// The `error.code` of an error response.
    pub fn error_code(&self) -> Option<i64> {
        self.error.as_ref().map(|e| e.code)
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", &self.jsonrpc)?;
        // Responses always carry an id, `null` when the request id is unknown.
        if self.id.is_some() || self.method.is_none() {
            map.serialize_entry("id", &self.id)?;
        }
        if let Some(ref method) = self.method {
            map.serialize_entry("method", method)?;
        }
        if let Some(ref params) = self.params {
            map.serialize_entry("params", params)?;
        }
        if let Some(ref result) = self.result {
            map.serialize_entry("result", result)?;
        }
        if let Some(ref error) = self.error {
            map.serialize_entry("error", error)?;
        }
        map.end()
    }
}
