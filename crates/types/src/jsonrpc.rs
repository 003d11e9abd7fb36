//! JSON-RPC 2.0 message model shared by the stdio and HTTP sides.
//!
//! Classification follows the presence of `id`, `method`, `result` and
//! `error`; anything that fits none of the shapes is kept verbatim as
//! [`Message::Other`] so it can be passed through untouched.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// The only protocol version this proxy speaks.
pub const JSONRPC_VERSION: &str = "2.0";

/// Method name of the handshake that may establish a session.
pub const INITIALIZE_METHOD: &str = "initialize";

/// Method name of the client-side cancellation notification.
pub const CANCELLED_METHOD: &str = "notifications/cancelled";

/// Stable numeric error codes.
pub mod codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or the upstream returned 404.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters or an upstream 4xx.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal, transport, timeout and authentication failures.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// The upstream rejected our credentials (401/403).
    pub const UPSTREAM_UNAUTHORIZED: i32 = -32002;
}

/// A request identifier: integer, string or `null`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
    Null,
}

impl RequestId {
    /// Parse an `id` member. Floats, booleans, arrays and objects are rejected.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Number),
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Null => Some(Self::Null),
            _ => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Null => f.write_str("null"),
        }
    }
}

/// A call that expects exactly one [`Response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    /// Whether this is the session-establishing handshake.
    #[must_use]
    pub fn is_handshake(&self) -> bool {
        self.method == INITIALIZE_METHOD
    }
}

/// A fire-and-forget message; never answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }

    /// For `notifications/cancelled`, the id of the request being cancelled.
    #[must_use]
    pub fn cancelled_request_id(&self) -> Option<RequestId> {
        if self.method != CANCELLED_METHOD {
            return None;
        }
        self.params
            .as_ref()
            .and_then(|p| p.get("requestId"))
            .and_then(RequestId::from_value)
    }
}

/// JSON-RPC error object; the only failure shape handed back to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ProtocolError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Outcome carried by a [`Response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Result(Value),
    Error(ProtocolError),
}

/// Reply to a [`Request`] with the same `id`.
///
/// A response parsed with [`Response::from_raw`] keeps the object it was
/// parsed from and serializes back to exactly that object, including
/// members the typed fields do not model.
#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(flatten)]
    pub outcome: Outcome,
    #[serde(skip)]
    raw: Option<Value>,
}

#[derive(Serialize)]
struct Envelope<'a> {
    jsonrpc: &'a str,
    id: &'a RequestId,
    #[serde(flatten)]
    outcome: &'a Outcome,
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if let Some(raw) = &self.raw {
            return raw.serialize(serializer);
        }
        Envelope {
            jsonrpc: &self.jsonrpc,
            id: &self.id,
            outcome: &self.outcome,
        }
        .serialize(serializer)
    }
}

impl PartialEq for Response {
    fn eq(&self, other: &Self) -> bool {
        self.to_value() == other.to_value()
    }
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            outcome: Outcome::Result(result),
            raw: None,
        }
    }

    #[must_use]
    pub fn failure(id: RequestId, error: ProtocolError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            outcome: Outcome::Error(error),
            raw: None,
        }
    }

    /// Parse `value` and keep it verbatim for serialization.
    ///
    /// # Errors
    ///
    /// Returns the deserialization error if `value` is not a response.
    pub fn from_raw(value: Value) -> Result<Self, serde_json::Error> {
        let mut response: Self = serde_json::from_value(value.clone())?;
        response.raw = Some(value);
        Ok(response)
    }

    /// The error object, if this is a failure response.
    #[must_use]
    pub fn error(&self) -> Option<&ProtocolError> {
        match &self.outcome {
            Outcome::Error(e) => Some(e),
            Outcome::Result(_) => None,
        }
    }

    /// The result payload, if this is a success response.
    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Result(v) => Some(v),
            Outcome::Error(_) => None,
        }
    }

    /// Serialize to a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Any message travelling over either transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
    /// Well-formed JSON that is none of the above.
    Other(Value),
}

impl Message {
    /// Classify a parsed JSON value.
    ///
    /// Never fails: values that do not fit a known shape come back as
    /// [`Message::Other`] unchanged.
    #[must_use]
    pub fn classify(value: Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::Other(value);
        };
        if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Self::Other(value);
        }

        let has_method = obj.get("method").is_some_and(Value::is_string);
        let id = obj.get("id").map(RequestId::from_value);

        let parsed = match (has_method, id) {
            (true, Some(Some(_))) => serde_json::from_value(value.clone()).map(Self::Request),
            (true, None) => serde_json::from_value(value.clone()).map(Self::Notification),
            (false, Some(Some(_))) if obj.contains_key("result") || obj.contains_key("error") => {
                Response::from_raw(value.clone()).map(Self::Response)
            }
            _ => return Self::Other(value),
        };
        parsed.unwrap_or(Self::Other(value))
    }

    /// Serialize back to a JSON value.
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::Request(r) => serde_json::to_value(r).unwrap_or(Value::Null),
            Self::Notification(n) => serde_json::to_value(n).unwrap_or(Value::Null),
            Self::Response(r) => r.to_value(),
            Self::Other(v) => v,
        }
    }

    /// Short label for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Notification(_) => "notification",
            Self::Response(_) => "response",
            Self::Other(_) => "other",
        }
    }
}
