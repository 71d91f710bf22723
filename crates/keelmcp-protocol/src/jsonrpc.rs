//! # JSON-RPC 2.0 Envelopes
//!
//! Wire-level message types for the MCP protocol core. Three envelope shapes
//! exist: requests (carry an id and expect a reply), responses (carry the id
//! of the request they answer and exactly one of `result` or `error`), and
//! notifications (no id, no reply).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// JSON-RPC version constant. Every envelope carries this literal.
pub const JSONRPC_VERSION: &str = "2.0";

/// Zero-sized marker that serializes as the literal `"2.0"` and refuses to
/// deserialize anything else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion;

impl Serialize for JsonRpcVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let version = String::deserialize(deserializer)?;
        if version == JSONRPC_VERSION {
            Ok(JsonRpcVersion)
        } else {
            Err(serde::de::Error::custom(format!(
                "Invalid JSON-RPC version: expected '{JSONRPC_VERSION}', got '{version}'"
            )))
        }
    }
}

/// Request identifier.
///
/// Ids allocated by the request manager are always integers, but JSON-RPC
/// permits string ids on the wire, so inbound envelopes may carry either.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id (the only kind the request manager allocates)
    Number(i64),
    /// String id assigned by a remote peer
    String(String),
}

impl RequestId {
    /// Get the numeric value if this is a numeric id.
    pub fn as_number(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(_) => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

/// JSON-RPC request message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version
    pub jsonrpc: JsonRpcVersion,
    /// Request identifier
    pub id: RequestId,
    /// Request method name
    pub method: String,
    /// Request parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new request envelope.
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC notification message (no response expected)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// JSON-RPC version
    pub jsonrpc: JsonRpcVersion,
    /// Notification method name
    pub method: String,
    /// Notification parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a new notification envelope.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            method: method.into(),
            params,
        }
    }
}

/// Response payload - mutual exclusion of `result` and `error` is structural.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    /// Successful response
    Success {
        /// Response result
        result: Value,
    },
    /// Error response
    Error {
        /// Response error
        error: JsonRpcError,
    },
}

/// JSON-RPC response message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version
    pub jsonrpc: JsonRpcVersion,
    /// Id of the request this answers. `None` only for parse errors, where
    /// JSON-RPC requires a literal `null`.
    pub id: Option<RequestId>,
    /// Response payload (exactly one of result or error)
    #[serde(flatten)]
    pub payload: ResponsePayload,
}

impl JsonRpcResponse {
    /// Build a success response for the given request id.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: Some(id),
            payload: ResponsePayload::Success { result },
        }
    }

    /// Build an error response for the given request id.
    pub fn error(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id,
            payload: ResponsePayload::Error { error },
        }
    }

    /// The result value, if this is a success response.
    pub fn result(&self) -> Option<&Value> {
        match &self.payload {
            ResponsePayload::Success { result } => Some(result),
            ResponsePayload::Error { .. } => None,
        }
    }

    /// The error object, if this is an error response.
    pub fn error_object(&self) -> Option<&JsonRpcError> {
        match &self.payload {
            ResponsePayload::Success { .. } => None,
            ResponsePayload::Error { error } => Some(error),
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code
    pub code: i32,
    /// Error message
    pub message: String,
    /// Additional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Create a new error object with no data attachment.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach error data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Well-known MCP method names.
pub mod methods {
    /// Handshake request that opens a session
    pub const INITIALIZE: &str = "initialize";
    /// Liveness probe, valid in any lifecycle state
    pub const PING: &str = "ping";
    /// Client confirmation that completes the handshake
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Intermediate progress for an in-flight request
    pub const PROGRESS: &str = "notifications/progress";
    /// Cancels an in-flight request by id
    pub const CANCELLED: &str = "notifications/cancelled";
    /// Sets the per-session minimum log level
    pub const LOGGING_SET_LEVEL: &str = "logging/setLevel";
    /// List registered tools
    pub const TOOLS_LIST: &str = "tools/list";
    /// Invoke a tool
    pub const TOOLS_CALL: &str = "tools/call";
    /// List registered prompts
    pub const PROMPTS_LIST: &str = "prompts/list";
    /// Fetch one prompt
    pub const PROMPTS_GET: &str = "prompts/get";
    /// List registered resources
    pub const RESOURCES_LIST: &str = "resources/list";
    /// Read one resource by uri
    pub const RESOURCES_READ: &str = "resources/read";
    /// Subscribe to resource updates
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    /// Unsubscribe from resource updates
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
    /// Argument autocompletion
    pub const COMPLETION_COMPLETE: &str = "completion/complete";
    /// Server-initiated user input request
    pub const ELICITATION_CREATE: &str = "elicitation/create";
}
