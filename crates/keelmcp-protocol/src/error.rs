//! Protocol error taxonomy.
//!
//! Two layers: [`ErrorCode`] is the wire-level numeric taxonomy, and
//! [`ProtocolError`] is the typed error the core raises internally. Every
//! `ProtocolError` maps onto exactly one wire code; the reverse mapping is
//! lossy (several session-lifecycle conditions share `-32004`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jsonrpc::{JsonRpcError, RequestId};

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Wire-level JSON-RPC error codes used by this core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Body was not valid JSON (-32700)
    ParseError,
    /// Envelope shape violates JSON-RPC 2.0 (-32600)
    InvalidRequest,
    /// Unknown method or capability-gated off (-32601)
    MethodNotFound,
    /// Params fail schema validation (-32602)
    InvalidParams,
    /// Handler threw an unexpected error (-32603)
    InternalError,
    /// Tool execution reported failure (-32000)
    ToolError,
    /// URI did not resolve (-32001)
    ResourceNotFound,
    /// No credentials presented (-32002)
    AuthenticationRequired,
    /// Credentials present but insufficient (-32003)
    AuthorizationFailed,
    /// Session id unknown or expired (-32004)
    SessionInvalid,
    /// Caller exceeded rate policy (-32005)
    RateLimited,
}

impl ErrorCode {
    /// The numeric wire code.
    pub fn code(&self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::ToolError => -32000,
            Self::ResourceNotFound => -32001,
            Self::AuthenticationRequired => -32002,
            Self::AuthorizationFailed => -32003,
            Self::SessionInvalid => -32004,
            Self::RateLimited => -32005,
        }
    }

    /// The standard message for this code.
    pub fn message(&self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid Request",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::InternalError => "Internal error",
            Self::ToolError => "Tool execution failed",
            Self::ResourceNotFound => "Resource not found",
            Self::AuthenticationRequired => "Authentication required",
            Self::AuthorizationFailed => "Authorization failed",
            Self::SessionInvalid => "Session invalid",
            Self::RateLimited => "Rate limited",
        }
    }
}

impl From<ErrorCode> for JsonRpcError {
    fn from(code: ErrorCode) -> Self {
        JsonRpcError::new(code.code(), code.message())
    }
}

/// Typed protocol error raised by the core.
///
/// Variants carry a human-readable detail string that lands in the JSON-RPC
/// `error.data` field; the `error.message` stays the standard text for the
/// code so clients can match on it.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Body was not valid JSON
    #[error("parse error: {0}")]
    Parse(String),

    /// Envelope or request shape violates the protocol
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown method, or the gating capability was not negotiated
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Params failed validation
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Unexpected handler failure
    #[error("internal error: {0}")]
    Internal(String),

    /// Tool execution reported failure
    #[error("tool error: {0}")]
    Tool(String),

    /// Resource URI did not resolve
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// No credentials presented
    #[error("authentication required")]
    AuthenticationRequired,

    /// Credentials present but insufficient
    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),

    /// Session id unknown or expired
    #[error("session invalid: {0}")]
    SessionInvalid(String),

    /// Caller exceeded rate policy
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The session was closed while the request was outstanding
    #[error("session closed")]
    SessionClosed,

    /// The session was evicted for inactivity while the request was outstanding
    #[error("session expired")]
    SessionExpired,
}

impl ProtocolError {
    /// The wire code this error serializes as.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Parse(_) => ErrorCode::ParseError,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::MethodNotFound(_) => ErrorCode::MethodNotFound,
            Self::InvalidParams(_) => ErrorCode::InvalidParams,
            Self::Internal(_) => ErrorCode::InternalError,
            Self::Tool(_) => ErrorCode::ToolError,
            Self::ResourceNotFound(_) => ErrorCode::ResourceNotFound,
            Self::AuthenticationRequired => ErrorCode::AuthenticationRequired,
            Self::AuthorizationFailed(_) => ErrorCode::AuthorizationFailed,
            Self::SessionInvalid(_) | Self::SessionClosed | Self::SessionExpired => {
                ErrorCode::SessionInvalid
            }
            Self::RateLimited(_) => ErrorCode::RateLimited,
        }
    }

    /// Serialize into the wire-level error object.
    ///
    /// The detail string travels in `error.data` so `error.message` stays
    /// the standard text for the code.
    pub fn to_json_rpc(&self) -> JsonRpcError {
        let code = self.code();
        let detail = self.to_string();
        let mut err = JsonRpcError::new(code.code(), code.message());
        if detail != code.message() {
            err = err.with_data(Value::String(detail));
        }
        err
    }

    /// Shorthand for an invalid-request error.
    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::InvalidRequest(detail.into())
    }

    /// Shorthand for an invalid-params error.
    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::InvalidParams(detail.into())
    }

    /// Shorthand for a method-not-found error.
    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::MethodNotFound(method.into())
    }

    /// Shorthand for an internal error.
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal(detail.into())
    }

    /// Recover a typed error from a wire-level error object received from
    /// the peer. Unknown codes map to [`ProtocolError::Internal`].
    pub fn from_wire(err: &JsonRpcError) -> Self {
        let detail = match &err.data {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => err.message.clone(),
        };
        match err.code {
            -32700 => Self::Parse(detail),
            -32600 => Self::InvalidRequest(detail),
            -32601 => Self::MethodNotFound(detail),
            -32602 => Self::InvalidParams(detail),
            -32000 => Self::Tool(detail),
            -32001 => Self::ResourceNotFound(detail),
            -32002 => Self::AuthenticationRequired,
            -32003 => Self::AuthorizationFailed(detail),
            -32004 => Self::SessionInvalid(detail),
            -32005 => Self::RateLimited(detail),
            _ => Self::Internal(detail),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Structured error record surfaced to the server host.
///
/// The client only ever sees standard JSON-RPC errors; the host gets this
/// richer record for its own logging and alerting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Wire-level error code
    pub code: i32,
    /// Human-readable message
    pub message: String,
    /// Optional structured detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Session the error belongs to, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Request the error belongs to, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

impl ErrorReport {
    /// Build a report from a protocol error.
    pub fn from_error(err: &ProtocolError) -> Self {
        let wire = err.to_json_rpc();
        Self {
            code: wire.code,
            message: wire.message,
            data: wire.data,
            session_id: None,
            request_id: None,
        }
    }

    /// Attach the owning session id.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Attach the owning request id.
    #[must_use]
    pub fn with_request(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }
}
