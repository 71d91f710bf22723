//! # Keel MCP Protocol
//!
//! Protocol core for the Keel MCP runtime: JSON-RPC 2.0 envelopes and codec,
//! the wire error taxonomy, capability types with negotiation, protocol
//! version selection, and the per-session request lifecycle manager.
//!
//! This crate is transport-agnostic and holds no I/O; the session and server
//! crates build on it.

pub mod capabilities;
pub mod codec;
pub mod error;
pub mod jsonrpc;
pub mod requests;
pub mod types;
pub mod version;

pub use capabilities::NegotiatedState;
pub use codec::{Classified, Decoded, decode, encode};
pub use error::{ErrorCode, ErrorReport, ProtocolError, ProtocolResult};
pub use jsonrpc::{
    JSONRPC_VERSION, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    JsonRpcVersion, RequestId, ResponsePayload, methods,
};
pub use requests::{RequestManager, ResponseWaiter};
pub use types::{
    CancelledParams, ClientCapabilities, Implementation, InitializeParams, InitializeResult,
    LogLevel, ProgressParams, Prompt, PromptArgument, Resource, ServerCapabilities, Tool,
};
pub use version::{SUPPORTED_PROTOCOL_VERSIONS, default_supported_versions, negotiate_version};
