//! # Keel MCP
//!
//! A Model Context Protocol runtime core: bidirectional JSON-RPC 2.0
//! between client and server over resumable, multiplexed transports, with
//! durable per-session event logs.
//!
//! The workspace splits into focused crates, re-exported here:
//!
//! - [`protocol`] — JSON-RPC envelopes and codec, error taxonomy,
//!   capability negotiation, the request lifecycle manager
//! - [`session`] — append-only event logs with replay, the session store,
//!   storage backends, inactivity GC
//! - [`transport`] — the duplex frame contract with cursor-based resume
//! - [`server`] — the handler registry and the protocol engine
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keelmcp::prelude::*;
//!
//! # async fn example() -> keelmcp::server::ServerResult<()> {
//! let store = SessionStore::new(Arc::new(MemoryBackend::new()), StoreConfig::default());
//! let registry = Arc::new(HandlerRegistry::new());
//! registry.set_tools(vec![Tool::new("echo", "Echoes its arguments")], |_, args, _| {
//!     Box::pin(async move {
//!         Ok(serde_json::json!({"content": [{"type": "text", "text": args.to_string()}]}))
//!     })
//! });
//!
//! let engine = ProtocolEngine::new(store, registry, EngineConfig::default());
//! let (server_end, _client_end) = memory_pair();
//! let connection = engine.serve(Arc::new(server_end));
//! connection.wait_closed().await;
//! # Ok(())
//! # }
//! ```

pub use keelmcp_protocol as protocol;
pub use keelmcp_server as server;
pub use keelmcp_session as session;
pub use keelmcp_transport as transport;

/// The types an application typically touches.
pub mod prelude {
    pub use keelmcp_protocol::{
        ClientCapabilities, Implementation, JsonRpcError, JsonRpcNotification, JsonRpcRequest,
        JsonRpcResponse, LogLevel, NegotiatedState, ProtocolError, ProtocolResult, Prompt,
        RequestId, RequestManager, Resource, ServerCapabilities, Tool,
    };
    pub use keelmcp_server::{
        CapabilityGate, ConnectionHandle, EngineConfig, HandlerRegistry, ProtocolEngine,
        RequestContext, ServerError, ServerResult, SessionPhase,
    };
    pub use keelmcp_session::{
        Direction, Event, EventKind, EventLog, FileBackend, LogDelivery, MemoryBackend,
        SessionHandle, SessionId, SessionStore, StoreConfig, Subscription,
    };
    pub use keelmcp_transport::{Frame, MemoryTransport, Received, Transport, memory_pair};
}
