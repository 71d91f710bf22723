//! # Keel MCP Server
//!
//! Server core for the Keel MCP runtime: the capability-gated handler
//! registry and the protocol engine that drives the initialize handshake,
//! routes inbound frames, and feeds outbound frames through the session
//! event log to the transport.
//!
//! Transports, storage backends, and application handlers plug in from
//! outside; this crate owns the lifecycle in between.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod registry;

pub use config::EngineConfig;
pub use context::RequestContext;
pub use engine::{ConnectionHandle, NotificationCallback, ProtocolEngine, SessionPhase};
pub use error::{ServerError, ServerResult};
pub use registry::{CapabilityGate, HandlerFuture, HandlerRegistry, MethodHandler};
