//! # Keel MCP Transport
//!
//! The transport contract the protocol engine programs against: an abstract
//! duplex frame channel with optional cursor-based resume. Concrete adapters
//! (stdio, HTTP, WebSocket) live outside the core; this crate ships the
//! traits, the frame/error types, and an in-memory pair for tests.

pub mod error;
pub mod memory;
pub mod message;
pub mod traits;

pub use error::{TransportError, TransportResult};
pub use memory::{MemoryTransport, memory_pair};
pub use message::Frame;
pub use traits::{Received, Transport};
