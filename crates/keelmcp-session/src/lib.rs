//! # Keel MCP Session
//!
//! Durable session state for the Keel MCP runtime: per-session append-only
//! event logs with live subscribers and replay, a mutex-guarded session
//! store over pluggable persistence backends, inactivity-based garbage
//! collection, and poll-based change detection for shared backends.
//!
//! Ordering is guaranteed only *within* one session's event log; the store
//! makes no promises across sessions.

pub mod backend;
pub mod error;
pub mod event;
pub mod id;
pub mod log;
pub mod store;

pub use backend::{FileBackend, MemoryBackend, SessionRecord, StorageBackend};
pub use error::{SessionError, SessionResult};
pub use event::{Direction, Event, EventKind, now_ms};
pub use id::{SESSION_ID_LEN, SessionId};
pub use log::{EventLog, LogDelivery, SUBSCRIBER_QUEUE_DEPTH, Subscription};
pub use store::{SessionHandle, SessionStore, StoreConfig};
