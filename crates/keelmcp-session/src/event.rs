//! Durable event records.
//!
//! An event captures one protocol frame or lifecycle milestone. Sequence
//! numbers are assigned by the owning log; `stored_at` is stamped by
//! persistent backends at write time and stays absent in volatile stores.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Which way the frame travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Received from the peer
    Inbound,
    /// Sent to the peer
    Outbound,
}

/// What kind of record this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A JSON-RPC request envelope
    Request,
    /// A JSON-RPC response envelope
    Response,
    /// A JSON-RPC notification envelope
    Notification,
    /// A session lifecycle marker (handshake, suspend, close)
    Lifecycle,
}

/// One record in a session's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Per-session sequence number, dense from 1
    pub seq: u64,
    /// When the event occurred (Unix ms)
    pub occurred_at: u64,
    /// When the event was persisted (Unix ms); absent for volatile stores
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stored_at: Option<u64>,
    /// Travel direction
    pub direction: Direction,
    /// Record kind
    pub kind: EventKind,
    /// The JSON-RPC envelope or lifecycle marker
    pub payload: Value,
}
