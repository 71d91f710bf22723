//! Core transport traits.

use std::future::Future;
use std::pin::Pin;

use crate::error::TransportResult;
use crate::message::Frame;

/// What a single receive yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// A frame arrived
    Frame(Frame),
    /// The channel disconnected; no more frames will arrive
    Disconnected,
}

/// The duplex frame channel the engine drives.
///
/// Methods return boxed futures so the trait stays object-safe and the
/// engine can hold `Arc<dyn Transport>` regardless of the adapter behind it.
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Deliver one frame to the peer.
    fn send(&self, frame: Frame) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>>;

    /// Wait for the next inbound frame or disconnection.
    fn recv(&self) -> Pin<Box<dyn Future<Output = TransportResult<Received>> + Send + '_>>;

    /// Whether this transport can reconnect to an existing session.
    fn is_resumable(&self) -> bool {
        false
    }

    /// The highest event sequence number the peer acknowledged before
    /// reconnecting. `None` for fresh connections and non-resumable
    /// transports. The engine replays from the next sequence number.
    fn last_received_seq(&self) -> Option<u64> {
        None
    }
}
