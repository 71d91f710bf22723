//! In-memory duplex transport.
//!
//! Two ends of a paired channel, each a full [`Transport`]. Used by the
//! engine's integration tests; adapters for real wire protocols live in
//! their own crates.

use std::future::Future;
use std::pin::Pin;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{TransportError, TransportResult};
use crate::message::Frame;
use crate::traits::{Received, Transport};

/// One end of an in-memory duplex channel.
#[derive(Debug)]
pub struct MemoryTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    resumable: bool,
    last_received_seq: Mutex<Option<u64>>,
}

/// Create a connected pair of in-memory transports.
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport::new(a_tx, b_rx),
        MemoryTransport::new(b_tx, a_rx),
    )
}

impl MemoryTransport {
    fn new(tx: mpsc::UnboundedSender<Frame>, rx: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            resumable: false,
            last_received_seq: Mutex::new(None),
        }
    }

    /// Mark this end as resumable, claiming the given acknowledged sequence
    /// number at reconnection.
    #[must_use]
    pub fn resuming_from(mut self, last_received_seq: u64) -> Self {
        self.resumable = true;
        *self.last_received_seq.get_mut() = Some(last_received_seq);
        self
    }

    /// Mark this end as resumable without a cursor (fresh resumable
    /// connection).
    #[must_use]
    pub fn resumable(mut self) -> Self {
        self.resumable = true;
        self
    }

    /// Close the outbound half; the peer observes a disconnect after
    /// draining buffered frames.
    pub fn close(&self) {
        self.tx.lock().take();
    }
}

impl Transport for MemoryTransport {
    fn send(&self, frame: Frame) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>> {
        let outcome = match self.tx.lock().as_ref() {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| TransportError::ConnectionClosed),
            None => Err(TransportError::ConnectionClosed),
        };
        Box::pin(async move { outcome })
    }

    fn recv(&self) -> Pin<Box<dyn Future<Output = TransportResult<Received>> + Send + '_>> {
        Box::pin(async move {
            let mut rx = self.rx.lock().await;
            match rx.recv().await {
                Some(frame) => Ok(Received::Frame(frame)),
                None => Ok(Received::Disconnected),
            }
        })
    }

    fn is_resumable(&self) -> bool {
        self.resumable
    }

    fn last_received_seq(&self) -> Option<u64> {
        *self.last_received_seq.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_the_pair_in_order() {
        let (a, b) = memory_pair();
        a.send(Frame::from("one")).await.unwrap();
        a.send(Frame::from("two")).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Received::Frame(Frame::from("one")));
        assert_eq!(b.recv().await.unwrap(), Received::Frame(Frame::from("two")));
    }

    #[tokio::test]
    async fn close_disconnects_the_peer() {
        let (a, b) = memory_pair();
        a.send(Frame::from("last")).await.unwrap();
        a.close();
        assert_eq!(b.recv().await.unwrap(), Received::Frame(Frame::from("last")));
        assert_eq!(b.recv().await.unwrap(), Received::Disconnected);
        assert!(a.send(Frame::from("late")).await.is_err());
    }

    #[tokio::test]
    async fn resume_cursor_is_reported() {
        let (a, _b) = memory_pair();
        let a = a.resuming_from(3);
        assert!(a.is_resumable());
        assert_eq!(a.last_received_seq(), Some(3));
    }
}
