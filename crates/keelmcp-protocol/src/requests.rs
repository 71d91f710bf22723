//! Request lifecycle manager.
//!
//! Correlates outbound JSON-RPC requests with their asynchronous responses.
//! Each manager is per-session: ids are monotonically increasing integers
//! starting at 1 and are never reused within the session's lifetime, so
//! eviction cleans everything up deterministically.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};

use crate::error::{ProtocolError, ProtocolResult};
use crate::jsonrpc::{JsonRpcRequest, RequestId};
use crate::types::ProgressParams;

/// One-shot waitable resolved with the request's result or error.
///
/// Dropping the waiter abandons the request locally; a response that arrives
/// afterwards is dropped by the manager without complaint.
#[derive(Debug)]
pub struct ResponseWaiter {
    rx: oneshot::Receiver<ProtocolResult<Value>>,
}

impl ResponseWaiter {
    /// Wait for the response.
    ///
    /// # Errors
    ///
    /// Returns the rejection error, or [`ProtocolError::SessionClosed`] if
    /// the manager was dropped before a response arrived.
    pub async fn wait(self) -> ProtocolResult<Value> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProtocolError::SessionClosed),
        }
    }
}

struct PendingRequest {
    method: String,
    started_at: Instant,
    completion: oneshot::Sender<ProtocolResult<Value>>,
    progress: Option<mpsc::UnboundedSender<ProgressParams>>,
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("method", &self.method)
            .field("started_at", &self.started_at)
            .finish()
    }
}

#[derive(Debug)]
struct ManagerState {
    next_id: i64,
    pending: HashMap<RequestId, PendingRequest>,
}

/// Tracks outstanding outbound requests for one session.
///
/// All mutations go through one short-lived lock; completion notification is
/// a non-blocking oneshot send, so resolution never waits on the waiter.
#[derive(Debug)]
pub struct RequestManager {
    state: Mutex<ManagerState>,
}

impl Default for RequestManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestManager {
    /// Create an empty manager. Ids start at 1.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManagerState {
                next_id: 1,
                pending: HashMap::new(),
            }),
        }
    }

    /// Allocate an id, build the request envelope, and register the pending
    /// entry. The returned envelope carries `params._meta.progressToken`
    /// set to the allocated id so inbound progress can be correlated.
    pub fn create_request(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> (RequestId, JsonRpcRequest, ResponseWaiter) {
        let method = method.into();
        let (tx, rx) = oneshot::channel();

        let mut state = self.state.lock();
        let id = RequestId::Number(state.next_id);
        state.next_id += 1;
        state.pending.insert(
            id.clone(),
            PendingRequest {
                method: method.clone(),
                started_at: Instant::now(),
                completion: tx,
                progress: None,
            },
        );
        drop(state);

        let params = inject_progress_token(params, &id);
        let envelope = JsonRpcRequest::new(id.clone(), method, params);
        (id, envelope, ResponseWaiter { rx })
    }

    /// Register a pending entry for an externally assigned id (used during
    /// the handshake, where the peer picked the id).
    pub fn register_request(
        &self,
        id: RequestId,
        method: impl Into<String>,
    ) -> ResponseWaiter {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        state.pending.insert(
            id,
            PendingRequest {
                method: method.into(),
                started_at: Instant::now(),
                completion: tx,
                progress: None,
            },
        );
        ResponseWaiter { rx }
    }

    /// Attach a progress sink to a pending request. Returns `None` if the
    /// id is unknown (already completed or never created).
    pub fn register_progress(
        &self,
        id: &RequestId,
    ) -> Option<mpsc::UnboundedReceiver<ProgressParams>> {
        let mut state = self.state.lock();
        let pending = state.pending.get_mut(id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        pending.progress = Some(tx);
        Some(rx)
    }

    /// Resolve a pending request with a result payload.
    ///
    /// Returns `false` when the id is unknown, which happens legitimately
    /// if a response arrives after a local cancellation.
    pub fn resolve_request(&self, id: &RequestId, result: Value) -> bool {
        self.complete(id, Ok(result))
    }

    /// Reject a pending request with an error.
    ///
    /// Returns `false` when the id is unknown.
    pub fn reject_request(&self, id: &RequestId, error: ProtocolError) -> bool {
        self.complete(id, Err(error))
    }

    fn complete(&self, id: &RequestId, outcome: ProtocolResult<Value>) -> bool {
        let pending = self.state.lock().pending.remove(id);
        match pending {
            Some(pending) => {
                tracing::trace!(%id, method = %pending.method, "completing request");
                // The waiter may have been dropped; that is not an error.
                let _ = pending.completion.send(outcome);
                true
            }
            None => {
                tracing::warn!(%id, "response for unknown request id, dropping");
                false
            }
        }
    }

    /// Route an inbound progress update to the request it belongs to,
    /// without resolving the pending entry.
    ///
    /// Returns `false` when the token matches no pending request or the
    /// request never registered a sink.
    pub fn on_progress(&self, update: ProgressParams) -> bool {
        let state = self.state.lock();
        let Some(pending) = state.pending.get(&update.progress_token) else {
            return false;
        };
        match &pending.progress {
            Some(sink) => sink.send(update).is_ok(),
            None => false,
        }
    }

    /// How long the request has been in flight, if it is still pending.
    pub fn request_duration(&self, id: &RequestId) -> Option<Duration> {
        let state = self.state.lock();
        state.pending.get(id).map(|p| p.started_at.elapsed())
    }

    /// Number of requests still awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Reject every pending request with clones of the given error.
    pub fn reject_all(&self, error: &ProtocolError) {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            state.pending.drain().collect()
        };
        for (id, pending) in drained {
            tracing::debug!(%id, method = %pending.method, %error, "rejecting pending request");
            let _ = pending.completion.send(Err(error.clone()));
        }
    }

    /// Drop every pending request, rejecting each with `SessionClosed`.
    pub fn clear(&self) {
        self.reject_all(&ProtocolError::SessionClosed);
    }
}

fn inject_progress_token(params: Option<Value>, id: &RequestId) -> Option<Value> {
    let token = serde_json::to_value(id).unwrap_or(Value::Null);
    match params {
        Some(Value::Object(mut obj)) => {
            let meta = obj
                .entry("_meta")
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if let Value::Object(meta) = meta {
                meta.insert("progressToken".to_string(), token);
            }
            Some(Value::Object(obj))
        }
        Some(other) => Some(other),
        None => Some(json!({"_meta": {"progressToken": token}})),
    }
}
