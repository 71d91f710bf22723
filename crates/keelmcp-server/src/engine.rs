//! Protocol engine: drives the handshake, routes inbound frames, and feeds
//! outbound frames to the transport.
//!
//! ## Connection anatomy
//!
//! Each served connection runs three tasks:
//!
//! - a **reader** draining inbound frames from the transport,
//! - a **writer** serializing all outbound sends to the transport,
//! - a **pump** that subscribes to the session's event log and forwards
//!   outbound wire events to the writer.
//!
//! Every outbound frame is appended to the event log *before* it reaches the
//! transport: the pump only ever emits what the log already holds, so a
//! transport failure after send still allows resume, and reconnecting is
//! nothing more than subscribing the new pump from `last_received_seq + 1`.
//!
//! Handler invocations run concurrently in their own tasks; the log append
//! order (handler-completion order) is the wire order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use keelmcp_protocol::{
    Classified, Decoded, InitializeParams, InitializeResult, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, NegotiatedState, ProtocolError, RequestId, ResponsePayload, ResponseWaiter,
    decode, methods, negotiate_version,
};
use keelmcp_session::{
    Direction, EventKind, LogDelivery, SessionHandle, SessionId, SessionStore, Subscription,
};
use keelmcp_transport::{Frame, Received, Transport};

use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::error::{ServerError, ServerResult};
use crate::registry::HandlerRegistry;

/// Outbound queue depth between the pump and the writer.
const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Lifecycle state of one connection's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No initialize received yet
    New,
    /// Initialize received, response not yet sent
    Initializing,
    /// Initialize answered, waiting for `notifications/initialized`
    AwaitingInitialized,
    /// Fully operational
    Ready,
    /// Transport dropped; event log buffering for a resume
    Suspended,
    /// Terminal
    Closed,
}

/// Application callback for notifications the engine does not special-case.
pub type NotificationCallback = Arc<dyn Fn(Arc<SessionHandle>, JsonRpcNotification) + Send + Sync>;

/// Engine-side state for one session that outlives any single connection.
#[derive(Debug, Default)]
struct SessionRuntime {
    /// Abort tokens for in-flight inbound requests
    inflight: Mutex<HashMap<RequestId, CancellationToken>>,
    /// Cancels the pending resume deadline, if the session is suspended
    resume_deadline: Mutex<Option<CancellationToken>>,
}

struct EngineInner {
    store: Arc<SessionStore>,
    registry: Arc<HandlerRegistry>,
    config: EngineConfig,
    runtimes: DashMap<SessionId, Arc<SessionRuntime>>,
    notification_callback: RwLock<Option<NotificationCallback>>,
}

impl EngineInner {
    fn runtime(&self, id: &SessionId) -> Arc<SessionRuntime> {
        Arc::clone(
            &self
                .runtimes
                .entry(id.clone())
                .or_insert_with(|| Arc::new(SessionRuntime::default())),
        )
    }

    /// Tear down a session: fire every in-flight abort, cancel any resume
    /// deadline, and evict from the store (which rejects pending requests
    /// and closes subscribers).
    async fn close_session(&self, id: &SessionId) {
        if let Some((_, runtime)) = self.runtimes.remove(id) {
            for (_, token) in runtime.inflight.lock().drain() {
                token.cancel();
            }
            if let Some(token) = runtime.resume_deadline.lock().take() {
                token.cancel();
            }
        }
        self.store.evict(id).await;
    }

    /// Drop engine runtime state for sessions the store GC already evicted,
    /// firing their abort signals.
    fn reap_runtimes(&self, evicted: &[SessionId]) {
        for id in evicted {
            if let Some((_, runtime)) = self.runtimes.remove(id) {
                for (_, token) in runtime.inflight.lock().drain() {
                    token.cancel();
                }
                if let Some(token) = runtime.resume_deadline.lock().take() {
                    token.cancel();
                }
            }
        }
    }
}

impl std::fmt::Debug for EngineInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("sessions", &self.runtimes.len())
            .finish_non_exhaustive()
    }
}

struct ConnState {
    transport: Arc<dyn Transport>,
    outbound_tx: mpsc::Sender<Frame>,
    session: RwLock<Option<Arc<SessionHandle>>>,
    phase: Mutex<SessionPhase>,
    closed: CancellationToken,
    disconnect_handled: AtomicBool,
}

impl ConnState {
    fn session(&self) -> Option<Arc<SessionHandle>> {
        self.session.read().clone()
    }

    fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }
}

/// The protocol engine. Cheap to clone; all clones share state.
#[derive(Clone, Debug)]
pub struct ProtocolEngine {
    inner: Arc<EngineInner>,
}

impl ProtocolEngine {
    /// Create an engine over a session store and handler registry.
    pub fn new(
        store: Arc<SessionStore>,
        registry: Arc<HandlerRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                registry,
                config,
                runtimes: DashMap::new(),
                notification_callback: RwLock::new(None),
            }),
        }
    }

    /// Install the callback for notifications without engine semantics.
    pub fn on_notification(&self, callback: NotificationCallback) {
        *self.inner.notification_callback.write() = Some(callback);
    }

    /// Drive a fresh connection. The session is created when the client's
    /// `initialize` arrives.
    pub fn serve(&self, transport: Arc<dyn Transport>) -> ConnectionHandle {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let conn = Arc::new(ConnState {
            transport,
            outbound_tx,
            session: RwLock::new(None),
            phase: Mutex::new(SessionPhase::New),
            closed: CancellationToken::new(),
            disconnect_handled: AtomicBool::new(false),
        });
        tokio::spawn(writer_task(
            Arc::clone(&self.inner),
            Arc::clone(&conn),
            outbound_rx,
        ));
        tokio::spawn(reader_task(Arc::clone(&self.inner), Arc::clone(&conn)));
        ConnectionHandle {
            inner: Arc::clone(&self.inner),
            conn,
        }
    }

    /// Reconnect a suspended session. Missed outbound events are re-emitted
    /// from the transport's acknowledged cursor; a cursor older than
    /// retention closes the session as unresumable.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::SessionInvalid`] (wrapped) when the session
    /// id is unknown or already evicted.
    pub async fn resume(
        &self,
        id: &SessionId,
        transport: Arc<dyn Transport>,
    ) -> ServerResult<ConnectionHandle> {
        let handle = self.inner.store.get(id).await.ok_or_else(|| {
            ServerError::Protocol(ProtocolError::SessionInvalid(id.to_string()))
        })?;

        let runtime = self.inner.runtime(id);
        if let Some(token) = runtime.resume_deadline.lock().take() {
            token.cancel();
        }

        let from_seq = transport.last_received_seq().unwrap_or(0) + 1;
        let subscription = handle.subscribe(from_seq);

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let conn = Arc::new(ConnState {
            transport,
            outbound_tx,
            session: RwLock::new(Some(Arc::clone(&handle))),
            phase: Mutex::new(SessionPhase::Ready),
            closed: CancellationToken::new(),
            disconnect_handled: AtomicBool::new(false),
        });

        append_lifecycle(&self.inner, &handle, "resumed").await;
        tokio::spawn(writer_task(
            Arc::clone(&self.inner),
            Arc::clone(&conn),
            outbound_rx,
        ));
        tokio::spawn(pump_task(
            Arc::clone(&self.inner),
            Arc::clone(&conn),
            subscription,
        ));
        tokio::spawn(reader_task(Arc::clone(&self.inner), Arc::clone(&conn)));

        tracing::info!(session = %id, from_seq, "session resumed");
        Ok(ConnectionHandle {
            inner: Arc::clone(&self.inner),
            conn,
        })
    }

    /// Spawn the store's GC and poll loops, wrapped so evictions also fire
    /// the engine's abort signals.
    pub fn spawn_background(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let inner = Arc::clone(&self.inner);
        let gc = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(
                inner.store.config().gc_interval_ms,
            ));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if inner.store.is_closed() {
                    break;
                }
                let evicted = inner.store.gc_tick(keelmcp_session::now_ms()).await;
                inner.reap_runtimes(&evicted);
            }
        });
        let poll = self.inner.store.spawn_poll();
        vec![gc, poll]
    }

    /// Run one GC pass at the given clock, firing abort signals for
    /// everything evicted. Exposed for hosts driving their own schedule.
    pub async fn gc_tick(&self, now_ms: u64) -> Vec<SessionId> {
        let evicted = self.inner.store.gc_tick(now_ms).await;
        self.inner.reap_runtimes(&evicted);
        evicted
    }

    /// Drain the engine: close every session and shut the store down.
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self
            .inner
            .runtimes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            self.inner.close_session(&id).await;
        }
        self.inner.store.shutdown();
    }
}

/// Host-side handle to one served connection.
pub struct ConnectionHandle {
    inner: Arc<EngineInner>,
    conn: Arc<ConnState>,
}

impl ConnectionHandle {
    /// Current lifecycle phase.
    pub fn phase(&self) -> SessionPhase {
        self.conn.phase()
    }

    /// The session, once `initialize` has created it.
    pub fn session(&self) -> Option<Arc<SessionHandle>> {
        self.conn.session()
    }

    /// The session id, once `initialize` has created it.
    pub fn session_id(&self) -> Option<SessionId> {
        self.conn.session().map(|s| s.id().clone())
    }

    /// Issue a server→client request. The envelope is appended to the event
    /// log (and thus replayable) before it reaches the wire. Returns the
    /// allocated id (usable for a progress sink) and the completion waiter.
    ///
    /// # Errors
    ///
    /// Fails before the handshake completes, or when persistence fails.
    pub async fn request(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> ServerResult<(RequestId, ResponseWaiter)> {
        let handle = self
            .conn
            .session()
            .ok_or_else(|| ServerError::lifecycle("connection has no session yet"))?;
        let (id, envelope, waiter) = handle.requests().create_request(method, params);
        let payload = serde_json::to_value(&envelope)
            .map_err(|e| ServerError::Protocol(ProtocolError::internal(e.to_string())))?;
        self.inner
            .store
            .append_to(&handle, Direction::Outbound, EventKind::Request, payload)
            .await?;
        Ok((id, waiter))
    }

    /// Issue an `elicitation/create` request, gated on the client having
    /// advertised the elicitation capability.
    ///
    /// # Errors
    ///
    /// Returns `MethodNotFound` (wrapped) when the capability was not
    /// negotiated.
    pub async fn elicit(&self, params: Value) -> ServerResult<(RequestId, ResponseWaiter)> {
        let handle = self
            .conn
            .session()
            .ok_or_else(|| ServerError::lifecycle("connection has no session yet"))?;
        let negotiated = handle
            .negotiated()
            .ok_or_else(|| ServerError::lifecycle("handshake not complete"))?;
        if !negotiated.has_elicitation() {
            return Err(ServerError::Protocol(ProtocolError::method_not_found(
                methods::ELICITATION_CREATE,
            )));
        }
        self.request(methods::ELICITATION_CREATE, Some(params)).await
    }

    /// Send a server→client notification through the event log.
    ///
    /// # Errors
    ///
    /// Fails before the handshake completes, or when persistence fails.
    pub async fn notify(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> ServerResult<u64> {
        let handle = self
            .conn
            .session()
            .ok_or_else(|| ServerError::lifecycle("connection has no session yet"))?;
        let envelope = JsonRpcNotification::new(method, params);
        let payload = serde_json::to_value(&envelope)
            .map_err(|e| ServerError::Protocol(ProtocolError::internal(e.to_string())))?;
        let seq = self
            .inner
            .store
            .append_to(&handle, Direction::Outbound, EventKind::Notification, payload)
            .await?;
        Ok(seq)
    }

    /// Close the connection and its session.
    pub async fn close(&self) {
        *self.conn.phase.lock() = SessionPhase::Closed;
        self.conn.disconnect_handled.store(true, Ordering::Release);
        self.conn.closed.cancel();
        if let Some(handle) = self.conn.session() {
            self.inner.close_session(handle.id()).await;
        }
    }

    /// Wait until the connection terminates.
    pub async fn wait_closed(&self) {
        self.conn.closed.cancelled().await;
    }
}

// ============================================================================
// Connection tasks
// ============================================================================

async fn reader_task(inner: Arc<EngineInner>, conn: Arc<ConnState>) {
    tracing::debug!("connection reader started");
    loop {
        tokio::select! {
            () = conn.closed.cancelled() => break,
            received = conn.transport.recv() => match received {
                Ok(Received::Frame(frame)) => {
                    handle_frame(&inner, &conn, &frame.payload).await;
                }
                Ok(Received::Disconnected) => {
                    handle_disconnect(&inner, &conn).await;
                    break;
                }
                Err(err) => {
                    tracing::warn!(%err, "transport receive error");
                    handle_disconnect(&inner, &conn).await;
                    break;
                }
            }
        }
    }
    tracing::debug!("connection reader stopped");
}

async fn writer_task(
    inner: Arc<EngineInner>,
    conn: Arc<ConnState>,
    mut outbound_rx: mpsc::Receiver<Frame>,
) {
    loop {
        tokio::select! {
            () = conn.closed.cancelled() => break,
            maybe = outbound_rx.recv() => match maybe {
                Some(frame) => {
                    if let Err(err) = conn.transport.send(frame).await {
                        tracing::warn!(%err, "transport send failed");
                        handle_disconnect(&inner, &conn).await;
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

/// Forwards the session's outbound wire events to the writer, in log order.
async fn pump_task(inner: Arc<EngineInner>, conn: Arc<ConnState>, mut subscription: Subscription) {
    loop {
        tokio::select! {
            () = conn.closed.cancelled() => break,
            delivery = subscription.recv() => match delivery {
                Some(LogDelivery::Event(event)) => {
                    if event.direction != Direction::Outbound
                        || event.kind == EventKind::Lifecycle
                    {
                        continue;
                    }
                    let bytes = match serde_json::to_vec(&event.payload) {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            tracing::error!(%err, seq = event.seq, "unencodable outbound event");
                            continue;
                        }
                    };
                    if conn.outbound_tx.send(Frame::from(bytes)).await.is_err() {
                        break;
                    }
                }
                Some(LogDelivery::Gap { requested, earliest_retained }) => {
                    tracing::error!(
                        requested,
                        earliest_retained,
                        "resume cursor predates retention, session unresumable"
                    );
                    *conn.phase.lock() = SessionPhase::Closed;
                    conn.disconnect_handled.store(true, Ordering::Release);
                    conn.closed.cancel();
                    if let Some(handle) = conn.session() {
                        inner.close_session(handle.id()).await;
                    }
                    break;
                }
                // The log closed underneath us: the session was evicted.
                None => {
                    *conn.phase.lock() = SessionPhase::Closed;
                    conn.closed.cancel();
                    break;
                }
            }
        }
    }
}

async fn handle_disconnect(inner: &Arc<EngineInner>, conn: &Arc<ConnState>) {
    if conn.disconnect_handled.swap(true, Ordering::AcqRel) {
        return;
    }
    let session = conn.session();
    match session {
        Some(handle) if conn.transport.is_resumable() => {
            *conn.phase.lock() = SessionPhase::Suspended;
            conn.closed.cancel();
            append_lifecycle(inner, &handle, "suspended").await;
            schedule_resume_deadline(inner, handle.id().clone());
            tracing::info!(session = %handle.id(), "transport dropped, session suspended");
        }
        Some(handle) => {
            *conn.phase.lock() = SessionPhase::Closed;
            conn.closed.cancel();
            inner.close_session(handle.id()).await;
            tracing::info!(session = %handle.id(), "transport closed, session closed");
        }
        None => {
            *conn.phase.lock() = SessionPhase::Closed;
            conn.closed.cancel();
        }
    }
}

/// If no reconnect lands within the resume window, the session closes.
fn schedule_resume_deadline(inner: &Arc<EngineInner>, id: SessionId) {
    let runtime = inner.runtime(&id);
    let token = CancellationToken::new();
    *runtime.resume_deadline.lock() = Some(token.clone());

    let inner = Arc::clone(inner);
    let deadline = Duration::from_millis(inner.config.resume_timeout_ms);
    tokio::spawn(async move {
        tokio::select! {
            () = token.cancelled() => {}
            () = tokio::time::sleep(deadline) => {
                tracing::info!(session = %id, "resume deadline passed, closing session");
                inner.close_session(&id).await;
            }
        }
    });
}

// ============================================================================
// Inbound dispatch
// ============================================================================

async fn handle_frame(inner: &Arc<EngineInner>, conn: &Arc<ConnState>, bytes: &[u8]) {
    match decode(bytes) {
        Ok(Decoded::Single(classified)) => handle_classified(inner, conn, classified).await,
        Ok(Decoded::Batch(items)) => {
            for classified in items {
                handle_classified(inner, conn, classified).await;
            }
        }
        // No id is recoverable from an undecodable frame; log and drop.
        Err(err) => {
            tracing::warn!(%err, "dropping undecodable inbound frame");
        }
    }
}

async fn handle_classified(inner: &Arc<EngineInner>, conn: &Arc<ConnState>, classified: Classified) {
    match classified {
        Classified::Request(request) => handle_request(inner, conn, request).await,
        Classified::Response(response) => handle_response(inner, conn, response).await,
        Classified::Notification(notification) => {
            handle_notification(inner, conn, notification).await;
        }
        Classified::Invalid(error) => {
            tracing::warn!(code = error.code, "dropping malformed batch element");
        }
    }
}

async fn handle_request(inner: &Arc<EngineInner>, conn: &Arc<ConnState>, request: JsonRpcRequest) {
    if request.method == methods::INITIALIZE {
        handle_initialize(inner, conn, request).await;
        return;
    }

    // Ping is answered in every lifecycle state.
    if request.method == methods::PING {
        let response = JsonRpcResponse::success(request.id.clone(), json!({}));
        match conn.session() {
            Some(handle) => {
                record_inbound(inner, &handle, EventKind::Request, &request).await;
                respond(inner, conn, Some(&handle), response).await;
            }
            None => respond(inner, conn, None, response).await,
        }
        return;
    }

    if conn.phase() != SessionPhase::Ready {
        tracing::debug!(method = %request.method, "request before session ready");
        let response = JsonRpcResponse::error(
            Some(request.id.clone()),
            ProtocolError::invalid_request(format!(
                "method not accepted before initialization: {}",
                request.method
            ))
            .to_json_rpc(),
        );
        let session = conn.session();
        respond(inner, conn, session.as_ref(), response).await;
        return;
    }

    let Some(handle) = conn.session() else {
        tracing::error!("ready connection without session");
        return;
    };
    record_inbound(inner, &handle, EventKind::Request, &request).await;

    let runtime = inner.runtime(handle.id());
    let abort = CancellationToken::new();
    runtime
        .inflight
        .lock()
        .insert(request.id.clone(), abort.clone());

    let ctx = RequestContext::new(Arc::clone(&handle), abort.clone(), Some(request.id.clone()));
    let inner = Arc::clone(inner);
    let JsonRpcRequest {
        id, method, params, ..
    } = request;

    tokio::spawn(async move {
        tracing::debug!(%id, %method, "dispatching request");
        let result = inner.registry.dispatch(&method, params, ctx).await;

        if let Some(runtime) = inner.runtimes.get(handle.id()) {
            runtime.inflight.lock().remove(&id);
        }
        if abort.is_cancelled() {
            tracing::debug!(%id, %method, "discarding result of cancelled request");
            return;
        }

        let response = match result {
            Ok(value) => JsonRpcResponse::success(id.clone(), value),
            Err(err) => JsonRpcResponse::error(Some(id.clone()), err.to_json_rpc()),
        };
        if let Err(err) = append_response(&inner, &handle, &response).await {
            tracing::error!(%id, %err, "failed to append response, closing session");
            inner.close_session(handle.id()).await;
        }
    });
}

async fn handle_response(
    inner: &Arc<EngineInner>,
    conn: &Arc<ConnState>,
    response: JsonRpcResponse,
) {
    let Some(handle) = conn.session() else {
        tracing::warn!("response on connection without session, dropping");
        return;
    };
    record_inbound(inner, &handle, EventKind::Response, &response).await;

    let Some(id) = response.id.clone() else {
        tracing::warn!("response with null id, dropping");
        return;
    };
    match response.payload {
        ResponsePayload::Success { result } => {
            handle.requests().resolve_request(&id, result);
        }
        ResponsePayload::Error { error } => {
            handle
                .requests()
                .reject_request(&id, ProtocolError::from_wire(&error));
        }
    }
}

async fn handle_notification(
    inner: &Arc<EngineInner>,
    conn: &Arc<ConnState>,
    notification: JsonRpcNotification,
) {
    let session = conn.session();
    if let Some(handle) = &session {
        record_inbound(inner, handle, EventKind::Notification, &notification).await;
    }

    match notification.method.as_str() {
        methods::INITIALIZED => {
            let transitioned = {
                let mut phase = conn.phase.lock();
                if *phase == SessionPhase::AwaitingInitialized {
                    *phase = SessionPhase::Ready;
                    true
                } else {
                    false
                }
            };
            if transitioned {
                if let Some(handle) = &session {
                    append_lifecycle(inner, handle, "ready").await;
                    tracing::info!(session = %handle.id(), "session ready");
                }
            } else {
                tracing::warn!("unexpected notifications/initialized, ignoring");
            }
        }
        methods::PROGRESS => {
            let Some(handle) = &session else { return };
            match notification
                .params
                .clone()
                .map(serde_json::from_value)
                .transpose()
            {
                Ok(Some(params)) => {
                    handle.requests().on_progress(params);
                }
                Ok(None) | Err(_) => {
                    tracing::warn!("malformed progress notification, dropping");
                }
            }
        }
        methods::CANCELLED => {
            let Some(handle) = &session else { return };
            let parsed: Option<keelmcp_protocol::CancelledParams> = notification
                .params
                .clone()
                .and_then(|p| serde_json::from_value(p).ok());
            let Some(params) = parsed else {
                tracing::warn!("malformed cancelled notification, dropping");
                return;
            };
            let runtime = inner.runtime(handle.id());
            let token = runtime.inflight.lock().get(&params.request_id).cloned();
            match token {
                Some(token) => {
                    tracing::debug!(id = %params.request_id, "cancelling in-flight request");
                    token.cancel();
                }
                None => {
                    tracing::debug!(id = %params.request_id, "cancel for unknown request");
                }
            }
        }
        _ => {
            let callback = inner.notification_callback.read().clone();
            if let (Some(callback), Some(handle)) = (callback, session) {
                callback(handle, notification);
            }
        }
    }
}

async fn handle_initialize(
    inner: &Arc<EngineInner>,
    conn: &Arc<ConnState>,
    request: JsonRpcRequest,
) {
    let accepted = {
        let mut phase = conn.phase.lock();
        if *phase == SessionPhase::New {
            *phase = SessionPhase::Initializing;
            true
        } else {
            false
        }
    };
    if !accepted {
        let response = JsonRpcResponse::error(
            Some(request.id.clone()),
            ProtocolError::invalid_request("initialize out of order").to_json_rpc(),
        );
        let session = conn.session();
        respond(inner, conn, session.as_ref(), response).await;
        return;
    }

    let params: InitializeParams = match request
        .params
        .clone()
        .ok_or_else(|| ProtocolError::invalid_params("missing initialize params"))
        .and_then(|p| {
            serde_json::from_value(p).map_err(|e| ProtocolError::invalid_params(e.to_string()))
        }) {
        Ok(params) => params,
        Err(err) => {
            *conn.phase.lock() = SessionPhase::New;
            let response =
                JsonRpcResponse::error(Some(request.id.clone()), err.to_json_rpc());
            respond(inner, conn, None, response).await;
            return;
        }
    };

    let handle = match inner.store.create().await {
        Ok(handle) => handle,
        Err(err) => {
            *conn.phase.lock() = SessionPhase::New;
            tracing::error!(%err, "session creation failed");
            let response = JsonRpcResponse::error(
                Some(request.id.clone()),
                ProtocolError::internal("session creation failed").to_json_rpc(),
            );
            respond(inner, conn, None, response).await;
            return;
        }
    };

    let protocol_version =
        negotiate_version(&inner.config.supported_versions, &params.protocol_version);
    let advertised = inner.registry.server_capabilities();
    let negotiated = NegotiatedState::negotiate(
        protocol_version.clone(),
        params.capabilities,
        advertised.clone(),
        params.client_info,
        inner.config.server_info.clone(),
    );
    handle.set_negotiated(negotiated);

    *conn.session.write() = Some(Arc::clone(&handle));
    inner.runtime(handle.id());
    tokio::spawn(pump_task(
        Arc::clone(inner),
        Arc::clone(conn),
        handle.subscribe(1),
    ));

    record_inbound(inner, &handle, EventKind::Request, &request).await;

    let result = InitializeResult {
        protocol_version,
        capabilities: advertised,
        server_info: inner.config.server_info.clone(),
        instructions: inner.config.instructions.clone(),
    };
    let response = match serde_json::to_value(&result) {
        Ok(value) => JsonRpcResponse::success(request.id.clone(), value),
        Err(err) => JsonRpcResponse::error(
            Some(request.id.clone()),
            ProtocolError::internal(err.to_string()).to_json_rpc(),
        ),
    };
    respond(inner, conn, Some(&handle), response).await;
    *conn.phase.lock() = SessionPhase::AwaitingInitialized;
    tracing::info!(session = %handle.id(), "handshake answered, awaiting initialized");
}

// ============================================================================
// Outbound helpers
// ============================================================================

/// Record an inbound frame in the session's event log.
async fn record_inbound<T: serde::Serialize>(
    inner: &Arc<EngineInner>,
    handle: &Arc<SessionHandle>,
    kind: EventKind,
    envelope: &T,
) {
    let Ok(payload) = serde_json::to_value(envelope) else {
        return;
    };
    if let Err(err) = inner
        .store
        .append_to(handle, Direction::Inbound, kind, payload)
        .await
    {
        tracing::error!(%err, "failed to record inbound event");
    }
}

/// Append a lifecycle marker. Markers share the log's sequence space but
/// never reach the wire.
async fn append_lifecycle(inner: &Arc<EngineInner>, handle: &Arc<SessionHandle>, marker: &str) {
    if let Err(err) = inner
        .store
        .append_to(
            handle,
            Direction::Outbound,
            EventKind::Lifecycle,
            json!({"lifecycle": marker}),
        )
        .await
    {
        tracing::warn!(%err, marker, "failed to append lifecycle marker");
    }
}

async fn append_response(
    inner: &Arc<EngineInner>,
    handle: &Arc<SessionHandle>,
    response: &JsonRpcResponse,
) -> ServerResult<u64> {
    let payload = serde_json::to_value(response)
        .map_err(|e| ServerError::Protocol(ProtocolError::internal(e.to_string())))?;
    let seq = inner
        .store
        .append_to(handle, Direction::Outbound, EventKind::Response, payload)
        .await?;
    Ok(seq)
}

/// Send a response: through the event log when a session exists (the pump
/// forwards it), directly to the transport before the handshake.
async fn respond(
    inner: &Arc<EngineInner>,
    conn: &Arc<ConnState>,
    session: Option<&Arc<SessionHandle>>,
    response: JsonRpcResponse,
) {
    match session {
        Some(handle) => {
            if let Err(err) = append_response(inner, handle, &response).await {
                tracing::error!(%err, "failed to append response, closing session");
                inner.close_session(handle.id()).await;
            }
        }
        None => match serde_json::to_vec(&response) {
            Ok(bytes) => {
                let _ = conn.outbound_tx.send(Frame::from(bytes)).await;
            }
            Err(err) => tracing::error!(%err, "unencodable response"),
        },
    }
}
