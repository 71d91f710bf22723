//! Session store: owns every live session, persists through a backend, and
//! runs the inactivity GC and change-detection polling.
//!
//! The store is the only global mutable state in the runtime. Its lifecycle
//! is `open(backend, config)` → serve → `shutdown()`; shutdown rejects all
//! pending requests and closes every subscriber stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::Notify;

use keelmcp_protocol::{LogLevel, NegotiatedState, ProtocolError, RequestManager};

use crate::backend::{SessionRecord, StorageBackend};
use crate::error::{SessionError, SessionResult};
use crate::event::{Direction, EventKind, now_ms};
use crate::id::SessionId;
use crate::log::{EventLog, Subscription};

/// Store timing configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Sessions idle longer than this are evicted
    pub inactivity_timeout_ms: u64,
    /// Events stay replayable at least this long past their occurrence
    pub resume_timeout_ms: u64,
    /// Backend polling cadence for externally appended events
    pub pull_interval_ms: u64,
    /// How often the GC task runs
    pub gc_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_ms: 300_000,
            resume_timeout_ms: 30_000,
            pull_interval_ms: 1_000,
            gc_interval_ms: 30_000,
        }
    }
}

impl StoreConfig {
    /// Override the inactivity timeout.
    #[must_use]
    pub fn with_inactivity_timeout_ms(mut self, ms: u64) -> Self {
        self.inactivity_timeout_ms = ms;
        self
    }

    /// Override the resume window.
    #[must_use]
    pub fn with_resume_timeout_ms(mut self, ms: u64) -> Self {
        self.resume_timeout_ms = ms;
        self
    }

    /// Override the polling cadence.
    #[must_use]
    pub fn with_pull_interval_ms(mut self, ms: u64) -> Self {
        self.pull_interval_ms = ms;
        self
    }
}

/// One live session.
///
/// The handle owns the event log and the pending-request map, so evicting
/// the session deterministically cleans up both.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    created_at: u64,
    last_activity: AtomicU64,
    negotiated: RwLock<Option<NegotiatedState>>,
    min_log_level: RwLock<Option<LogLevel>>,
    log: EventLog,
    requests: RequestManager,
    /// Serializes prepare/persist/commit so appends stay dense and durable
    /// before subscribers hear about them.
    append_lock: tokio::sync::Mutex<()>,
}

impl SessionHandle {
    fn new(id: SessionId, created_at: u64) -> Self {
        Self {
            id,
            created_at,
            last_activity: AtomicU64::new(created_at),
            negotiated: RwLock::new(None),
            min_log_level: RwLock::new(None),
            log: EventLog::new(),
            requests: RequestManager::new(),
            append_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn from_record(record: SessionRecord) -> Self {
        let last_activity = record
            .events
            .last()
            .map_or(record.created_at, |e| record.created_at.max(e.occurred_at));
        Self {
            id: record.id,
            created_at: record.created_at,
            last_activity: AtomicU64::new(last_activity),
            negotiated: RwLock::new(record.negotiated),
            min_log_level: RwLock::new(None),
            log: EventLog::from_events(record.events),
            requests: RequestManager::new(),
            append_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Creation time (Unix ms).
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Last activity time (Unix ms).
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Acquire)
    }

    /// Bump the activity clock without appending.
    pub fn touch(&self, now_ms: u64) {
        self.last_activity.fetch_max(now_ms, Ordering::AcqRel);
    }

    /// Whether the session has been idle past the timeout.
    pub fn is_expired(&self, now_ms: u64, timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_activity()) > timeout_ms
    }

    /// The frozen handshake outcome, if the handshake completed.
    pub fn negotiated(&self) -> Option<NegotiatedState> {
        self.negotiated.read().clone()
    }

    /// Freeze the handshake outcome.
    pub fn set_negotiated(&self, state: NegotiatedState) {
        *self.negotiated.write() = Some(state);
    }

    /// Per-session minimum log level set via `logging/setLevel`.
    pub fn min_log_level(&self) -> Option<LogLevel> {
        *self.min_log_level.read()
    }

    /// Update the per-session minimum log level.
    pub fn set_min_log_level(&self, level: LogLevel) {
        *self.min_log_level.write() = Some(level);
    }

    /// The session's event log.
    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// The session's pending-request map.
    pub fn requests(&self) -> &RequestManager {
        &self.requests
    }

    /// Subscribe to the event log from a sequence number.
    pub fn subscribe(&self, from_seq: u64) -> Subscription {
        self.log.subscribe(from_seq)
    }

    fn to_record(&self) -> SessionRecord {
        SessionRecord {
            id: self.id.clone(),
            created_at: self.created_at,
            negotiated: self.negotiated(),
            events: self.log.events(),
        }
    }
}

/// Shared, mutex-guarded map of live sessions plus the persistence backend.
#[derive(Debug)]
pub struct SessionStore {
    backend: Arc<dyn StorageBackend>,
    sessions: Mutex<HashMap<SessionId, Arc<SessionHandle>>>,
    config: StoreConfig,
    closed: AtomicBool,
    shutdown: Notify,
}

impl SessionStore {
    /// Create a store over a backend without touching persisted state.
    pub fn new(backend: Arc<dyn StorageBackend>, config: StoreConfig) -> Arc<Self> {
        Arc::new(Self {
            backend,
            sessions: Mutex::new(HashMap::new()),
            config,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    /// Create a store and hydrate every persisted session into memory.
    ///
    /// # Errors
    ///
    /// Returns the backend error if persisted state cannot be enumerated.
    pub async fn open(
        backend: Arc<dyn StorageBackend>,
        config: StoreConfig,
    ) -> SessionResult<Arc<Self>> {
        let store = Self::new(backend, config);
        let records = store.backend.load_all().await?;
        let mut sessions = store.sessions.lock();
        for record in records {
            let handle = Arc::new(SessionHandle::from_record(record));
            sessions.insert(handle.id().clone(), handle);
        }
        drop(sessions);
        Ok(store)
    }

    /// The store's timing configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Allocate a fresh session, persist its empty record, return the handle.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the empty record cannot be persisted.
    pub async fn create(&self) -> SessionResult<Arc<SessionHandle>> {
        let handle = Arc::new(SessionHandle::new(SessionId::generate(), now_ms()));
        self.backend.save_one(handle.to_record()).await?;
        self.sessions
            .lock()
            .insert(handle.id().clone(), Arc::clone(&handle));
        tracing::debug!(session = %handle.id(), "session created");
        Ok(handle)
    }

    /// Look up a live session, falling back to the backend for sessions
    /// another process created. `None` if unknown or evicted.
    pub async fn get(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        if let Some(handle) = self.sessions.lock().get(id) {
            return Some(Arc::clone(handle));
        }
        match self.backend.load_one(id).await {
            Ok(Some(record)) => {
                let handle = Arc::new(SessionHandle::from_record(record));
                let mut sessions = self.sessions.lock();
                // Another task may have hydrated concurrently; keep theirs.
                let entry = sessions
                    .entry(id.clone())
                    .or_insert_with(|| Arc::clone(&handle));
                Some(Arc::clone(entry))
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(session = %id, %err, "backend lookup failed");
                None
            }
        }
    }

    /// Append one event to a session's log, durably.
    ///
    /// The event is persisted before subscribers are notified; a persistence
    /// failure is fatal for the session, which is evicted on the spot.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnknownSession`] for unknown ids and
    /// [`SessionError::Storage`] (after evicting) when persistence fails.
    pub async fn append(
        &self,
        id: &SessionId,
        direction: Direction,
        kind: EventKind,
        payload: Value,
    ) -> SessionResult<u64> {
        let handle = self
            .get(id)
            .await
            .ok_or_else(|| SessionError::UnknownSession(id.clone()))?;
        self.append_to(&handle, direction, kind, payload).await
    }

    /// Append through an already-resolved handle.
    ///
    /// # Errors
    ///
    /// Same as [`SessionStore::append`].
    pub async fn append_to(
        &self,
        handle: &Arc<SessionHandle>,
        direction: Direction,
        kind: EventKind,
        payload: Value,
    ) -> SessionResult<u64> {
        let _guard = handle.append_lock.lock().await;
        let event = handle.log.prepare(direction, kind, payload);

        let mut record = handle.to_record();
        record.events.push(event.clone());
        if let Err(err) = self.backend.save_one(record).await {
            tracing::error!(session = %handle.id(), %err, "persistence failed, evicting session");
            self.evict_with(handle.id(), &ProtocolError::SessionClosed)
                .await;
            return Err(err);
        }

        let seq = handle.log.commit(event);
        handle.touch(now_ms());
        Ok(seq)
    }

    /// Bump a session's activity clock. Returns `false` for unknown ids.
    pub async fn touch(&self, id: &SessionId) -> bool {
        match self.get(id).await {
            Some(handle) => {
                handle.touch(now_ms());
                true
            }
            None => false,
        }
    }

    /// Drop a session: close its subscribers, reject its pending requests
    /// with `SessionClosed`, and remove its durable record.
    pub async fn evict(&self, id: &SessionId) -> bool {
        self.evict_with(id, &ProtocolError::SessionClosed).await
    }

    async fn evict_with(&self, id: &SessionId, error: &ProtocolError) -> bool {
        let handle = self.sessions.lock().remove(id);
        let Some(handle) = handle else { return false };
        handle.log.close();
        handle.requests.reject_all(error);
        if let Err(err) = self.backend.delete_one(id).await {
            tracing::warn!(session = %id, %err, "failed to delete durable session record");
        }
        tracing::debug!(session = %id, %error, "session evicted");
        true
    }

    /// Evict every session idle past the inactivity timeout, rejecting its
    /// pending requests with `SessionExpired`, and prune live sessions'
    /// retention windows.
    pub async fn gc_tick(&self, now_ms: u64) -> Vec<SessionId> {
        let (expired, live): (Vec<_>, Vec<_>) = {
            let sessions = self.sessions.lock();
            sessions.values().cloned().partition(|handle| {
                handle.is_expired(now_ms, self.config.inactivity_timeout_ms)
            })
        };

        let mut evicted = Vec::with_capacity(expired.len());
        for handle in expired {
            if self
                .evict_with(handle.id(), &ProtocolError::SessionExpired)
                .await
            {
                evicted.push(handle.id().clone());
            }
        }
        for handle in live {
            handle.log.prune(now_ms, self.config.resume_timeout_ms);
        }
        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), "gc evicted inactive sessions");
        }
        evicted
    }

    /// Surface events another process appended to the shared backend.
    ///
    /// Only events contiguous with the local tail are published, so nothing
    /// a local append already delivered is delivered again.
    pub async fn poll_tick(&self) {
        let handles: Vec<_> = self.sessions.lock().values().cloned().collect();
        for handle in handles {
            let record = match self.backend.load_one(handle.id()).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(session = %handle.id(), %err, "poll load failed");
                    continue;
                }
            };
            let _guard = handle.append_lock.lock().await;
            let local_tail = handle.log.last_seq();
            for event in record.events {
                if event.seq > local_tail {
                    let occurred_at = event.occurred_at;
                    if handle.log.commit_external(event) {
                        handle.touch(occurred_at);
                    }
                }
            }
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether [`SessionStore::shutdown`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Spawn the periodic GC task. Stops on [`SessionStore::shutdown`].
    pub fn spawn_gc(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(store.config.gc_interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!("session gc task started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if store.closed.load(Ordering::Acquire) {
                            break;
                        }
                        store.gc_tick(now_ms()).await;
                    }
                    _ = store.shutdown.notified() => break,
                }
            }
            tracing::info!("session gc task stopped");
        })
    }

    /// Spawn the backend polling task. Stops on [`SessionStore::shutdown`].
    pub fn spawn_poll(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(store.config.pull_interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!("session poll task started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if store.closed.load(Ordering::Acquire) {
                            break;
                        }
                        store.poll_tick().await;
                    }
                    _ = store.shutdown.notified() => break,
                }
            }
            tracing::info!("session poll task stopped");
        })
    }

    /// Drain the store: stop background tasks, reject every pending request
    /// with `SessionClosed`, and close every subscriber stream. Durable
    /// records are left in place for a later restart.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
        let drained: Vec<_> = {
            let mut sessions = self.sessions.lock();
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        for handle in drained {
            handle.log.close();
            handle.requests.clear();
        }
        tracing::info!("session store shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::log::LogDelivery;
    use serde_json::json;

    fn memory_store(config: StoreConfig) -> Arc<SessionStore> {
        SessionStore::new(Arc::new(MemoryBackend::new()), config)
    }

    #[tokio::test]
    async fn create_get_evict() {
        let store = memory_store(StoreConfig::default());
        let handle = store.create().await.unwrap();
        let id = handle.id().clone();

        assert!(store.get(&id).await.is_some());
        assert!(store.evict(&id).await);
        assert!(store.get(&id).await.is_none());
        assert!(!store.evict(&id).await);
    }

    #[tokio::test]
    async fn append_updates_activity_and_seq() {
        let store = memory_store(StoreConfig::default());
        let handle = store.create().await.unwrap();
        let id = handle.id().clone();

        let s1 = store
            .append(&id, Direction::Inbound, EventKind::Request, json!({"m": 1}))
            .await
            .unwrap();
        let s2 = store
            .append(&id, Direction::Outbound, EventKind::Response, json!({"m": 2}))
            .await
            .unwrap();
        assert_eq!((s1, s2), (1, 2));
        assert!(handle.last_activity() >= handle.created_at());
    }

    #[tokio::test]
    async fn last_activity_tracks_events() {
        let store = memory_store(StoreConfig::default());
        let handle = store.create().await.unwrap();
        store
            .append_to(&handle, Direction::Inbound, EventKind::Request, json!({}))
            .await
            .unwrap();
        let events = handle.log().events();
        let max_occurred = events.iter().map(|e| e.occurred_at).max().unwrap();
        assert_eq!(
            handle.last_activity(),
            handle.created_at().max(max_occurred)
        );
    }

    #[tokio::test]
    async fn gc_evicts_idle_sessions_and_rejects_pending() {
        let config = StoreConfig::default().with_inactivity_timeout_ms(1_000);
        let store = memory_store(config);
        let handle = store.create().await.unwrap();
        let id = handle.id().clone();

        let (_, _, waiter) = handle.requests().create_request("tools/call", None);

        let t = handle.last_activity();
        let evicted = store.gc_tick(t + 2_000).await;
        assert_eq!(evicted, vec![id.clone()]);
        assert!(store.get(&id).await.is_none());

        let err = waiter.wait().await.unwrap_err();
        assert!(matches!(err, ProtocolError::SessionExpired));
    }

    #[tokio::test]
    async fn gc_keeps_active_sessions() {
        let config = StoreConfig::default().with_inactivity_timeout_ms(1_000);
        let store = memory_store(config);
        let handle = store.create().await.unwrap();
        let evicted = store.gc_tick(handle.last_activity() + 500).await;
        assert!(evicted.is_empty());
        assert_eq!(store.session_count(), 1);
    }

    #[tokio::test]
    async fn eviction_closes_subscribers_cleanly() {
        let store = memory_store(StoreConfig::default());
        let handle = store.create().await.unwrap();
        store
            .append_to(&handle, Direction::Outbound, EventKind::Notification, json!({}))
            .await
            .unwrap();

        let mut sub = handle.subscribe(1);
        assert!(matches!(sub.recv().await, Some(LogDelivery::Event(_))));

        store.evict(handle.id()).await;
        // Clean end, not a Gap.
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn hydration_from_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let store = SessionStore::new(
            Arc::clone(&backend) as Arc<dyn StorageBackend>,
            StoreConfig::default(),
        );
        let handle = store.create().await.unwrap();
        let id = handle.id().clone();
        store
            .append_to(&handle, Direction::Inbound, EventKind::Request, json!({"a": 1}))
            .await
            .unwrap();

        // A second store over the same backend sees the session.
        let other = SessionStore::open(backend, StoreConfig::default())
            .await
            .unwrap();
        let hydrated = other.get(&id).await.unwrap();
        assert_eq!(hydrated.log().last_seq(), 1);
        assert_eq!(hydrated.created_at(), handle.created_at());
    }

    #[tokio::test]
    async fn poll_surfaces_external_events_exactly_once() {
        let backend = Arc::new(MemoryBackend::new());
        let writer = SessionStore::new(
            Arc::clone(&backend) as Arc<dyn StorageBackend>,
            StoreConfig::default(),
        );
        let handle = writer.create().await.unwrap();
        let id = handle.id().clone();
        writer
            .append_to(&handle, Direction::Outbound, EventKind::Notification, json!({"n": 1}))
            .await
            .unwrap();

        let reader = SessionStore::open(
            Arc::clone(&backend) as Arc<dyn StorageBackend>,
            StoreConfig::default(),
        )
        .await
        .unwrap();
        let local = reader.get(&id).await.unwrap();
        let mut sub = local.subscribe(1);
        let Some(LogDelivery::Event(first)) = sub.recv().await else {
            panic!("expected hydrated event");
        };
        assert_eq!(first.seq, 1);

        // The writer appends two more; the reader polls them in.
        for n in [2, 3] {
            writer
                .append_to(&handle, Direction::Outbound, EventKind::Notification, json!({"n": n}))
                .await
                .unwrap();
        }
        reader.poll_tick().await;
        reader.poll_tick().await; // A second poll must not re-deliver.

        let Some(LogDelivery::Event(second)) = sub.recv().await else {
            panic!("expected polled event");
        };
        let Some(LogDelivery::Event(third)) = sub.recv().await else {
            panic!("expected polled event");
        };
        assert_eq!((second.seq, third.seq), (2, 3));
        assert_eq!(local.log().last_seq(), 3);
    }

    #[tokio::test]
    async fn shutdown_drains_everything() {
        let store = memory_store(StoreConfig::default());
        let handle = store.create().await.unwrap();
        let (_, _, waiter) = handle.requests().create_request("ping", None);
        let mut sub = handle.subscribe(1);

        store.shutdown();
        assert_eq!(store.session_count(), 0);
        assert!(matches!(
            waiter.wait().await,
            Err(ProtocolError::SessionClosed)
        ));
        assert_eq!(sub.recv().await, None);
    }
}
