//! Pluggable persistence backends.
//!
//! The session store is polymorphic over a small persistence capability:
//! load everything at startup, load/save/delete one session record. A
//! volatile in-memory backend and a per-session JSON file backend ship here;
//! anything with the same four operations (a KV store, a database table)
//! slots in behind the same trait.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use keelmcp_protocol::NegotiatedState;

use crate::error::{SessionError, SessionResult};
use crate::event::{Event, now_ms};
use crate::id::SessionId;

/// The durable form of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Session id
    pub id: SessionId,
    /// Creation time (Unix ms)
    pub created_at: u64,
    /// Handshake outcome, absent until `initialize` completes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negotiated: Option<NegotiatedState>,
    /// The full event log in seq order
    pub events: Vec<Event>,
}

/// Persistence capability the store is generic over.
///
/// Implementations must preserve event order and stamp `stored_at` on every
/// event they write. Boxed futures keep the trait object-safe so the store
/// can hold `Arc<dyn StorageBackend>`.
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Load every persisted session record.
    fn load_all(
        &self,
    ) -> Pin<Box<dyn Future<Output = SessionResult<Vec<SessionRecord>>> + Send + '_>>;

    /// Load one session record, `None` if unknown.
    fn load_one(
        &self,
        id: &SessionId,
    ) -> Pin<Box<dyn Future<Output = SessionResult<Option<SessionRecord>>> + Send + '_>>;

    /// Persist one session record, replacing any previous version.
    fn save_one(
        &self,
        record: SessionRecord,
    ) -> Pin<Box<dyn Future<Output = SessionResult<()>> + Send + '_>>;

    /// Remove one session record. Unknown ids are not an error.
    fn delete_one(
        &self,
        id: &SessionId,
    ) -> Pin<Box<dyn Future<Output = SessionResult<()>> + Send + '_>>;
}

fn stamp_stored_at(record: &mut SessionRecord) {
    let stamp = now_ms();
    for event in &mut record.events {
        if event.stored_at.is_none() {
            event.stored_at = Some(stamp);
        }
    }
}

/// Volatile backend: records live only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: Mutex<HashMap<SessionId, SessionRecord>>,
}

impl MemoryBackend {
    /// Create an empty volatile backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn load_all(
        &self,
    ) -> Pin<Box<dyn Future<Output = SessionResult<Vec<SessionRecord>>> + Send + '_>> {
        let records: Vec<SessionRecord> = self.records.lock().values().cloned().collect();
        Box::pin(async move { Ok(records) })
    }

    fn load_one(
        &self,
        id: &SessionId,
    ) -> Pin<Box<dyn Future<Output = SessionResult<Option<SessionRecord>>> + Send + '_>> {
        let record = self.records.lock().get(id).cloned();
        Box::pin(async move { Ok(record) })
    }

    fn save_one(
        &self,
        mut record: SessionRecord,
    ) -> Pin<Box<dyn Future<Output = SessionResult<()>> + Send + '_>> {
        stamp_stored_at(&mut record);
        self.records.lock().insert(record.id.clone(), record);
        Box::pin(async move { Ok(()) })
    }

    fn delete_one(
        &self,
        id: &SessionId,
    ) -> Pin<Box<dyn Future<Output = SessionResult<()>> + Send + '_>> {
        self.records.lock().remove(id);
        Box::pin(async move { Ok(()) })
    }
}

/// Durable backend: one pretty-printed JSON file per session.
///
/// Files are named `<sessionId>.json` directly under the configured
/// directory; anything else in the directory is ignored at load time.
#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Create a backend rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> SessionResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &SessionId) -> PathBuf {
        self.dir.join(id.filename())
    }

    fn read_record(&self, path: &std::path::Path) -> SessionResult<SessionRecord> {
        let body = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&body)?)
    }
}

impl StorageBackend for FileBackend {
    fn load_all(
        &self,
    ) -> Pin<Box<dyn Future<Output = SessionResult<Vec<SessionRecord>>> + Send + '_>> {
        let result = (|| {
            let mut records = Vec::new();
            for entry in std::fs::read_dir(&self.dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if SessionId::from_filename(name).is_none() {
                    continue;
                }
                match self.read_record(&entry.path()) {
                    Ok(record) => records.push(record),
                    Err(err) => {
                        tracing::warn!(file = name, %err, "skipping unreadable session file");
                    }
                }
            }
            Ok(records)
        })();
        Box::pin(async move { result })
    }

    fn load_one(
        &self,
        id: &SessionId,
    ) -> Pin<Box<dyn Future<Output = SessionResult<Option<SessionRecord>>> + Send + '_>> {
        let path = self.path_for(id);
        let result = if path.exists() {
            self.read_record(&path).map(Some)
        } else {
            Ok(None)
        };
        Box::pin(async move { result })
    }

    fn save_one(
        &self,
        mut record: SessionRecord,
    ) -> Pin<Box<dyn Future<Output = SessionResult<()>> + Send + '_>> {
        stamp_stored_at(&mut record);
        let path = self.path_for(&record.id);
        let result = (|| {
            let body = serde_json::to_string_pretty(&record)?;
            std::fs::write(&path, body)?;
            Ok(())
        })();
        Box::pin(async move { result })
    }

    fn delete_one(
        &self,
        id: &SessionId,
    ) -> Pin<Box<dyn Future<Output = SessionResult<()>> + Send + '_>> {
        let path = self.path_for(id);
        let result = match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SessionError::Io(err)),
        };
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Direction, EventKind};
    use serde_json::json;

    fn record_with_events(n: u64) -> SessionRecord {
        let id = SessionId::generate();
        let events = (1..=n)
            .map(|seq| Event {
                seq,
                occurred_at: 1000 + seq,
                stored_at: None,
                direction: Direction::Outbound,
                kind: EventKind::Notification,
                payload: json!({"seq": seq}),
            })
            .collect();
        SessionRecord {
            id,
            created_at: 1000,
            negotiated: None,
            events,
        }
    }

    #[tokio::test]
    async fn memory_backend_round_trip() {
        let backend = MemoryBackend::new();
        let record = record_with_events(3);
        let id = record.id.clone();

        backend.save_one(record).await.unwrap();
        let loaded = backend.load_one(&id).await.unwrap().unwrap();
        assert_eq!(loaded.events.len(), 3);
        // stored_at is stamped at write time.
        assert!(loaded.events.iter().all(|e| e.stored_at.is_some()));

        backend.delete_one(&id).await.unwrap();
        assert!(backend.load_one(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();
        let record = record_with_events(2);
        let id = record.id.clone();

        backend.save_one(record).await.unwrap();

        // The file is named <id>.json and pretty-printed with 2-space indent.
        let path = dir.path().join(id.filename());
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("\n  \"id\""));
        assert!(body.contains("\"occurredAt\""));

        let loaded = backend.load_one(&id).await.unwrap().unwrap();
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.events.len(), 2);
        assert_eq!(loaded.events[0].seq, 1);

        backend.delete_one(&id).await.unwrap();
        assert!(backend.load_one(&id).await.unwrap().is_none());
        // Deleting again is fine.
        backend.delete_one(&id).await.unwrap();
    }

    #[tokio::test]
    async fn load_all_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();
        backend.save_one(record_with_events(1)).await.unwrap();
        backend.save_one(record_with_events(1)).await.unwrap();
        std::fs::write(dir.path().join("README.md"), "not a session").unwrap();
        std::fs::write(dir.path().join("short.json"), "{}").unwrap();

        let records = backend.load_all().await.unwrap();
        assert_eq!(records.len(), 2);
    }
}
