//! Request context handed to every handler.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use keelmcp_protocol::{LogLevel, RequestId};
use keelmcp_session::SessionHandle;

/// Context for one handler invocation.
///
/// The abort token fires when the client cancels the request, the session
/// is evicted, or the transport disconnects without resuming. Handlers must
/// check it at suspension points and abandon work once it fires; the engine
/// discards any late result.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// The session the request belongs to
    pub session: Arc<SessionHandle>,
    /// Cancellation signal for this request
    pub abort: CancellationToken,
    /// The inbound request id, absent for notification-driven invocations
    pub request_id: Option<RequestId>,
}

impl RequestContext {
    /// Build a context for a request.
    pub fn new(
        session: Arc<SessionHandle>,
        abort: CancellationToken,
        request_id: Option<RequestId>,
    ) -> Self {
        Self {
            session,
            abort,
            request_id,
        }
    }

    /// Whether the request has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Whether a message at `level` passes the session's minimum log level.
    /// Sessions that never called `logging/setLevel` log everything.
    pub fn should_log(&self, level: LogLevel) -> bool {
        self.session
            .min_log_level()
            .is_none_or(|min| min.allows(level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keelmcp_session::{SessionStore, StoreConfig};
    use std::sync::Arc;

    #[tokio::test]
    async fn log_gate_follows_the_session_level() {
        let store = SessionStore::new(
            Arc::new(keelmcp_session::MemoryBackend::new()),
            StoreConfig::default(),
        );
        let session = store.create().await.unwrap();
        let ctx = RequestContext::new(session, CancellationToken::new(), None);

        assert!(ctx.should_log(LogLevel::Debug));
        ctx.session.set_min_log_level(LogLevel::Warning);
        assert!(!ctx.should_log(LogLevel::Info));
        assert!(ctx.should_log(LogLevel::Error));
    }

    #[tokio::test]
    async fn cancellation_is_observable() {
        let store = SessionStore::new(
            Arc::new(keelmcp_session::MemoryBackend::new()),
            StoreConfig::default(),
        );
        let session = store.create().await.unwrap();
        let ctx = RequestContext::new(session, CancellationToken::new(), None);
        assert!(!ctx.is_cancelled());
        ctx.abort.cancel();
        assert!(ctx.is_cancelled());
    }
}
