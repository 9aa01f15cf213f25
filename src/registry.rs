//! Tracking of live sessions for shutdown fan-out.

use crate::error::{ServerError, SessionError};
use crate::session::SessionHandler;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque token identifying a registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

/// Thread-safe set of active session handlers.
///
/// Entries are added by the dispatcher when a session starts and removed by
/// its worker when `run` finishes, however it finishes. `close_all` drains
/// the set and refuses later registrations, so a session registered while
/// shutdown is in flight never survives it.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<dyn SessionHandler>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Registers a session, returning its token, or `None` once the
    /// registry has been closed. A `None` caller owns the handler's
    /// cleanup.
    pub fn register(&self, handler: Arc<dyn SessionHandler>) -> Option<SessionId> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sessions.insert(id, handler);
        // close_all may have drained between the check and the insert; an
        // entry that lost that race must not linger.
        if self.closed.load(Ordering::Acquire) {
            self.sessions.remove(&id);
            return None;
        }
        Some(id)
    }

    /// Removes a session. Idempotent: shutdown may have drained the entry
    /// already.
    pub fn deregister(&self, id: SessionId) -> bool {
        self.sessions.remove(&id).is_some()
    }

    /// Number of currently tracked sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Closes every tracked session and empties the registry.
    ///
    /// Best-effort: every handler is attempted even if an earlier one
    /// fails; the first failure is escalated afterwards. Returns the number
    /// of handlers closed on full success.
    pub fn close_all(&self) -> Result<usize, ServerError> {
        self.closed.store(true, Ordering::Release);

        let drained: Vec<(SessionId, Arc<dyn SessionHandler>)> = self
            .sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        self.sessions.clear();

        let mut failures = 0usize;
        let mut first: Option<SessionError> = None;
        for (id, handler) in &drained {
            if let Err(e) = handler.close() {
                tracing::error!("failed to close session {:?}: {}", id, e);
                failures += 1;
                if first.is_none() {
                    first = Some(e);
                }
            }
        }

        match first {
            None => Ok(drained.len()),
            Some(first) => Err(ServerError::Shutdown { failures, first }),
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
