//! In-Memory Session Store
//!
//! Information Hiding:
//! - HashMap of sessions guarded by an RwLock that is only held for lookup/insert
//! - Each session owns its own history lock and request gate
//! - Data is lost when the process terminates

use super::{Role, Turn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::{Duration, Instant};

struct SessionState {
    turns: Vec<Turn>,
    last_active: Instant,
}

struct Session {
    /// Held for the whole lifetime of one pipeline request
    gate: Arc<Mutex<()>>,
    state: Mutex<SessionState>,
}

impl Session {
    fn new() -> Self {
        Self {
            gate: Arc::new(Mutex::new(())),
            state: Mutex::new(SessionState {
                turns: Vec::new(),
                last_active: Instant::now(),
            }),
        }
    }

    async fn reset(&self, session_id: &str) {
        let mut state = self.state.lock().await;
        let dropped = state.turns.len();
        state.turns.clear();
        state.last_active = Instant::now();
        tracing::debug!(
            "[SessionStore] Reset session '{}' ({} turns dropped)",
            session_id,
            dropped
        );
    }

    async fn append(&self, session_id: &str, turn: Turn) {
        let mut state = self.state.lock().await;

        match state.turns.last() {
            Some(last) if last.role() == turn.role() => {
                tracing::warn!(
                    "[SessionStore] Session '{}' received consecutive '{}' turns",
                    session_id,
                    turn.role()
                );
            }
            None if turn.role() == Role::Assistant => {
                tracing::warn!(
                    "[SessionStore] Session '{}' history starts with an assistant turn",
                    session_id
                );
            }
            _ => {}
        }

        state.turns.push(turn);
        state.last_active = Instant::now();
        tracing::debug!(
            "[SessionStore] Session '{}' now has {} turns",
            session_id,
            state.turns.len()
        );
    }

    async fn snapshot(&self) -> Vec<Turn> {
        self.state.lock().await.turns.clone()
    }
}

/// Process-wide owner of every session's history.
///
/// Single operations (`reset`, `append`) are atomic per session. A pipeline
/// request that needs several operations to stay together takes a
/// [`SessionLease`] through [`HistoryHandle::lease`], which excludes other
/// requests for the same session while leaving all other sessions untouched.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Handle to a session's history, creating an empty one if unseen
    pub async fn get_or_create(&self, session_id: &str) -> HistoryHandle {
        if let Some(session) = self.sessions.read().await.get(session_id) {
            return HistoryHandle {
                session_id: session_id.to_string(),
                session: session.clone(),
            };
        }

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                tracing::debug!("[SessionStore] Created session '{}'", session_id);
                Arc::new(Session::new())
            })
            .clone();

        HistoryHandle {
            session_id: session_id.to_string(),
            session,
        }
    }

    pub async fn reset(&self, session_id: &str) {
        self.get_or_create(session_id).await.session.reset(session_id).await;
    }

    pub async fn append(&self, session_id: &str, turn: Turn) {
        self.get_or_create(session_id)
            .await
            .session
            .append(session_id, turn)
            .await;
    }

    /// Snapshot of a session's history; unknown sessions read as empty
    /// and are not created.
    pub async fn history(&self, session_id: &str) -> Vec<Turn> {
        let session = self.sessions.read().await.get(session_id).cloned();
        match session {
            Some(session) => session.snapshot().await,
            None => Vec::new(),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drop sessions untouched for at least `max_idle`. Sessions someone
    /// still holds a handle to are kept. Returns the number removed.
    pub async fn prune_idle(&self, max_idle: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let now = Instant::now();
        let before = sessions.len();

        sessions.retain(|session_id, session| {
            if Arc::strong_count(session) > 1 {
                return true;
            }
            let idle = match session.state.try_lock() {
                Ok(state) => now.duration_since(state.last_active) >= max_idle,
                Err(_) => false,
            };
            if idle {
                tracing::debug!("[SessionStore] Evicting idle session '{}'", session_id);
            }
            !idle
        });

        before - sessions.len()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared reference to one session's history
#[derive(Clone)]
pub struct HistoryHandle {
    session_id: String,
    session: Arc<Session>,
}

impl HistoryHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn snapshot(&self) -> Vec<Turn> {
        self.session.snapshot().await
    }

    /// Wait for exclusive request access to this session
    pub async fn lease(self) -> SessionLease {
        let gate = self.session.gate.clone().lock_owned().await;
        SessionLease {
            handle: self,
            _gate: gate,
        }
    }
}

/// Exclusive request-scoped access to one session; released on drop
pub struct SessionLease {
    handle: HistoryHandle,
    _gate: OwnedMutexGuard<()>,
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        &self.handle.session_id
    }

    pub async fn reset(&self) {
        self.handle.session.reset(&self.handle.session_id).await;
    }

    pub async fn append(&self, turn: Turn) {
        self.handle
            .session
            .append(&self.handle.session_id, turn)
            .await;
    }

    pub async fn snapshot(&self) -> Vec<Turn> {
        self.handle.snapshot().await
    }
}
