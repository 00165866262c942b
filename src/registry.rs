use crate::telemetry::Metrics;
use parking_lot::RwLock;
use std::{collections::HashMap, fmt, net::SocketAddr, sync::Arc, time::Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Opaque identity of one client connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub state: SessionState,
    pub peer: Option<SocketAddr>,
    pub opened_at: Instant,
    cancel: CancellationToken,
}

impl SessionEntry {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Every live session in the process. Entries are added by [`SessionRegistry::register`]
/// and removed when the returned [`SessionHandle`] is dropped.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    metrics: Arc<Metrics>,
}

impl SessionRegistry {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn register(self: &Arc<Self>, peer: Option<SocketAddr>) -> SessionHandle {
        let id = SessionId::new();
        let cancel = CancellationToken::new();
        let entry = SessionEntry {
            state: SessionState::Open,
            peer,
            opened_at: Instant::now(),
            cancel: cancel.clone(),
        };

        self.sessions.write().insert(id, entry);
        self.metrics.record_session_opened();
        tracing::info!(session_id = %id, ?peer, "Session registered");

        SessionHandle {
            id,
            cancel,
            registry: Arc::clone(self),
        }
    }

    pub fn unregister(&self, id: &SessionId) -> Option<SessionEntry> {
        let removed = self.sessions.write().remove(id);
        if let Some(entry) = &removed {
            self.metrics.record_session_closed();
            tracing::info!(
                session_id = %id,
                open_for_ms = entry.opened_at.elapsed().as_millis() as u64,
                "Session unregistered"
            );
        }
        removed
    }

    /// Visits every live session under a read lock. `f` must not register or
    /// unregister sessions.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&SessionId, &SessionEntry),
    {
        for (id, entry) in self.sessions.read().iter() {
            f(id, entry);
        }
    }

    /// Asks every session to close.
    pub fn shutdown(&self) {
        let mut count = 0;
        self.for_each(|_, entry| {
            entry.cancel();
            count += 1;
        });
        tracing::info!(sessions = count, "Cancelled all sessions");
    }

    pub fn state(&self, id: &SessionId) -> Option<SessionState> {
        self.sessions.read().get(id).map(|entry| entry.state)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set_state(&self, id: &SessionId, state: SessionState) {
        if let Some(entry) = self.sessions.write().get_mut(id) {
            entry.state = state;
        }
    }
}

/// Proof of registration. Not `Clone`: exactly one handle exists per entry.
pub struct SessionHandle {
    id: SessionId,
    cancel: CancellationToken,
    registry: Arc<SessionRegistry>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> Option<SessionState> {
        self.registry.state(&self.id)
    }

    pub fn set_state(&self, state: SessionState) {
        tracing::debug!(session_id = %self.id, state = state.as_str(), "Session state changed");
        self.registry.set_state(&self.id, state);
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.registry.unregister(&self.id);
    }
}
