//! The session registry: every live connection, by id.
//!
//! The registry is mutated by the accept path (insert), each session's close
//! path (remove), and the idle reaper (iterate + remove), and read by
//! broadcast. All of that lands on one concurrent map behind this interface;
//! the raw map is never exposed.

use std::sync::Arc;

use dashmap::DashMap;

use trellis_protocol::Envelope;

use crate::error::CoreError;
use crate::session::{EnvelopeSink, Session};

/// Default bound on concurrent dispatch units per session.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 32;

/// Owns the set of live sessions.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    max_in_flight: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IN_FLIGHT)
    }
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_in_flight,
        }
    }

    /// Create and insert a session for a newly upgraded connection.
    pub fn create(
        &self,
        vhost: impl Into<String>,
        remote_addr: impl Into<String>,
        sink: Box<dyn EnvelopeSink>,
    ) -> Arc<Session> {
        let session = Arc::new(Session::new(vhost, remote_addr, sink, self.max_in_flight));
        self.sessions
            .insert(session.id().to_string(), Arc::clone(&session));
        tracing::debug!(
            session = %session.id(),
            vhost = %session.vhost(),
            remote = %session.remote_addr(),
            live = self.len(),
            "session established"
        );
        session
    }

    /// Look up a live session.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a session from the registry without touching its transport.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Number of live sessions. Doubles as a liveness metric.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of the live sessions. Taken eagerly so callers never hold
    /// map shard locks across an await.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Close a session's transport and drop it from the registry.
    pub async fn close_session(&self, id: &str) {
        if let Some(session) = self.remove(id) {
            session.close().await;
        }
    }

    /// Address an envelope to a specific session by id.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SessionNotFound`] if the id is not live, or the
    /// session's send error otherwise.
    pub async fn send_to(&self, id: &str, envelope: Envelope) -> Result<(), CoreError> {
        let session = self
            .get(id)
            .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))?;
        session.send(envelope).await
    }

    /// Broadcast to every session except `exclude`.
    ///
    /// Individual send failures are logged and do not abort delivery to the
    /// remaining sessions.
    pub async fn notify_all(&self, exclude: Option<&str>, envelope: &Envelope) {
        for session in self.snapshot() {
            if exclude.is_some_and(|id| id == session.id()) {
                continue;
            }
            if let Err(e) = session.send(envelope.clone()).await {
                tracing::warn!(session = %session.id(), error = %e, "broadcast delivery failed");
            }
        }
    }

    /// Close every session. Called once on process shutdown.
    pub async fn shutdown(&self) {
        let live = self.snapshot();
        tracing::info!(sessions = live.len(), "closing all sessions");
        for session in live {
            session.close().await;
            self.sessions.remove(session.id());
        }
    }
}
