//! Per-connection session state and the serialized send path.
//!
//! A [`Session`] exclusively owns its transport handle through the
//! [`EnvelopeSink`] seam. Nothing else may write to the socket: every
//! outbound envelope goes through [`Session::send`], which stamps
//! `sessionID`/`timestamp` and performs the write under the session's write
//! lock. That lock is the only thing standing between concurrent dispatch
//! tasks and interleaved frames, so it stays here and nowhere else.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

use trellis_protocol::envelope::timestamp_millis;
use trellis_protocol::Envelope;

use crate::error::CoreError;

/// Write side of a transport. The server implements this for its socket
/// type; tests implement it with a capture buffer. Only `Send` is required:
/// the session's write mutex is the sole owner.
#[async_trait]
pub trait EnvelopeSink: Send {
    /// Write one encoded envelope as a single text frame.
    async fn send(&mut self, text: String) -> Result<(), CoreError>;

    /// Close the transport. Idempotent; errors are swallowed by the caller.
    async fn close(&mut self);
}

/// Principal bound to a session at authentication time.
#[derive(Debug, Clone)]
struct BoundPrincipal {
    user: String,
    is_admin: bool,
    issued_token: String,
}

/// Server-side state for one live persistent connection.
pub struct Session {
    /// Server-generated identifier, immutable for the session's life.
    id: String,
    /// Tenant tag derived from the Host header at connect time.
    vhost: String,
    /// Remote peer, for logging only.
    remote_addr: String,
    /// Exclusively owned transport handle; the mutex is the write lock.
    sink: Mutex<Box<dyn EnvelopeSink>>,
    /// Milliseconds since epoch of the last non-keepalive inbound message.
    last_activity: AtomicI64,
    /// Close-once guard.
    closing: AtomicBool,
    /// Set atomically with authentication, cleared never.
    principal: std::sync::Mutex<Option<BoundPrincipal>>,
    /// Bounds concurrent dispatch units for this session.
    dispatch_permits: Arc<Semaphore>,
}

impl Session {
    /// Create a session wrapping the given transport.
    #[must_use]
    pub fn new(
        vhost: impl Into<String>,
        remote_addr: impl Into<String>,
        sink: Box<dyn EnvelopeSink>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            vhost: vhost.into(),
            remote_addr: remote_addr.into(),
            sink: Mutex::new(sink),
            last_activity: AtomicI64::new(timestamp_millis()),
            closing: AtomicBool::new(false),
            principal: std::sync::Mutex::new(None),
            dispatch_permits: Arc::new(Semaphore::new(max_in_flight)),
        }
    }

    /// The session identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The tenant this connection belongs to.
    #[must_use]
    pub fn vhost(&self) -> &str {
        &self.vhost
    }

    /// The remote peer address.
    #[must_use]
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Permits bounding concurrent dispatch units for this session.
    #[must_use]
    pub fn dispatch_permits(&self) -> Arc<Semaphore> {
        Arc::clone(&self.dispatch_permits)
    }

    /// Stamp and write one envelope. Serialized per session; callers never
    /// touch the transport directly.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closing`] if the session is shutting down, or
    /// [`CoreError::SendFailed`] if the transport write fails. Either way
    /// the caller decides whether that is fatal.
    pub async fn send(&self, mut envelope: Envelope) -> Result<(), CoreError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(CoreError::Closing);
        }

        envelope.session_id = Some(self.id.clone());
        envelope.timestamp = Some(timestamp_millis());
        let text = trellis_protocol::encode(&envelope)?;

        let mut sink = self.sink.lock().await;
        // Re-check under the lock; close() holds it while tearing down.
        if self.closing.load(Ordering::Acquire) {
            return Err(CoreError::Closing);
        }
        sink.send(text).await
    }

    /// Record activity now. Keepalive traffic deliberately never calls this.
    pub fn touch(&self) {
        self.last_activity.store(timestamp_millis(), Ordering::Release);
    }

    /// Milliseconds since epoch of the last recorded activity.
    #[must_use]
    pub fn last_activity_millis(&self) -> i64 {
        self.last_activity.load(Ordering::Acquire)
    }

    /// Backdate the activity clock. Test hook for idle-path coverage.
    #[cfg(test)]
    pub(crate) fn set_last_activity_millis(&self, millis: i64) {
        self.last_activity.store(millis, Ordering::Release);
    }

    /// How long the session has been idle relative to `now_millis`.
    #[must_use]
    pub fn idle_millis(&self, now_millis: i64) -> i64 {
        (now_millis - self.last_activity_millis()).max(0)
    }

    /// Bind the authenticated principal and its token, atomically.
    pub fn bind_principal(&self, user: impl Into<String>, is_admin: bool, token: impl Into<String>) {
        let mut principal = self.principal.lock().expect("principal lock poisoned");
        *principal = Some(BoundPrincipal {
            user: user.into(),
            is_admin,
            issued_token: token.into(),
        });
    }

    /// Replace the issued token after a proactive refresh.
    pub fn replace_token(&self, token: impl Into<String>) {
        let mut principal = self.principal.lock().expect("principal lock poisoned");
        if let Some(bound) = principal.as_mut() {
            bound.issued_token = token.into();
        }
    }

    /// The authenticated user, if any.
    #[must_use]
    pub fn user(&self) -> Option<String> {
        self.principal
            .lock()
            .expect("principal lock poisoned")
            .as_ref()
            .map(|p| p.user.clone())
    }

    /// The privilege flag bound at authentication time.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.principal
            .lock()
            .expect("principal lock poisoned")
            .as_ref()
            .is_some_and(|p| p.is_admin)
    }

    /// The most recently issued credential, kept for refresh correlation.
    #[must_use]
    pub fn issued_token(&self) -> Option<String> {
        self.principal
            .lock()
            .expect("principal lock poisoned")
            .as_ref()
            .map(|p| p.issued_token.clone())
    }

    /// Whether close has begun.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Close the transport. Runs at most once; later calls are no-ops.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let user = self.user().unwrap_or_else(|| "unknown".to_string());
        tracing::info!(session = %self.id, %user, "closing session");
        let mut sink = self.sink.lock().await;
        sink.close().await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("vhost", &self.vhost)
            .field("remote_addr", &self.remote_addr)
            .field("closing", &self.is_closing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CaptureSink;

    fn session_with_capture() -> (Session, CaptureSink) {
        let capture = CaptureSink::new();
        let session = Session::new("localhost", "127.0.0.1:1234", capture.boxed(), 32);
        (session, capture)
    }

    #[tokio::test]
    async fn test_send_stamps_session_and_timestamp() {
        let (session, capture) = session_with_capture();

        session
            .send(Envelope::request("seeds", "getInventory"))
            .await
            .unwrap();

        let sent = capture.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].session_id.as_deref(), Some(session.id()));
        assert!(sent[0].timestamp.is_some());
    }

    #[tokio::test]
    async fn test_send_after_close_is_rejected_not_panicking() {
        let (session, capture) = session_with_capture();
        session.close().await;

        let result = session.send(Envelope::request("seeds", "getInventory")).await;
        assert!(matches!(result, Err(CoreError::Closing)));
        assert!(capture.take().is_empty());
        assert!(capture.closed());
    }

    #[tokio::test]
    async fn test_close_runs_once() {
        let (session, capture) = session_with_capture();
        session.close().await;
        session.close().await;
        assert_eq!(capture.close_count(), 1);
    }

    #[tokio::test]
    async fn test_principal_binding() {
        let (session, _capture) = session_with_capture();
        assert!(session.user().is_none());
        assert!(!session.is_admin());

        session.bind_principal("user1", true, "tok-1");
        assert_eq!(session.user().as_deref(), Some("user1"));
        assert!(session.is_admin());
        assert_eq!(session.issued_token().as_deref(), Some("tok-1"));

        session.replace_token("tok-2");
        assert_eq!(session.issued_token().as_deref(), Some("tok-2"));
    }

    #[tokio::test]
    async fn test_touch_advances_last_activity() {
        let (session, _capture) = session_with_capture();
        session.set_last_activity_millis(0);

        session.touch();
        assert!(session.last_activity_millis() > 0);
    }
}
