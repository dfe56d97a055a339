//! Login attempt recording.
//!
//! Every authentication attempt is recorded, success or failure, off the
//! response path. Durable storage is an external collaborator behind
//! [`AuditSink`]; the default sink writes structured logs.

use std::sync::atomic::{AtomicU64, Ordering};

/// Receives login attempt records. Implementations must return quickly;
/// anything durable should queue internally.
pub trait AuditSink: Send + Sync {
    /// Record one attempt for `user` over `protocol`.
    fn record_login(&self, user: &str, protocol: &str, success: bool);
}

/// Default sink: structured logs only.
#[derive(Debug, Default)]
pub struct TracingAudit {
    attempts: AtomicU64,
    failures: AtomicU64,
}

impl TracingAudit {
    /// Create a new sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total attempts recorded since startup.
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Failed attempts recorded since startup.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl AuditSink for TracingAudit {
    fn record_login(&self, user: &str, protocol: &str, success: bool) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if success {
            tracing::info!(%user, %protocol, "login succeeded");
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%user, %protocol, "login failed");
        }
    }
}
