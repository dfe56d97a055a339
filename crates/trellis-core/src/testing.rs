//! Test support: an in-memory [`EnvelopeSink`] that records what was sent.
//!
//! Lives in the crate proper (not behind `cfg(test)`) so integration tests
//! and downstream crates can drive the session layer without a socket.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use trellis_protocol::Envelope;

use crate::error::CoreError;
use crate::session::EnvelopeSink;

/// Records every envelope written to it. Cloning shares the buffer, so a
/// test can keep one handle and give the session the other.
#[derive(Clone, Default)]
pub struct CaptureSink {
    sent: Arc<Mutex<Vec<Envelope>>>,
    closes: Arc<AtomicUsize>,
    fail_sends: Arc<AtomicUsize>,
}

impl CaptureSink {
    /// Create an empty capture sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Box a shared handle for handing to a session.
    #[must_use]
    pub fn boxed(&self) -> Box<dyn EnvelopeSink> {
        Box::new(self.clone())
    }

    /// Drain and return everything sent so far.
    #[must_use]
    pub fn take(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.sent.lock().expect("capture lock poisoned"))
    }

    /// Whether the sink has been closed at least once.
    #[must_use]
    pub fn closed(&self) -> bool {
        self.close_count() > 0
    }

    /// How many times close was called.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }

    /// Make the next `n` sends fail, simulating a dead peer.
    pub fn fail_next_sends(&self, n: usize) {
        self.fail_sends.store(n, Ordering::Release);
    }
}

#[async_trait]
impl EnvelopeSink for CaptureSink {
    async fn send(&mut self, text: String) -> Result<(), CoreError> {
        if self
            .fail_sends
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CoreError::SendFailed("simulated write failure".to_string()));
        }
        let envelope = trellis_protocol::decode(&text)?;
        self.sent.lock().expect("capture lock poisoned").push(envelope);
        Ok(())
    }

    async fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::AcqRel);
    }
}
